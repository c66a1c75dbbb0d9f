//! A record per known remote daemon (spec §3 `Peer`).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::job::{CompilerKey, PeerId};

#[derive(Debug, Clone)]
pub struct PeerHost {
    pub address: IpAddr,
    pub port: u16,
    pub friendly_name: String,
}

#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub host: PeerHost,
    /// What we've told them we have (keys we've advertised via `HasJobs`).
    pub announced: HashSet<CompilerKey>,
    /// What they've told us they have (from scheduler-relayed `HasJobs`).
    pub jobs_available: HashMap<CompilerKey, u32>,
}

impl Peer {
    pub fn new(id: PeerId, host: PeerHost) -> Self {
        Peer { id, host, announced: HashSet::new(), jobs_available: HashMap::new() }
    }

    pub fn note_jobs_available(&mut self, key: CompilerKey, count: u32) {
        if count == 0 {
            self.jobs_available.remove(&key);
        } else {
            self.jobs_available.insert(key, count);
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peers: HashMap<PeerId, Peer>,
    next_id: u64,
}

impl PeerTable {
    pub fn new() -> Self {
        PeerTable { peers: HashMap::new(), next_id: 0 }
    }

    pub fn insert(&mut self, host: PeerHost) -> PeerId {
        let id = PeerId(self.next_id);
        self.next_id += 1;
        self.peers.insert(id, Peer::new(id, host));
        id
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn remove(&mut self, id: PeerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, &Peer)> {
        self.peers.iter()
    }

    pub fn find_by_host(&self, address: IpAddr, port: u16) -> Option<PeerId> {
        self.peers
            .values()
            .find(|p| p.host.address == address && p.host.port == port)
            .map(|p| p.id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::CompilerType;

    #[test]
    fn insert_and_find_by_host() {
        let mut table = PeerTable::new();
        let host = PeerHost { address: "127.0.0.1".parse().unwrap(), port: 5167, friendly_name: "b".into() };
        let id = table.insert(host.clone());
        assert_eq!(table.find_by_host(host.address, host.port), Some(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn note_jobs_available_zero_clears_entry() {
        let mut table = PeerTable::new();
        let host = PeerHost { address: "127.0.0.1".parse().unwrap(), port: 5167, friendly_name: "b".into() };
        let id = table.insert(host);
        let key = CompilerKey::new(CompilerType::GCC, 9, "x86_64");
        table.get_mut(id).unwrap().note_jobs_available(key.clone(), 3);
        assert_eq!(table.get(id).unwrap().jobs_available.get(&key), Some(&3));
        table.get_mut(id).unwrap().note_jobs_available(key.clone(), 0);
        assert!(table.get(id).unwrap().jobs_available.get(&key).is_none());
    }

    #[test]
    fn remove_drops_peer() {
        let mut table = PeerTable::new();
        let host = PeerHost { address: "127.0.0.1".parse().unwrap(), port: 1, friendly_name: "x".into() };
        let id = table.insert(host);
        assert!(table.remove(id).is_some());
        assert!(table.get(id).is_none());
    }
}
