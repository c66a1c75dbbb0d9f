//! The Scheduler (spec §4.9) — central peer registry and `HasJobs`
//! fan-out broker. One process per farm.
//!
//! Same synchronous-core shape as [`crate::dispatcher::Dispatcher`] (spec
//! §9): a plain struct, `&mut self` methods per wire event, `Vec<Action>`
//! describing the sends the event loop in `daemon.rs`/the scheduler binary
//! must perform. The scheduler holds no per-job state at all — it only
//! ever relays `HasJobs` verbatim and tracks who's connected.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::job::ConnId;
use crate::protocol::{Building as BuildingMsg, HasJobs, Message, PeerAnnounce};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SendToPeer { conn_id: ConnId, message: Message },
    /// Surfaced for the stats endpoint (spec §4.11 shim note: out of scope
    /// as a full API, but we still record what's building where).
    RecordBuildingStat { job_id_repr: String, peer: String, file: String, started: bool },
}

#[derive(Debug, Clone)]
struct SchedulerPeer {
    conn_id: ConnId,
    address: IpAddr,
    port: u16,
    friendly_name: String,
}

/// Peer roster keyed by the connection that registered it, per spec §4.9:
/// "listens on a single TCP port, maintains `peers: Set<PeerRef>`".
#[derive(Debug, Default)]
pub struct Scheduler {
    peers: HashMap<ConnId, SchedulerPeer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler { peers: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// A daemon has connected and sent its `Peer{friendly_name, port, jobs}`
    /// handshake (spec §4.4, §6 tag 11).
    pub fn on_peer_announce(&mut self, conn_id: ConnId, address: IpAddr, msg: PeerAnnounce) {
        self.peers.insert(
            conn_id,
            SchedulerPeer { conn_id, address, port: msg.port, friendly_name: msg.friendly_name },
        );
    }

    /// Fans `msg` out to every *other* connected peer, verbatim, per spec
    /// §4.9. `peer_address`/`port` are rewritten to the originating
    /// connection's observed address so a recipient always has a reachable
    /// return path, even if the sender didn't know its own externally
    /// visible IP.
    pub fn on_has_jobs(&mut self, conn_id: ConnId, mut msg: HasJobs) -> Vec<Action> {
        let Some(origin) = self.peers.get(&conn_id) else { return Vec::new() };
        msg.peer_address = origin.address.to_string();
        msg.port = origin.port;

        self.peers
            .values()
            .filter(|p| p.conn_id != conn_id)
            .map(|p| Action::SendToPeer { conn_id: p.conn_id, message: Message::HasJobs(msg.clone()) })
            .collect()
    }

    /// Building start/stop stats (spec §4.4 tag 18): recorded for the stats
    /// surface, not relayed to other peers.
    pub fn on_building(&mut self, conn_id: ConnId, msg: BuildingMsg) -> Vec<Action> {
        let peer = self.peers.get(&conn_id).map(|p| p.friendly_name.clone()).unwrap_or_default();
        vec![Action::RecordBuildingStat {
            job_id_repr: format!("{:?}", msg.job_id),
            peer,
            file: msg.file,
            started: matches!(msg.event, crate::protocol::BuildingEvent::Start),
        }]
    }

    /// Evicts the peer on disconnect. No cancellation is sent to anyone
    /// else (spec §4.9): daemons discover a dead peer lazily, via their own
    /// reschedule timeout or a failed socket write.
    pub fn on_peer_disconnected(&mut self, conn_id: ConnId) {
        self.peers.remove(&conn_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::CompilerType;
    use crate::protocol::{BuildingEvent, HasJobs};
    use crate::job::{CompilerKey, JobId};

    fn addr() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn has_jobs_fans_out_to_every_other_peer_verbatim() {
        let mut s = Scheduler::new();
        s.on_peer_announce(ConnId(1), addr(), PeerAnnounce { friendly_name: "a".into(), port: 5167, jobs: 0 });
        s.on_peer_announce(ConnId(2), "10.0.0.2".parse().unwrap(), PeerAnnounce { friendly_name: "b".into(), port: 5167, jobs: 0 });
        s.on_peer_announce(ConnId(3), "10.0.0.3".parse().unwrap(), PeerAnnounce { friendly_name: "c".into(), port: 5167, jobs: 0 });

        let msg = HasJobs {
            compiler_key: CompilerKey::new(CompilerType::GCC, 9, "x86_64-linux-gnu"),
            count: 3,
            port: 0,
            peer_address: String::new(),
        };
        let actions = s.on_has_jobs(ConnId(1), msg);
        assert_eq!(actions.len(), 2);
        for action in &actions {
            let Action::SendToPeer { conn_id, message: Message::HasJobs(relayed) } = action else { panic!("wrong action") };
            assert_ne!(*conn_id, ConnId(1));
            assert_eq!(relayed.peer_address, "10.0.0.1");
            assert_eq!(relayed.port, 5167);
            assert_eq!(relayed.count, 3);
        }
    }

    #[test]
    fn has_jobs_from_unknown_connection_is_ignored() {
        let mut s = Scheduler::new();
        s.on_peer_announce(ConnId(2), "10.0.0.2".parse().unwrap(), PeerAnnounce { friendly_name: "b".into(), port: 5167, jobs: 0 });
        let msg = HasJobs {
            compiler_key: CompilerKey::new(CompilerType::GCC, 9, "x86_64-linux-gnu"),
            count: 1,
            port: 0,
            peer_address: String::new(),
        };
        assert!(s.on_has_jobs(ConnId(99), msg).is_empty());
    }

    #[test]
    fn disconnect_evicts_without_notifying_others() {
        let mut s = Scheduler::new();
        s.on_peer_announce(ConnId(1), addr(), PeerAnnounce { friendly_name: "a".into(), port: 5167, jobs: 0 });
        assert_eq!(s.len(), 1);
        s.on_peer_disconnected(ConnId(1));
        assert!(s.is_empty());
    }

    #[test]
    fn building_stat_is_recorded_with_peer_name() {
        let mut s = Scheduler::new();
        s.on_peer_announce(ConnId(1), addr(), PeerAnnounce { friendly_name: "builder-1".into(), port: 5167, jobs: 0 });
        let actions = s.on_building(
            ConnId(1),
            BuildingMsg { event: BuildingEvent::Start, job_id: JobId(7), peer: String::new(), file: "hello.c".into() },
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], Action::RecordBuildingStat { peer, file, started: true, .. } if peer == "builder-1" && file == "hello.c"));
    }
}
