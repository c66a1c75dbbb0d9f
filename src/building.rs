//! `Building` and `OutstandingJobRequest` indexes (spec §3, §4.8).

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::job::{CompilerKey, JobId, PeerId};

#[derive(Debug, Clone, Copy)]
pub struct Building {
    pub started_monotonic_ms: u64,
    pub job_id: JobId,
    pub serial: u32,
    pub peer_id: PeerId,
}

/// Per in-flight remote-pending/remote-receiving job, indexed two ways:
/// oldest-first for the reschedule sweep, and by job id for response/discard
/// lookup (spec §3).
#[derive(Debug, Default)]
pub struct BuildingTable {
    by_time: BTreeMap<(u64, JobId), Building>,
    by_id: HashMap<JobId, (u64, JobId)>,
}

impl BuildingTable {
    pub fn new() -> Self {
        BuildingTable { by_time: BTreeMap::new(), by_id: HashMap::new() }
    }

    pub fn insert(&mut self, b: Building) {
        let time_key = (b.started_monotonic_ms, b.job_id);
        self.by_id.insert(b.job_id, time_key);
        self.by_time.insert(time_key, b);
    }

    pub fn get(&self, job_id: JobId) -> Option<&Building> {
        self.by_id.get(&job_id).and_then(|k| self.by_time.get(k))
    }

    pub fn remove(&mut self, job_id: JobId) -> Option<Building> {
        let time_key = self.by_id.remove(&job_id)?;
        self.by_time.remove(&time_key)
    }

    /// Entries tied to `peer_id`, oldest first. Used for hard rescheduling
    /// on peer disconnect (spec §4.8, §5 cancellation semantics).
    pub fn entries_for_peer(&self, peer_id: PeerId) -> Vec<Building> {
        self.by_time.values().filter(|b| b.peer_id == peer_id).cloned().collect()
    }

    /// All entries, oldest first.
    pub fn entries_for_all(&self) -> Vec<Building> {
        self.by_time.values().cloned().collect()
    }

    /// Entries whose age has crossed `reschedule_timeout_ms * max(1, serial)`,
    /// oldest first (spec §4.8).
    pub fn timed_out(&self, now_ms: u64, reschedule_timeout_ms: u64) -> Vec<Building> {
        self.by_time
            .values()
            .filter(|b| {
                let deadline = b.started_monotonic_ms
                    + reschedule_timeout_ms * (b.serial.max(1) as u64);
                now_ms >= deadline
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_time.is_empty()
    }
}

/// Record of a `RequestJobs` sent to a peer (spec §3). Expires at 10s
/// (spec §5).
#[derive(Debug, Clone, Copy)]
pub struct OutstandingJobRequest {
    pub request_id: Uuid,
    pub sent_monotonic_ms: u64,
    pub peer_id: PeerId,
    pub compiler_key_hash: u64,
}

#[derive(Debug, Default)]
pub struct OutstandingTable {
    requests: HashMap<Uuid, OutstandingJobRequest>,
}

impl OutstandingTable {
    pub fn new() -> Self {
        OutstandingTable { requests: HashMap::new() }
    }

    pub fn insert(&mut self, req: OutstandingJobRequest) {
        self.requests.insert(req.request_id, req);
    }

    pub fn remove(&mut self, request_id: &Uuid) -> Option<OutstandingJobRequest> {
        self.requests.remove(request_id)
    }

    pub fn has_outstanding_for(&self, peer_id: PeerId, key: &CompilerKey) -> bool {
        let key_hash = hash_key(key);
        self.requests.values().any(|r| r.peer_id == peer_id && r.compiler_key_hash == key_hash)
    }

    /// Requests older than 10s (spec §5), removed and returned so the
    /// caller can return their slots to `free_slots`.
    pub fn expire(&mut self, now_ms: u64, expiry_ms: u64) -> Vec<OutstandingJobRequest> {
        let expired: Vec<Uuid> = self
            .requests
            .iter()
            .filter(|(_, r)| now_ms.saturating_sub(r.sent_monotonic_ms) >= expiry_ms)
            .map(|(id, _)| *id)
            .collect();
        expired.into_iter().filter_map(|id| self.requests.remove(&id)).collect()
    }
}

pub fn hash_key(key: &CompilerKey) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::CompilerType;

    fn key() -> CompilerKey {
        CompilerKey::new(CompilerType::GCC, 9, "x86_64")
    }

    #[test]
    fn timed_out_respects_serial_backoff() {
        let mut table = BuildingTable::new();
        table.insert(Building { started_monotonic_ms: 0, job_id: JobId(1), serial: 1, peer_id: PeerId(0) });
        table.insert(Building { started_monotonic_ms: 0, job_id: JobId(2), serial: 2, peer_id: PeerId(0) });

        // At t=1500 with a 1000ms base timeout, only the serial=1 job is due.
        let due = table.timed_out(1500, 1000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].job_id, JobId(1));

        // At t=2000 both are due (serial=2 needs 2000ms).
        let due = table.timed_out(2000, 1000);
        assert_eq!(due.len(), 2);
    }

    #[test]
    fn entries_for_peer_filters_correctly() {
        let mut table = BuildingTable::new();
        table.insert(Building { started_monotonic_ms: 0, job_id: JobId(1), serial: 0, peer_id: PeerId(0) });
        table.insert(Building { started_monotonic_ms: 0, job_id: JobId(2), serial: 0, peer_id: PeerId(1) });
        assert_eq!(table.entries_for_peer(PeerId(0)).len(), 1);
        assert_eq!(table.entries_for_peer(PeerId(1)).len(), 1);
    }

    #[test]
    fn remove_drops_from_both_indexes() {
        let mut table = BuildingTable::new();
        table.insert(Building { started_monotonic_ms: 5, job_id: JobId(9), serial: 0, peer_id: PeerId(0) });
        assert!(table.get(JobId(9)).is_some());
        assert!(table.remove(JobId(9)).is_some());
        assert!(table.get(JobId(9)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn outstanding_requests_expire_after_threshold() {
        let mut table = OutstandingTable::new();
        let req = OutstandingJobRequest {
            request_id: Uuid::new_v4(),
            sent_monotonic_ms: 0,
            peer_id: PeerId(0),
            compiler_key_hash: hash_key(&key()),
        };
        table.insert(req);
        assert!(table.has_outstanding_for(PeerId(0), &key()));
        assert!(table.expire(5_000, 10_000).is_empty());
        let expired = table.expire(10_000, 10_000);
        assert_eq!(expired.len(), 1);
        assert!(!table.has_outstanding_for(PeerId(0), &key()));
    }
}
