//! The Local Dispatcher (spec §4.5) — the heart of the daemon. A
//! per-daemon singleton holding the four job queues, the per-peer
//! `pending_build`/`building_*` indexes, and the `start_jobs` event that
//! re-runs after every state change.
//!
//! Per the design note in spec §9, this is a synchronous core: every public
//! method takes `&mut self` plus whatever inputs the triggering event
//! carried, and returns a `Vec<Action>` describing the I/O the caller (the
//! event loop in `daemon.rs`) must now perform. Nothing here touches a
//! socket or spawns a process directly, which is what makes it possible to
//! unit-test the whole state machine deterministically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsString;
use std::path::PathBuf;

use uuid::Uuid;

use crate::building::{hash_key, Building, BuildingTable, OutstandingJobRequest, OutstandingTable};
use crate::compiler_args::{parse_args, CompilerArgs, CompilerArguments};
use crate::job::{CompilerKey, ConnId, Job, JobId, JobOrigin, PeerId, Status};
use crate::peer::{PeerHost, PeerTable};
use crate::protocol::{
    BuildingEvent, ClientJobResponseBody, HasJobs as HasJobsMsg,
    JobDiscarded as JobDiscardedMsg, JobMessage as JobMessageMsg, JobResponse as JobResponseMsg,
    JobResponseMode, LastJob as LastJobMsg, Message, RequestJobs as RequestJobsMsg,
};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub preprocess_count: usize,
    pub job_count: usize,
    pub overcommit: usize,
    pub max_preprocess_pending: usize,
    pub reschedule_timeout_ms: u64,
    pub reschedule_check_ms: u64,
    pub outstanding_request_expiry_ms: u64,
    pub local_port: u16,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            preprocess_count: num_cpus::get().max(1),
            job_count: num_cpus::get().max(1),
            overcommit: 0,
            max_preprocess_pending: 10,
            reschedule_timeout_ms: 15_000,
            reschedule_check_ms: 2_500,
            outstanding_request_expiry_ms: 10_000,
            local_port: 5167,
        }
    }
}

/// Effects the event loop must carry out in response to a dispatcher call.
/// The dispatcher never performs I/O itself (spec §9 design note).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SpawnPreprocess { job_id: JobId },
    SpawnCompileLocal { job_id: JobId, speculative: bool },
    SpawnCompileRemoteServe { job_id: JobId },
    KillProcess { job_id: JobId },
    SendToShim { conn_id: ConnId, response: ClientJobResponseBody },
    SendToPeer { peer_id: PeerId, message: Message },
    ConnectToPeer { address: String, port: u16 },
    AnnounceToScheduler { compiler_key: CompilerKey, count: u32 },
    PublishBuildingStat { event: BuildingEvent, job_id: JobId, peer: String, file: String },
    WriteOutputFile { job_id: JobId, path: PathBuf, bytes: Vec<u8> },
    RemoveJob { job_id: JobId },
}

/// Everything the dispatcher needs about a freshly-arrived `ClientJob` that
/// lives "outside" the core spec (argument resolution, see spec §4.12/4.13).
pub struct NewLocalJob {
    pub argv: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(OsString, OsString)>,
    pub resolved_compiler_path: PathBuf,
    pub compiler_args: CompilerArgs,
    pub compiler_key: CompilerKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Preprocess,
    CompileLocal,
    CompileRemoteServe,
}

pub struct ProcessOutcome {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// For `Preprocess`, the preprocessed bytes; for `CompileRemoteServe`,
    /// the compiled object bytes. Unused for `CompileLocal` (the compiler
    /// already wrote the real output file itself).
    pub artifact: Vec<u8>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    jobs: HashMap<JobId, Job>,
    next_job_id: u64,

    pending_preprocess: VecDeque<JobId>,
    preprocessing: HashSet<JobId>,
    pending_preprocess_hold: VecDeque<JobId>,

    pending_compile: VecDeque<JobId>,
    compiling: HashSet<JobId>,
    /// Local-origin jobs racing a remote peer: a speculative local compile
    /// is in flight even though the job's canonical status is still
    /// `RemotePending`/`RemoteReceiving` (spec §4.5 step 3).
    speculative_local: HashSet<JobId>,

    /// Jobs whose `preprocessed` buffer currently counts against
    /// `max_preprocess_pending` (spec §4.7).
    preprocess_pending: HashSet<JobId>,

    pending_build: HashMap<CompilerKey, VecDeque<JobId>>,
    building: BuildingTable,
    outstanding: OutstandingTable,

    peers: PeerTable,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Dispatcher {
            config,
            jobs: HashMap::new(),
            next_job_id: 0,
            pending_preprocess: VecDeque::new(),
            preprocessing: HashSet::new(),
            pending_preprocess_hold: VecDeque::new(),
            pending_compile: VecDeque::new(),
            compiling: HashSet::new(),
            speculative_local: HashSet::new(),
            preprocess_pending: HashSet::new(),
            pending_build: HashMap::new(),
            building: BuildingTable::new(),
            outstanding: OutstandingTable::new(),
            peers: PeerTable::new(),
        }
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut PeerTable {
        &mut self.peers
    }

    pub fn preprocess_pending_count(&self) -> usize {
        self.preprocess_pending.len()
    }

    // ---- ingestion -------------------------------------------------

    pub fn on_client_job(&mut self, conn_id: ConnId, new_job: NewLocalJob, now_ms: u64) -> (JobId, Vec<Action>) {
        let id = JobId(self.next_job_id);
        self.next_job_id += 1;
        let job = Job::new_local(
            id,
            new_job.argv,
            new_job.cwd,
            new_job.env,
            new_job.resolved_compiler_path,
            new_job.compiler_args,
            new_job.compiler_key,
            conn_id,
            now_ms,
        );
        self.jobs.insert(id, job);
        self.pending_preprocess.push_back(id);
        self.jobs.get_mut(&id).unwrap().transition(Status::PendingPreprocessing);
        (id, self.start_jobs(now_ms))
    }

    pub fn on_job_message(&mut self, peer_id: PeerId, msg: JobMessageMsg, now_ms: u64) -> Vec<Action> {
        let argv: Vec<OsString> = msg.argv.into_iter().map(OsString::from).collect();
        // argv[0] is the compiler's own name (spec §4.11 ClientJob shape,
        // carried verbatim through JobMessage); only argv[1..] are real args.
        let compiler_args = match parse_args(&argv[1..]) {
            CompilerArguments::Ok(args) => args,
            // The peer already validated this job's shape before offering
            // it; a parse failure here just means our parser is stricter.
            // Fall back to a single-source compile guess so the job still
            // runs.
            _ => CompilerArgs::default(),
        };
        let job = Job::new_remote(
            msg.id,
            msg.serial,
            argv,
            PathBuf::from("/"),
            vec![],
            msg.resolved_compiler_path,
            compiler_args,
            msg.compiler_key,
            msg.preprocessed,
            peer_id,
            now_ms,
        );
        let id = job.id;
        self.jobs.insert(id, job);
        self.pending_compile.push_back(id);
        self.jobs.get_mut(&id).unwrap().transition(Status::PendingCompiling);
        self.start_jobs(now_ms)
    }

    // ---- main event (spec §4.5) ------------------------------------

    /// Idempotent; re-run after every state change, socket event, and timer
    /// tick (spec §4.5).
    pub fn start_jobs(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();

        // 1. Drain preprocess queue. Also gated on `max_preprocess_pending`
        // (spec §3: concurrent preprocessed-but-unsent bytes held in memory
        // is capped) so we don't kick off preprocesses whose output we
        // already know we'd have to hold rather than admit.
        while self.preprocessing.len() < self.config.preprocess_count && self.preprocess_pending.len() < self.config.max_preprocess_pending {
            let Some(id) = self.pending_preprocess.pop_front() else { break };
            self.preprocessing.insert(id);
            if let Some(job) = self.jobs.get_mut(&id) {
                job.transition(Status::Preprocessing);
            }
            actions.push(Action::SpawnPreprocess { job_id: id });
        }

        // 2. Drain compile queue. Never start a compile while any preprocess
        // is in flight (spec §4.5 step 2): short preprocesses should win the
        // CPU over network-bound compiles.
        if self.preprocessing.is_empty() {
            while self.compiling.len() < self.config.job_count {
                let Some(id) = self.pending_compile.pop_front() else { break };
                let Some(job) = self.jobs.get(&id) else { continue };
                match job.origin {
                    JobOrigin::Remote => {
                        self.compiling.insert(id);
                        let job = self.jobs.get_mut(&id).unwrap();
                        job.transition(Status::Compiling);
                        let file = job
                            .compiler_args
                            .source_files
                            .first()
                            .map(|p| p.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        actions.push(Action::SpawnCompileRemoteServe { job_id: id });
                        actions.push(Action::PublishBuildingStat {
                            event: BuildingEvent::Start,
                            job_id: id,
                            peer: String::new(),
                            file,
                        });
                    }
                    JobOrigin::Local => {
                        self.remove_from_pending_build(id);
                        self.compiling.insert(id);
                        self.jobs.get_mut(&id).unwrap().transition(Status::Compiling);
                        self.release_preprocess_slot(id);
                        actions.push(Action::SpawnCompileLocal { job_id: id, speculative: false });
                    }
                }
            }
        }

        // 3. Speculative local run of remote-pending jobs.
        if self.pending_preprocess.is_empty() {
            let free_slots = self.config.job_count.saturating_sub(self.compiling.len() + self.speculative_local.len());
            if free_slots > 0 {
                let candidates: Vec<JobId> = self
                    .building
                    .entries_for_all()
                    .into_iter()
                    .filter(|b| !self.speculative_local.contains(&b.job_id))
                    .filter(|b| {
                        self.jobs
                            .get(&b.job_id)
                            .map(|j| j.origin == JobOrigin::Local && j.status == Status::RemotePending)
                            .unwrap_or(false)
                    })
                    .map(|b| b.job_id)
                    .take(free_slots)
                    .collect();
                for id in candidates {
                    self.speculative_local.insert(id);
                    actions.push(Action::SpawnCompileLocal { job_id: id, speculative: true });
                }
            }
        }

        // 4. Announce.
        for (key, queue) in self.pending_build.iter() {
            if queue.is_empty() {
                continue;
            }
            if self.preprocess_pending.len() <= self.config.max_preprocess_pending {
                actions.push(Action::AnnounceToScheduler { compiler_key: key.clone(), count: queue.len() as u32 });
            }
        }

        // 5. Fetch: round-robin a `RequestJobs` to each peer advertising
        // spare capacity we don't already have an outstanding request with.
        let peer_ids: Vec<PeerId> = self.peers.iter().map(|(id, _)| *id).collect();
        for peer_id in peer_ids {
            let Some(peer) = self.peers.get(peer_id) else { continue };
            let free_slots = self
                .config
                .job_count
                .saturating_add(self.config.overcommit)
                .saturating_sub(self.compiling.len());
            if free_slots == 0 {
                continue;
            }
            let candidate_key = peer
                .jobs_available
                .iter()
                .find(|(key, &count)| count > 0 && !self.outstanding.has_outstanding_for(peer_id, key))
                .map(|(key, _)| key.clone());
            if let Some(key) = candidate_key {
                let count = free_slots.min(5) as u32;
                let request_id = Uuid::new_v4();
                self.outstanding.insert(OutstandingJobRequest {
                    request_id,
                    sent_monotonic_ms: now_ms,
                    peer_id,
                    compiler_key_hash: hash_key(&key),
                });
                actions.push(Action::SendToPeer {
                    peer_id,
                    message: Message::RequestJobs(RequestJobsMsg {
                        request_id: *request_id.as_bytes(),
                        compiler_key: key,
                        count,
                    }),
                });
            }
        }

        actions
    }

    fn remove_from_pending_build(&mut self, id: JobId) {
        let Some(job) = self.jobs.get(&id) else { return };
        if let Some(queue) = self.pending_build.get_mut(&job.compiler_key) {
            queue.retain(|j| *j != id);
        }
    }

    /// Releases `id`'s preprocess-pending slot (spec §4.7) and admits the
    /// next held job, if any.
    fn release_preprocess_slot(&mut self, id: JobId) {
        if !self.preprocess_pending.remove(&id) {
            return;
        }
        if let Some(next_id) = self.pending_preprocess_hold.pop_front() {
            self.admit_preprocessed(next_id);
        }
    }

    /// Transitions a just-finished preprocess (or a previously-held one)
    /// all the way to `PendingCompiling`, registering it for remote offer
    /// if the backpressure rule (spec §4.3) allows it.
    fn admit_preprocessed(&mut self, id: JobId) {
        self.preprocess_pending.insert(id);
        let Some(job) = self.jobs.get_mut(&id) else { return };
        job.transition(Status::Preprocessed);
        job.transition(Status::PendingCompiling);
        let remotable = job.compiler_args.is_remotable_shape();
        let key = job.compiler_key.clone();
        self.pending_compile.push_back(id);
        let pool_busy = self.compiling.len() >= self.config.job_count;
        if remotable && pool_busy {
            self.pending_build.entry(key).or_insert_with(VecDeque::new).push_back(id);
        }
    }

    // ---- process completion -----------------------------------------

    pub fn on_process_finished(&mut self, job_id: JobId, kind: ProcessKind, outcome: ProcessOutcome, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        match kind {
            ProcessKind::Preprocess => self.on_preprocess_finished(job_id, outcome, now_ms, &mut actions),
            ProcessKind::CompileLocal => self.on_compile_local_finished(job_id, outcome, now_ms, &mut actions),
            ProcessKind::CompileRemoteServe => self.on_compile_remote_serve_finished(job_id, outcome, now_ms, &mut actions),
        }
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    fn on_preprocess_finished(&mut self, id: JobId, outcome: ProcessOutcome, _now_ms: u64, actions: &mut Vec<Action>) {
        self.preprocessing.remove(&id);
        let Some(job) = self.jobs.get_mut(&id) else { return };
        job.stderr.extend_from_slice(&outcome.stderr);
        if !outcome.success || outcome.artifact.is_empty() {
            job.transition(Status::Error);
            self.finish_local_job_error(id, actions);
            return;
        }
        job.preprocessed = Some(outcome.artifact);
        if self.preprocess_pending.len() < self.config.max_preprocess_pending {
            self.admit_preprocessed(id);
        } else {
            self.pending_preprocess_hold.push_back(id);
        }
    }

    fn on_compile_local_finished(&mut self, id: JobId, outcome: ProcessOutcome, _now_ms: u64, actions: &mut Vec<Action>) {
        let was_speculative = self.speculative_local.remove(&id);
        self.compiling.remove(&id);

        let Some(job) = self.jobs.get(&id) else { return };
        if was_speculative {
            // Racing a remote peer. If the remote already finalized the
            // job (Compiled/Error), our result is silently discarded
            // (spec §9 open question: tolerate the race, second writer
            // suppressed).
            if job.status.is_terminal() {
                return;
            }
        }

        let stderr = {
            let mut s = job.stderr.clone();
            s.extend_from_slice(&outcome.stderr);
            s
        };
        let stdout = outcome.stdout.clone();
        let sent_to_peers: Vec<PeerId> = job.sent_to_peers.iter().cloned().collect();

        let job = self.jobs.get_mut(&id).unwrap();
        job.stderr = stderr;
        job.stdout = stdout;
        if outcome.success {
            job.transition(Status::Compiled);
        } else {
            job.transition(Status::Error);
        }
        self.building.remove(id);

        actions.push(Action::SendToShim {
            conn_id: job.local_conn.expect("local job must have a shim connection"),
            response: ClientJobResponseBody::Finished { exit_status: if outcome.success { 0 } else { 1 }, infrastructure_failure: false },
        });
        for peer_id in sent_to_peers {
            actions.push(Action::SendToPeer { peer_id, message: Message::JobDiscarded(JobDiscardedMsg { id }) });
        }
        actions.push(Action::RemoveJob { job_id: id });
        self.jobs.remove(&id);
    }

    fn on_compile_remote_serve_finished(&mut self, id: JobId, outcome: ProcessOutcome, _now_ms: u64, actions: &mut Vec<Action>) {
        self.compiling.remove(&id);
        let Some(job) = self.jobs.get_mut(&id) else { return };
        let serial = job.serial;
        let peer_id = job.serving_peer.expect("remote job must have a serving peer");
        let mode = if outcome.success { JobResponseMode::Compiled } else { JobResponseMode::Error };
        job.transition(if outcome.success { Status::Compiled } else { Status::Error });
        let payload = if outcome.success { outcome.artifact.clone() } else { outcome.stderr.clone() };
        actions.push(Action::SendToPeer {
            peer_id,
            message: Message::JobResponse(JobResponseMsg { id, serial, mode, payload }),
        });
        actions.push(Action::PublishBuildingStat { event: BuildingEvent::Stop, job_id: id, peer: String::new(), file: String::new() });
        actions.push(Action::RemoveJob { job_id: id });
        self.jobs.remove(&id);
    }

    fn finish_local_job_error(&mut self, id: JobId, actions: &mut Vec<Action>) {
        let Some(job) = self.jobs.get(&id) else { return };
        if job.origin != JobOrigin::Local {
            return;
        }
        let conn = job.local_conn;
        if let Some(conn_id) = conn {
            actions.push(Action::SendToShim {
                conn_id,
                response: ClientJobResponseBody::Finished { exit_status: 1, infrastructure_failure: false },
            });
        }
        actions.push(Action::RemoveJob { job_id: id });
        self.jobs.remove(&id);
    }

    // ---- shim / peer socket events -----------------------------------

    pub fn on_shim_disconnected(&mut self, conn_id: ConnId, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let job_id = self.jobs.iter().find(|(_, j)| j.local_conn == Some(conn_id)).map(|(id, _)| *id);
        if let Some(id) = job_id {
            if let Some(job) = self.jobs.get(&id) {
                if !job.status.is_terminal() {
                    actions.push(Action::KillProcess { job_id: id });
                    for peer_id in job.sent_to_peers.iter().cloned() {
                        actions.push(Action::SendToPeer { peer_id, message: Message::JobDiscarded(JobDiscardedMsg { id }) });
                    }
                }
            }
            self.pending_preprocess.retain(|j| *j != id);
            self.preprocessing.remove(&id);
            self.pending_compile.retain(|j| *j != id);
            self.compiling.remove(&id);
            self.speculative_local.remove(&id);
            self.remove_from_pending_build(id);
            self.building.remove(id);
            self.jobs.remove(&id);
        }
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    pub fn on_job_response(&mut self, peer_id: PeerId, msg: JobResponseMsg, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let Some(building) = self.building.get(msg.id).cloned() else { return actions };
        if building.peer_id != peer_id {
            return actions;
        }
        let (serial, status, conn_id) = match self.jobs.get(&msg.id) {
            Some(job) => (job.serial, job.status, job.local_conn),
            None => return actions,
        };
        if serial != msg.serial {
            // Stale response from a rescheduled job: silently dropped
            // (spec §4.8, invariant #5).
            return actions;
        }

        if status == Status::RemotePending {
            self.release_preprocess_slot(msg.id);
            self.jobs.get_mut(&msg.id).unwrap().transition(Status::RemoteReceiving);
        }
        let conn_id = conn_id.expect("local job must have a shim connection");

        match msg.mode {
            JobResponseMode::Stdout => {
                self.jobs.get_mut(&msg.id).unwrap().stdout.extend_from_slice(&msg.payload);
                actions.push(Action::SendToShim {
                    conn_id,
                    response: ClientJobResponseBody::OutputChunk { stdout: msg.payload, stderr: vec![] },
                });
            }
            JobResponseMode::Stderr => {
                self.jobs.get_mut(&msg.id).unwrap().stderr.extend_from_slice(&msg.payload);
                actions.push(Action::SendToShim {
                    conn_id,
                    response: ClientJobResponseBody::OutputChunk { stdout: vec![], stderr: msg.payload },
                });
            }
            JobResponseMode::Compiled => {
                self.finish_job_from_remote(msg.id, true, Some(msg.payload), &mut actions);
            }
            JobResponseMode::Error => {
                self.finish_job_from_remote(msg.id, false, None, &mut actions);
            }
        }
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    fn finish_job_from_remote(&mut self, id: JobId, success: bool, object: Option<Vec<u8>>, actions: &mut Vec<Action>) {
        // If a speculative local compile had already finished and won in
        // the meantime, the job is gone; tolerate the race (spec §9 open
        // question).
        let Some(job) = self.jobs.get(&id) else { return };
        if job.status.is_terminal() {
            return;
        }
        if self.speculative_local.remove(&id) {
            actions.push(Action::KillProcess { job_id: id });
        }
        self.compiling.remove(&id);
        self.building.remove(id);

        let conn_id = job.local_conn.unwrap();
        let output_path = job.compiler_args.output_path();
        let cwd = job.cwd.clone();
        let other_peers: Vec<PeerId> = job.sent_to_peers.iter().cloned().collect();

        self.jobs.get_mut(&id).unwrap().transition(if success { Status::Compiled } else { Status::Error });

        if let Some(bytes) = object {
            let path = if output_path.is_absolute() { output_path } else { cwd.join(output_path) };
            actions.push(Action::WriteOutputFile { job_id: id, path, bytes });
        }
        actions.push(Action::SendToShim {
            conn_id,
            response: ClientJobResponseBody::Finished { exit_status: if success { 0 } else { 1 }, infrastructure_failure: false },
        });
        for peer_id in other_peers {
            actions.push(Action::SendToPeer { peer_id, message: Message::JobDiscarded(JobDiscardedMsg { id }) });
        }
        actions.push(Action::RemoveJob { job_id: id });
        self.jobs.remove(&id);
    }

    /// We were serving `peer_id`'s job and they asked us to stop (spec §4.6,
    /// §5 cancellation semantics).
    pub fn on_job_discarded(&mut self, _peer_id: PeerId, msg: JobDiscardedMsg, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        if self.jobs.contains_key(&msg.id) {
            actions.push(Action::KillProcess { job_id: msg.id });
            self.compiling.remove(&msg.id);
            self.pending_compile.retain(|j| *j != msg.id);
            self.jobs.remove(&msg.id);
        }
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    /// A peer wants work from our `pending_build` (spec §4.6).
    pub fn on_request_jobs(&mut self, peer_id: PeerId, msg: RequestJobsMsg, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let mut granted = 0u32;
        if let Some(queue) = self.pending_build.get_mut(&msg.compiler_key) {
            while granted < msg.count {
                let Some(id) = queue.pop_front() else { break };
                self.pending_compile.retain(|j| *j != id);
                let Some(job) = self.jobs.get_mut(&id) else { continue };
                if !job.transition(Status::RemotePending) {
                    continue;
                }
                job.sent_to_peers.insert(peer_id);
                let serial = job.serial;
                let preprocessed = job.preprocessed.clone().unwrap_or_default();
                let argv: Vec<String> = job.argv.iter().map(|s| s.to_string_lossy().into_owned()).collect();
                let resolved_compiler_path = job.resolved_compiler_path.clone();
                self.building.insert(Building {
                    started_monotonic_ms: now_ms,
                    job_id: id,
                    serial,
                    peer_id,
                });
                actions.push(Action::SendToPeer {
                    peer_id,
                    message: Message::JobMessage(JobMessageMsg {
                        id,
                        serial,
                        compiler_key: msg.compiler_key.clone(),
                        preprocessed,
                        argv,
                        resolved_compiler_path,
                        remote_name: String::new(),
                    }),
                });
                granted += 1;
            }
        }
        let has_more = self.pending_build.get(&msg.compiler_key).map(|q| !q.is_empty()).unwrap_or(false);
        actions.push(Action::SendToPeer {
            peer_id,
            message: Message::LastJob(LastJobMsg {
                request_id: msg.request_id,
                compiler_key: msg.compiler_key,
                granted_count: granted,
                has_more,
            }),
        });
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    pub fn on_last_job(&mut self, msg: LastJobMsg) {
        let request_id = Uuid::from_bytes(msg.request_id);
        self.outstanding.remove(&request_id);
    }

    /// Scheduler fan-out of another daemon's advertisement (spec §4.6).
    pub fn on_has_jobs(&mut self, msg: HasJobsMsg, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let Ok(addr) = msg.peer_address.parse() else { return actions };
        let existing = self.peers.find_by_host(addr, msg.port);
        let peer_id = match existing {
            Some(id) => id,
            None => {
                let id = self.peers.insert(PeerHost { address: addr, port: msg.port, friendly_name: msg.peer_address.clone() });
                actions.push(Action::ConnectToPeer { address: msg.peer_address.clone(), port: msg.port });
                id
            }
        };
        if let Some(peer) = self.peers.get_mut(peer_id) {
            peer.note_jobs_available(msg.compiler_key, msg.count);
        }
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    pub fn on_peer_connected(&mut self, host: PeerHost) -> PeerId {
        match self.peers.find_by_host(host.address, host.port) {
            Some(id) => id,
            None => self.peers.insert(host),
        }
    }

    /// Hard reschedule on peer disconnect (spec §4.8, §5). Unlike the
    /// periodic sweep, every `Building` entry tied to the dead peer is
    /// requeued, `RemoteReceiving` included: there's no peer left to finish
    /// streaming the response, so "we've committed to the current peer"
    /// no longer applies once that peer is gone.
    pub fn on_peer_disconnected(&mut self, peer_id: PeerId, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let entries = self.building.entries_for_peer(peer_id);
        for entry in entries {
            self.building.remove(entry.job_id);
            self.reschedule_hard(entry.job_id);
        }
        self.peers.remove(peer_id);
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    /// Rescheduled by the periodic timeout sweep only (spec §4.8): a job
    /// already `RemoteReceiving` has started getting bytes back and is left
    /// alone until it either finishes or its peer disconnects outright.
    fn reschedule(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else { return };
        if job.status != Status::RemotePending {
            return;
        }
        job.serial += 1;
        job.transition(Status::Idle);
        job.transition(Status::PendingCompiling);
        self.pending_compile.push_back(job_id);
    }

    /// Rescheduled on a hard peer disconnect: requeues regardless of whether
    /// the job was still `RemotePending` or already `RemoteReceiving`.
    fn reschedule_hard(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else { return };
        if job.status != Status::RemotePending && job.status != Status::RemoteReceiving {
            return;
        }
        job.serial += 1;
        job.transition(Status::Idle);
        job.transition(Status::PendingCompiling);
        self.pending_compile.push_back(job_id);
    }

    /// Periodic sweep (spec §4.8): jobs that have been `RemotePending` past
    /// their (serial-scaled) timeout get rescheduled.
    pub fn sweep_reschedule(&mut self, now_ms: u64) -> Vec<Action> {
        let mut actions = Vec::new();
        let due = self.building.timed_out(now_ms, self.config.reschedule_timeout_ms);
        for entry in due {
            if let Some(job) = self.jobs.get(&entry.job_id) {
                if job.status != Status::RemotePending {
                    continue;
                }
            } else {
                continue;
            }
            self.building.remove(entry.job_id);
            self.reschedule(entry.job_id);
        }
        actions.extend(self.start_jobs(now_ms));
        actions
    }

    /// Outstanding `RequestJobs` older than 10s return their slot (spec §5).
    pub fn expire_outstanding(&mut self, now_ms: u64) {
        self.outstanding.expire(now_ms, self.config.outstanding_request_expiry_ms);
    }

    pub fn building_len(&self) -> usize {
        self.building.len()
    }

    pub fn pending_build_len(&self, key: &CompilerKey) -> usize {
        self.pending_build.get(key).map(|q| q.len()).unwrap_or(0)
    }
}
