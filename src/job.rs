//! The per-job state machine (spec §3, §4.1).
//!
//! A `Job` is stored by value in the dispatcher's arena (`HashMap<JobId,
//! Job>`); everything else (queues, per-peer indexes) holds a `JobId`, never
//! a reference, so a lookup against a job that has already finished just
//! returns `None` instead of dereferencing a dangling pointer.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::compiler_args::CompilerArgs;

/// Daemon-unique, monotonically assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum CompilerType {
    GCC,
    Clang,
    ClangApple,
    Unknown,
}

/// `(type, major_version, target)`, totally ordered lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CompilerKey {
    pub compiler_type: CompilerType,
    pub major_version: i32,
    pub target: String,
}

impl CompilerKey {
    pub fn new(compiler_type: CompilerType, major_version: i32, target: impl Into<String>) -> Self {
        CompilerKey { compiler_type, major_version, target: target.into() }
    }
}

/// §3 state set. At most one of the first eight holds at a time; `Compiled`
/// and `Error` are terminal sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Idle,
    PendingPreprocessing,
    Preprocessing,
    Preprocessed,
    PendingCompiling,
    RemotePending,
    RemoteReceiving,
    Compiling,
    Compiled,
    Error,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Compiled | Status::Error)
    }

    /// Whether `self -> next` is a legal transition for a job with the given
    /// origin, per the diagram in spec §4.1.
    pub fn can_transition_to(&self, next: Status, origin: JobOrigin) -> bool {
        use Status::*;
        if self.is_terminal() {
            return false;
        }
        match origin {
            JobOrigin::Local => matches!(
                (self, next),
                (Idle, PendingPreprocessing)
                    | (PendingPreprocessing, Preprocessing)
                    | (Preprocessing, Preprocessed)
                    | (Preprocessing, Error)
                    | (Preprocessed, PendingCompiling)
                    | (PendingCompiling, Compiling)
                    | (PendingCompiling, RemotePending)
                    | (Compiling, Compiled)
                    | (Compiling, Error)
                    | (RemotePending, RemoteReceiving)
                    | (RemotePending, Idle) // rescheduled, no byte received yet
                    | (RemoteReceiving, Idle) // peer hard-disconnected mid-stream
                    | (RemoteReceiving, Compiled)
                    | (RemoteReceiving, Error)
                    | (Idle, PendingCompiling) // re-admitted after reschedule
            ),
            JobOrigin::Remote => matches!(
                (self, next),
                (Idle, PendingCompiling)
                    | (PendingCompiling, Compiling)
                    | (Compiling, Compiled)
                    | (Compiling, Error)
            ),
        }
    }
}

/// One compile request, Local- or Remote-origin (spec §3).
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub serial: u32,
    pub origin: JobOrigin,
    pub argv: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(OsString, OsString)>,
    pub resolved_compiler_path: PathBuf,
    pub compiler_args: CompilerArgs,
    pub compiler_key: CompilerKey,
    pub preprocessed: Option<Vec<u8>>,
    pub object_code: Option<Vec<u8>>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: Status,
    pub received_monotonic_ms: u64,
    /// Local-only: the shim connection awaiting a response.
    pub local_conn: Option<ConnId>,
    /// Local-only: peers this job has been shipped to (for `JobDiscarded`
    /// fan-out once the job finishes elsewhere).
    pub sent_to_peers: HashSet<PeerId>,
    /// Remote-only: the peer whose `JobMessage` created this job, i.e. who
    /// the eventual `JobResponse` goes back to.
    pub serving_peer: Option<PeerId>,
}

impl Job {
    pub fn new_local(
        id: JobId,
        argv: Vec<OsString>,
        cwd: PathBuf,
        env: Vec<(OsString, OsString)>,
        resolved_compiler_path: PathBuf,
        compiler_args: CompilerArgs,
        compiler_key: CompilerKey,
        local_conn: ConnId,
        received_monotonic_ms: u64,
    ) -> Self {
        Job {
            id,
            serial: 0,
            origin: JobOrigin::Local,
            argv,
            cwd,
            env,
            resolved_compiler_path,
            compiler_args,
            compiler_key,
            preprocessed: None,
            object_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: Status::Idle,
            received_monotonic_ms,
            local_conn: Some(local_conn),
            sent_to_peers: HashSet::new(),
            serving_peer: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_remote(
        id: JobId,
        serial: u32,
        argv: Vec<OsString>,
        cwd: PathBuf,
        env: Vec<(OsString, OsString)>,
        resolved_compiler_path: PathBuf,
        compiler_args: CompilerArgs,
        compiler_key: CompilerKey,
        preprocessed: Vec<u8>,
        serving_peer: PeerId,
        received_monotonic_ms: u64,
    ) -> Self {
        Job {
            id,
            serial,
            origin: JobOrigin::Remote,
            argv,
            cwd,
            env,
            resolved_compiler_path,
            compiler_args,
            compiler_key,
            preprocessed: Some(preprocessed),
            object_code: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: Status::Idle,
            received_monotonic_ms,
            local_conn: None,
            sent_to_peers: HashSet::new(),
            serving_peer: Some(serving_peer),
        }
    }

    /// Attempts the transition, returning whether it was applied. Callers
    /// are expected to check this rather than mutate `status` directly, so
    /// that an illegal transition is a loud logic error rather than a silent
    /// state corruption.
    #[must_use]
    pub fn transition(&mut self, next: Status) -> bool {
        if self.status.can_transition_to(next, self.origin) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Releases the preprocessed buffer, per §4.7: this happens on first
    /// response byte, on pulling the job back to run locally, or on
    /// reschedule.
    pub fn release_preprocessed(&mut self) -> Option<Vec<u8>> {
        self.preprocessed.take()
    }
}
