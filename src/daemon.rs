//! The daemon's event loop — the piece that turns [`crate::dispatcher::Action`]s
//! into real I/O, and real I/O into calls back into the
//! [`crate::dispatcher::Dispatcher`] (spec §4.4, §5).
//!
//! Per spec §9/§5 ("single-threaded cooperative... all Job state mutations
//! happen on the loop thread"), everything here funnels through one
//! `DaemonEvent` channel processed by a single task. Listener accept loops,
//! per-connection read loops, child processes, and timers are all separate
//! tasks whose only job is to translate what they see into a `DaemonEvent`
//! and send it back — the dispatcher itself never touches a socket.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

use futures::{SinkExt, StreamExt};

use crate::config::DaemonConfig;
use crate::dispatcher::{Action, Dispatcher, NewLocalJob, ProcessKind, ProcessOutcome};
use crate::job::{ConnId, Job, JobId, PeerId};
use crate::peer::PeerHost;
use crate::pool;
use crate::protocol::{ClientJobResponse, ClientJobResponseBody, Handshake, HasJobs, Message, MessageCodec, PeerAnnounce};
use crate::registry::CompilerRegistry;

pub enum DaemonEvent {
    ClientConnected { conn_id: ConnId, tx: mpsc::UnboundedSender<Message> },
    ClientJob { conn_id: ConnId, job: crate::protocol::ClientJob },
    ClientDisconnected { conn_id: ConnId },
    PeerConnected {
        address: IpAddr,
        port: u16,
        friendly_name: String,
        tx: mpsc::UnboundedSender<Message>,
        reply: oneshot::Sender<PeerId>,
    },
    PeerMessage { peer_id: PeerId, message: Message },
    PeerDisconnected { peer_id: PeerId },
    SchedulerConnected { tx: mpsc::UnboundedSender<Message> },
    SchedulerMessage { message: Message },
    SchedulerDisconnected,
    ProcessFinished { job_id: JobId, kind: ProcessKind, outcome: std::io::Result<ProcessOutcome> },
    RescheduleTick,
    ExpireOutstandingTick,
}

/// Owns the dispatcher plus every open connection's outbound half. Runs on
/// a single task; all mutation goes through `handle_event`.
pub struct DaemonContext {
    dispatcher: Dispatcher,
    registry: Box<dyn CompilerRegistry>,
    config: DaemonConfig,
    shim_conns: HashMap<ConnId, mpsc::UnboundedSender<Message>>,
    peer_conns: HashMap<PeerId, mpsc::UnboundedSender<Message>>,
    scheduler_conn: Option<mpsc::UnboundedSender<Message>>,
    running: HashMap<JobId, JoinHandle<()>>,
}

fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

impl DaemonContext {
    pub fn new(config: DaemonConfig, registry: Box<dyn CompilerRegistry>) -> Self {
        DaemonContext {
            dispatcher: Dispatcher::new(config.dispatcher.clone()),
            registry,
            config,
            shim_conns: HashMap::new(),
            peer_conns: HashMap::new(),
            scheduler_conn: None,
            running: HashMap::new(),
        }
    }

    /// Drives the event loop until `events` closes. Spawns the listener
    /// accept loops and timers first.
    pub async fn run(mut self, tx: mpsc::UnboundedSender<DaemonEvent>, mut events: mpsc::UnboundedReceiver<DaemonEvent>) {
        spawn_shim_listener(self.config.socket_path.clone(), tx.clone());
        spawn_peer_listener(self.config.peer_port, tx.clone());
        spawn_timers(tx.clone(), self.config.dispatcher.reschedule_check_ms);
        spawn_scheduler_connection(self.config.server.clone(), self.config.scheduler_port, tx.clone());

        while let Some(event) = events.recv().await {
            self.handle_event(event, &tx);
        }
    }

    fn handle_event(&mut self, event: DaemonEvent, tx: &mpsc::UnboundedSender<DaemonEvent>) {
        let now = now_ms();
        let actions = match event {
            DaemonEvent::ClientConnected { conn_id, tx } => {
                self.shim_conns.insert(conn_id, tx);
                Vec::new()
            }
            DaemonEvent::ClientJob { conn_id, job } => match self.resolve_client_job(job) {
                Some(new_job) => {
                    let (_id, actions) = self.dispatcher.on_client_job(conn_id, new_job, now);
                    actions
                }
                None => {
                    if let Some(sender) = self.shim_conns.get(&conn_id) {
                        let _ = sender.send(Message::ClientJobResponse(ClientJobResponse {
                            body: ClientJobResponseBody::Finished { exit_status: 1, infrastructure_failure: true },
                        }));
                    }
                    Vec::new()
                }
            },
            DaemonEvent::ClientDisconnected { conn_id } => {
                self.shim_conns.remove(&conn_id);
                self.dispatcher.on_shim_disconnected(conn_id, now)
            }
            DaemonEvent::PeerConnected { address, port, friendly_name, tx, reply } => {
                let peer_id = self.dispatcher.on_peer_connected(PeerHost { address, port, friendly_name });
                self.peer_conns.insert(peer_id, tx);
                let _ = reply.send(peer_id);
                Vec::new()
            }
            DaemonEvent::PeerMessage { peer_id, message } => self.handle_peer_message(peer_id, message, now),
            DaemonEvent::PeerDisconnected { peer_id } => {
                self.peer_conns.remove(&peer_id);
                self.dispatcher.on_peer_disconnected(peer_id, now)
            }
            DaemonEvent::SchedulerConnected { tx } => {
                let _ = tx.send(Message::Peer(PeerAnnounce { friendly_name: hostname(), port: self.config.peer_port, jobs: 0 }));
                self.scheduler_conn = Some(tx);
                Vec::new()
            }
            DaemonEvent::SchedulerMessage { message } => self.handle_scheduler_message(message, now),
            DaemonEvent::SchedulerDisconnected => {
                self.scheduler_conn = None;
                Vec::new()
            }
            DaemonEvent::ProcessFinished { job_id, kind, outcome } => {
                self.running.remove(&job_id);
                match outcome {
                    Ok(outcome) => self.dispatcher.on_process_finished(job_id, kind, outcome, now),
                    Err(e) => {
                        error!("job {:?} process failed to run: {}", job_id, e);
                        self.dispatcher.on_process_finished(
                            job_id,
                            kind,
                            ProcessOutcome { success: false, stdout: Vec::new(), stderr: e.to_string().into_bytes(), artifact: Vec::new() },
                            now,
                        )
                    }
                }
            }
            DaemonEvent::RescheduleTick => self.dispatcher.sweep_reschedule(now),
            DaemonEvent::ExpireOutstandingTick => {
                self.dispatcher.expire_outstanding(now);
                self.dispatcher.start_jobs(now)
            }
        };
        self.apply_actions(actions, tx);
    }

    fn handle_peer_message(&mut self, peer_id: PeerId, message: Message, now: u64) -> Vec<Action> {
        match message {
            Message::JobMessage(msg) => self.dispatcher.on_job_message(peer_id, msg, now),
            Message::JobResponse(msg) => self.dispatcher.on_job_response(peer_id, msg, now),
            Message::JobDiscarded(msg) => self.dispatcher.on_job_discarded(peer_id, msg, now),
            Message::RequestJobs(msg) => self.dispatcher.on_request_jobs(peer_id, msg, now),
            Message::LastJob(msg) => {
                self.dispatcher.on_last_job(msg);
                Vec::new()
            }
            other => {
                warn!("unexpected message from peer {:?}: {:?}", peer_id, other);
                Vec::new()
            }
        }
    }

    fn handle_scheduler_message(&mut self, message: Message, now: u64) -> Vec<Action> {
        match message {
            Message::HasJobs(msg) => self.dispatcher.on_has_jobs(msg, now),
            other => {
                warn!("unexpected message from scheduler: {:?}", other);
                Vec::new()
            }
        }
    }

    fn apply_actions(&mut self, actions: Vec<Action>, tx: &mpsc::UnboundedSender<DaemonEvent>) {
        for action in actions {
            self.apply_action(action, tx);
        }
    }

    fn apply_action(&mut self, action: Action, tx: &mpsc::UnboundedSender<DaemonEvent>) {
        match action {
            Action::SpawnPreprocess { job_id } => self.spawn_process(job_id, ProcessKind::Preprocess, tx),
            Action::SpawnCompileLocal { job_id, speculative } => {
                if speculative {
                    debug!("job {:?} racing remote with a speculative local compile", job_id);
                }
                self.spawn_process(job_id, ProcessKind::CompileLocal, tx)
            }
            Action::SpawnCompileRemoteServe { job_id } => self.spawn_process(job_id, ProcessKind::CompileRemoteServe, tx),
            Action::KillProcess { job_id } => {
                if let Some(handle) = self.running.remove(&job_id) {
                    handle.abort();
                }
            }
            Action::SendToShim { conn_id, response } => {
                if let Some(sender) = self.shim_conns.get(&conn_id) {
                    let _ = sender.send(Message::ClientJobResponse(ClientJobResponse { body: response }));
                }
            }
            Action::SendToPeer { peer_id, message } => {
                if let Some(sender) = self.peer_conns.get(&peer_id) {
                    let _ = sender.send(message);
                }
            }
            Action::ConnectToPeer { address, port } => {
                let our_port = self.config.peer_port;
                let capacity = self.config.dispatcher.job_count as u32;
                spawn_peer_connect(address, port, our_port, capacity, tx.clone())
            }
            Action::AnnounceToScheduler { compiler_key, count } => {
                if let Some(sender) = &self.scheduler_conn {
                    let _ = sender.send(Message::HasJobs(HasJobs {
                        compiler_key,
                        count,
                        port: self.config.peer_port,
                        peer_address: String::new(),
                    }));
                }
            }
            Action::PublishBuildingStat { event, job_id, peer, file } => {
                if let Some(sender) = &self.scheduler_conn {
                    let _ = sender.send(Message::Building(crate::protocol::Building { event, job_id, peer, file }));
                }
            }
            Action::WriteOutputFile { job_id, path, bytes } => {
                tokio::spawn(async move {
                    if let Err(e) = tokio::fs::write(&path, &bytes).await {
                        error!("job {:?}: failed to write {}: {}", job_id, path.display(), e);
                    }
                });
            }
            Action::RemoveJob { job_id } => {
                self.running.remove(&job_id);
            }
        }
    }

    fn spawn_process(&mut self, job_id: JobId, kind: ProcessKind, tx: &mpsc::UnboundedSender<DaemonEvent>) {
        let Some(job) = self.dispatcher.job(job_id).cloned() else { return };
        let tx = tx.clone();
        let handle = tokio::spawn(run_process(job, kind, tx));
        self.running.insert(job_id, handle);
    }

    /// Called when a shim hands us a brand-new invocation: looks up (or
    /// registers) the already-`which`-resolved compiler and parses argv
    /// before the job ever reaches the dispatcher (spec §4.12/4.13, kept
    /// outside the core state machine). `None` means the invocation isn't a
    /// compile at all (e.g. `--version`) or the compiler is unrecognized;
    /// the caller falls the shim back to direct execution.
    fn resolve_client_job(&mut self, job: crate::protocol::ClientJob) -> Option<NewLocalJob> {
        use std::ffi::OsString;
        let argv: Vec<OsString> = job.argv.into_iter().map(OsString::from).collect();
        let compiler_key = self
            .registry
            .find_by_path(&job.resolved_compiler)
            .or_else(|| self.registry.init(&job.resolved_compiler).ok())?;
        let compiler_args = match crate::compiler_args::parse_args(&argv[1..]) {
            crate::compiler_args::CompilerArguments::Ok(args) => args,
            _ => return None,
        };
        Some(NewLocalJob {
            argv,
            cwd: job.cwd,
            env: job.env.into_iter().map(|(k, v)| (OsString::from(k), OsString::from(v))).collect(),
            resolved_compiler_path: job.resolved_compiler,
            compiler_args,
            compiler_key,
        })
    }
}

async fn run_process(job: Job, kind: ProcessKind, tx: mpsc::UnboundedSender<DaemonEvent>) {
    let outcome = match kind {
        ProcessKind::Preprocess => pool::run_preprocess(&job).await,
        ProcessKind::CompileLocal => pool::run_compile_local(&job).await,
        ProcessKind::CompileRemoteServe => pool::run_compile_remote_serve(&job).await,
    };
    let outcome = outcome.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()));
    let _ = tx.send(DaemonEvent::ProcessFinished { job_id: job.id, kind, outcome });
}

fn spawn_timers(tx: mpsc::UnboundedSender<DaemonEvent>, reschedule_check_ms: u64) {
    let reschedule_tx = tx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(reschedule_check_ms.max(1)));
        loop {
            interval.tick().await;
            if reschedule_tx.send(DaemonEvent::RescheduleTick).is_err() {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if tx.send(DaemonEvent::ExpireOutstandingTick).is_err() {
                break;
            }
        }
    });
}

/// Accepts shim connections on the unix-domain socket (spec §6). Each
/// connection is framed with the same [`MessageCodec`] used for peer
/// traffic: `ClientJob`/`ClientJobResponse` are ordinary `Message` variants.
fn spawn_shim_listener(socket_path: PathBuf, tx: mpsc::UnboundedSender<DaemonEvent>) {
    tokio::spawn(async move {
        let _ = std::fs::remove_file(&socket_path);
        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => l,
            Err(e) => {
                error!("failed to bind shim socket {}: {}", socket_path.display(), e);
                return;
            }
        };
        info!("listening for shim connections on {}", socket_path.display());
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(handle_shim_connection(stream, tx));
                }
                Err(e) => {
                    error!("shim accept failed: {}", e);
                    break;
                }
            }
        }
    });
}

async fn handle_shim_connection(stream: UnixStream, daemon_tx: mpsc::UnboundedSender<DaemonEvent>) {
    let mut framed = Framed::new(stream, MessageCodec::default());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // conn_id assignment happens inline rather than through DaemonContext to
    // keep this free function independent of the context's internal state;
    // the loop task is the only place that ever uses it.
    let conn_id = ConnId(rand_conn_seed());
    let _ = daemon_tx.send(DaemonEvent::ClientConnected { conn_id, tx: out_tx });

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(message) => { if framed.send(message).await.is_err() { break; } }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(Message::ClientJob(job))) => {
                        let _ = daemon_tx.send(DaemonEvent::ClientJob { conn_id, job });
                    }
                    Some(Ok(Message::Quit)) | None => break,
                    Some(Ok(other)) => warn!("unexpected message from shim: {:?}", other),
                    Some(Err(e)) => { warn!("shim connection error: {}", e); break; }
                }
            }
        }
    }
    let _ = daemon_tx.send(DaemonEvent::ClientDisconnected { conn_id });
}

/// Accepts incoming peer connections from daemons who learned of us through
/// the scheduler's fan-out (spec §4.6: the side with idle capacity connects
/// out; we just listen and wait for their `Handshake`).
fn spawn_peer_listener(peer_port: u16, tx: mpsc::UnboundedSender<DaemonEvent>) {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(("0.0.0.0", peer_port)).await {
            Ok(l) => l,
            Err(e) => {
                error!("failed to bind peer port {}: {}", peer_port, e);
                return;
            }
        };
        info!("listening for peer connections on :{}", peer_port);
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_inbound_peer_connection(stream, addr, tx.clone()));
                }
                Err(e) => {
                    error!("peer accept failed: {}", e);
                    break;
                }
            }
        }
    });
}

/// Connects out to a peer that just advertised `HasJobs` (spec §4.6).
fn spawn_peer_connect(address: String, port: u16, our_port: u16, capacity: u32, tx: mpsc::UnboundedSender<DaemonEvent>) {
    tokio::spawn(async move {
        let Ok(ip) = address.parse::<IpAddr>() else {
            warn!("peer address {:?} from the scheduler isn't a valid IP", address);
            return;
        };
        let stream = match TcpStream::connect((address.as_str(), port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to connect to peer {}:{}: {}", address, port, e);
                return;
            }
        };
        handle_outbound_peer_connection(stream, ip, port, our_port, capacity, tx).await;
    });
}

async fn handle_outbound_peer_connection(
    stream: TcpStream,
    address: IpAddr,
    port: u16,
    our_port: u16,
    capacity: u32,
    daemon_tx: mpsc::UnboundedSender<DaemonEvent>,
) {
    let mut framed = Framed::new(stream, MessageCodec::default());
    let handshake = Handshake { port: our_port, capacity, friendly_name: hostname() };
    if framed.send(Message::Handshake(handshake)).await.is_err() {
        return;
    }
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = daemon_tx.send(DaemonEvent::PeerConnected {
        address,
        port,
        friendly_name: address.to_string(),
        tx: out_tx,
        reply: reply_tx,
    });
    let Ok(peer_id) = reply_rx.await else { return };
    run_peer_connection(framed, peer_id, out_rx, daemon_tx).await;
}

/// Mirror of [`handle_outbound_peer_connection`] for the accepting side: the
/// remote's advertised port/name only arrives in its first `Handshake`, so
/// the peer isn't registered with the dispatcher until that message lands.
async fn handle_inbound_peer_connection(
    stream: TcpStream,
    remote_addr: std::net::SocketAddr,
    daemon_tx: mpsc::UnboundedSender<DaemonEvent>,
) {
    let mut framed = Framed::new(stream, MessageCodec::default());
    let handshake = match framed.next().await {
        Some(Ok(Message::Handshake(h))) => h,
        Some(Ok(other)) => {
            warn!("expected a Handshake from {}, got {:?}", remote_addr, other);
            return;
        }
        Some(Err(e)) => {
            warn!("peer handshake read from {} failed: {}", remote_addr, e);
            return;
        }
        None => return,
    };
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = daemon_tx.send(DaemonEvent::PeerConnected {
        address: remote_addr.ip(),
        port: handshake.port,
        friendly_name: handshake.friendly_name,
        tx: out_tx,
        reply: reply_tx,
    });
    let Ok(peer_id) = reply_rx.await else { return };
    run_peer_connection(framed, peer_id, out_rx, daemon_tx).await;
}

async fn run_peer_connection(
    mut framed: Framed<TcpStream, MessageCodec>,
    peer_id: PeerId,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    daemon_tx: mpsc::UnboundedSender<DaemonEvent>,
) {
    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(message) => { if framed.send(message).await.is_err() { break; } }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(message)) => { let _ = daemon_tx.send(DaemonEvent::PeerMessage { peer_id, message }); }
                    Some(Err(e)) => { warn!("peer {:?} connection error: {}", peer_id, e); break; }
                    None => break,
                }
            }
        }
    }
    let _ = daemon_tx.send(DaemonEvent::PeerDisconnected { peer_id });
}

/// Cheap process-local id source for connections created outside
/// `DaemonContext` (accept loops run as independent tasks). Collisions
/// across `ConnId`/`PeerId` namespaces are harmless since they're never
/// compared to each other, only within their own `HashMap`.
fn rand_conn_seed() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "plastd".to_string())
}

/// Maintains the daemon's persistent connection to the scheduler (spec §5
/// Timeouts: "starts at 1s, exponential backoff, capped at 5 min"), using
/// the `retry` crate the way the teacher's reconnect logic would.
fn spawn_scheduler_connection(server: String, port: u16, tx: mpsc::UnboundedSender<DaemonEvent>) {
    tokio::spawn(async move {
        // `retry`'s delay iterator generates the 1s/2s/4s/.../300s backoff
        // sequence (spec §5 Timeouts); we drive the actual waiting
        // ourselves since `retry::retry` itself is synchronous-only.
        let mut delays = retry::delay::Exponential::from_millis(1000).map(|d| d.min(Duration::from_secs(300))).peekable();
        loop {
            match TcpStream::connect((server.as_str(), port)).await {
                Ok(stream) => {
                    delays = retry::delay::Exponential::from_millis(1000).map(|d| d.min(Duration::from_secs(300))).peekable();
                    handle_scheduler_connection(stream, &tx).await;
                    let _ = tx.send(DaemonEvent::SchedulerDisconnected);
                }
                Err(e) => {
                    let delay = delays.peek().copied().unwrap_or(Duration::from_secs(300));
                    warn!("scheduler connect to {}:{} failed: {}, retrying in {:?}", server, port, e, delay);
                }
            }
            let delay = delays.next().unwrap_or(Duration::from_secs(300));
            tokio::time::sleep(delay).await;
        }
    });
}

async fn handle_scheduler_connection(stream: TcpStream, daemon_tx: &mpsc::UnboundedSender<DaemonEvent>) {
    let mut framed = Framed::new(stream, MessageCodec::default());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let _ = daemon_tx.send(DaemonEvent::SchedulerConnected { tx: out_tx });

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(message) => { if framed.send(message).await.is_err() { break; } }
                    None => break,
                }
            }
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(message)) => { let _ = daemon_tx.send(DaemonEvent::SchedulerMessage { message }); }
                    Some(Err(e)) => { warn!("scheduler connection error: {}", e); break; }
                    None => break,
                }
            }
        }
    }
}
