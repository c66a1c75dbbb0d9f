//! The scheduler binary (spec §4.9): one TCP listener, one
//! [`plast::scheduler::Scheduler`], no per-job state. Structurally the same
//! accept-loop/event-channel shape as the daemon's event loop in
//! `daemon.rs`, just with a much smaller state machine to drive.

use std::collections::HashMap;
use std::net::SocketAddr;

use clap::{App, Arg};
use futures::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use plast::job::ConnId;
use plast::protocol::{Message, MessageCodec};
use plast::scheduler::{Action, Scheduler};

enum SchedulerEvent {
    Connected { conn_id: ConnId, address: std::net::IpAddr, tx: mpsc::UnboundedSender<Message> },
    Message { conn_id: ConnId, message: Message },
    Disconnected { conn_id: ConnId },
}

fn next_conn_id() -> ConnId {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
}

fn main() {
    env_logger::init();

    let matches = App::new("plast-scheduler")
        .about("Plast distributed compile farm scheduler")
        .arg(Arg::with_name("port").long("port").takes_value(true))
        .get_matches();
    let port: u16 = matches
        .value_of("port")
        .map(str::to_string)
        .or_else(|| std::env::var("PLAST_PORT").ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(plast::config::DEFAULT_SCHEDULER_PORT);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("plast-scheduler: failed to start the async runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(run(port));
}

async fn run(port: u16) {
    let listener = match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("plast-scheduler: failed to bind :{}: {}", port, e);
            std::process::exit(1);
        }
    };
    info!("plast-scheduler listening on :{}", port);

    let (tx, mut events) = mpsc::unbounded_channel::<SchedulerEvent>();
    let accept_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(stream, addr, accept_tx.clone()));
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                    break;
                }
            }
        }
    });

    let mut scheduler = Scheduler::new();
    let mut conns: HashMap<ConnId, mpsc::UnboundedSender<Message>> = HashMap::new();
    let mut addrs: HashMap<ConnId, std::net::IpAddr> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            SchedulerEvent::Connected { conn_id, address, tx } => {
                conns.insert(conn_id, tx);
                addrs.insert(conn_id, address);
            }
            SchedulerEvent::Message { conn_id, message } => match message {
                Message::Peer(announce) => {
                    if let Some(&address) = addrs.get(&conn_id) {
                        scheduler.on_peer_announce(conn_id, address, announce);
                    }
                }
                Message::HasJobs(msg) => {
                    for action in scheduler.on_has_jobs(conn_id, msg) {
                        apply(action, &conns);
                    }
                }
                Message::Building(msg) => {
                    for action in scheduler.on_building(conn_id, msg) {
                        apply(action, &conns);
                    }
                }
                other => warn!("unexpected message from {:?}: {:?}", conn_id, other),
            },
            SchedulerEvent::Disconnected { conn_id } => {
                conns.remove(&conn_id);
                addrs.remove(&conn_id);
                scheduler.on_peer_disconnected(conn_id);
            }
        }
    }
}

fn apply(action: Action, conns: &HashMap<ConnId, mpsc::UnboundedSender<Message>>) {
    match action {
        Action::SendToPeer { conn_id, message } => {
            if let Some(sender) = conns.get(&conn_id) {
                let _ = sender.send(message);
            }
        }
        Action::RecordBuildingStat { job_id_repr, peer, file, started } => {
            info!("{} {} building {} ({})", peer, if started { "started" } else { "stopped" }, file, job_id_repr);
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, events_tx: mpsc::UnboundedSender<SchedulerEvent>) {
    let mut framed = Framed::new(stream, MessageCodec::default());
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = next_conn_id();
    let _ = events_tx.send(SchedulerEvent::Connected { conn_id, address: addr.ip(), tx: out_tx });

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
                    Some(Ok(message)) => { let _ = events_tx.send(SchedulerEvent::Message { conn_id, message }); }
                    Some(Err(e)) => { warn!("connection {:?} error: {}", conn_id, e); break; }
                    None => break,
                }
            }
        }
    }
    let _ = events_tx.send(SchedulerEvent::Disconnected { conn_id });
}
