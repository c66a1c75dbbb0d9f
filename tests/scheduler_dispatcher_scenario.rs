//! Multi-component scenario: two daemons' `Dispatcher`s and one `Scheduler`,
//! wired together by hand-passing the `Action`/message values each produces
//! into the next, exactly as the event loop in `daemon.rs` would — but
//! without any real socket. Exercises a job's whole remote journey: a local
//! job on daemon A is preprocessed, advertised through the scheduler,
//! claimed by daemon B, and handed to B's dispatcher as a `JobMessage`.

use std::ffi::OsString;
use std::path::PathBuf;

use plast::compiler_args::CompilerArgs;
use plast::dispatcher::{
    Action, Dispatcher, DispatcherConfig, NewLocalJob, ProcessKind, ProcessOutcome,
};
use plast::job::{CompilerKey, CompilerType, ConnId, JobOrigin, Status};
use plast::peer::PeerHost;
use plast::protocol::{HasJobs, Message, RequestJobs};
use plast::scheduler::Scheduler;

fn key() -> CompilerKey {
    CompilerKey::new(CompilerType::GCC, 9, "x86_64-linux-gnu")
}

fn new_local_job() -> NewLocalJob {
    NewLocalJob {
        argv: vec![OsString::from("cc"), OsString::from("-c"), OsString::from("hello.c"), OsString::from("-o"), OsString::from("hello.o")],
        cwd: PathBuf::from("/home/alice/project"),
        env: vec![],
        resolved_compiler_path: PathBuf::from("/usr/bin/cc"),
        compiler_args: CompilerArgs::default(),
        compiler_key: key(),
    }
}

#[test]
fn a_local_job_is_advertised_claimed_and_shipped_to_a_remote_peer() {
    // Daemon A has no local build slots, so every preprocessed job has to go
    // remote. Daemon B has a slot free but no jobs of its own.
    let mut daemon_a = Dispatcher::new(DispatcherConfig { job_count: 0, preprocess_count: 1, ..Default::default() });
    let mut daemon_b = Dispatcher::new(DispatcherConfig { job_count: 1, preprocess_count: 1, ..Default::default() });
    let mut scheduler = Scheduler::new();

    // Both daemons register with the scheduler.
    scheduler.on_peer_announce(ConnId(1), "10.0.0.1".parse().unwrap(), plast::protocol::PeerAnnounce { friendly_name: "a".into(), port: 5167, jobs: 0 });
    scheduler.on_peer_announce(ConnId(2), "10.0.0.2".parse().unwrap(), plast::protocol::PeerAnnounce { friendly_name: "b".into(), port: 5167, jobs: 0 });

    // A submits a local job and preprocesses it.
    let (job_id, actions) = daemon_a.on_client_job(ConnId(100), new_local_job(), 0);
    assert!(actions.iter().any(|a| matches!(a, Action::SpawnPreprocess { job_id: id } if *id == job_id)));

    let actions = daemon_a.on_process_finished(
        job_id,
        ProcessKind::Preprocess,
        ProcessOutcome { success: true, stdout: Vec::new(), stderr: Vec::new(), artifact: b"int main(void){return 0;}".to_vec() },
        10,
    );
    assert_eq!(daemon_a.job(job_id).unwrap().status, Status::PendingCompiling);

    let announce = actions
        .iter()
        .find_map(|a| match a {
            Action::AnnounceToScheduler { compiler_key, count } => Some((compiler_key.clone(), *count)),
            _ => None,
        })
        .expect("A announces it has a job once preprocessed with no local slots free");
    assert_eq!(announce.1, 1);

    // A's announcement reaches the scheduler, which fans it to B.
    let relay = scheduler
        .on_has_jobs(ConnId(1), HasJobs { compiler_key: announce.0.clone(), count: announce.1, port: 0, peer_address: String::new() })
        .into_iter()
        .find(|a| matches!(a, plast::scheduler::Action::SendToPeer { conn_id, .. } if *conn_id == ConnId(2)))
        .expect("scheduler relays to B, the only other connected peer");
    let plast::scheduler::Action::SendToPeer { message: Message::HasJobs(has_jobs), .. } = relay else { panic!("wrong action") };
    assert_eq!(has_jobs.peer_address, "10.0.0.1");
    assert_eq!(has_jobs.port, 5167);

    // B learns about A's job and requests it.
    let peer_a_from_b = daemon_b.on_peer_connected(PeerHost { address: "10.0.0.1".parse().unwrap(), port: 5167, friendly_name: "a".into() });
    let actions = daemon_b.on_has_jobs(has_jobs, 20);
    let request = actions
        .iter()
        .find_map(|a| match a {
            Action::SendToPeer { peer_id, message: Message::RequestJobs(req) } if *peer_id == peer_a_from_b => Some(req.clone()),
            _ => None,
        })
        .expect("B requests the advertised job from A");
    assert_eq!(request.compiler_key, key());
    assert!(request.count >= 1);

    // A grants the job, shipping the preprocessed bytes to B.
    let peer_b_from_a = daemon_a.on_peer_connected(PeerHost { address: "10.0.0.2".parse().unwrap(), port: 5167, friendly_name: "b".into() });
    let actions = daemon_a.on_request_jobs(
        peer_b_from_a,
        RequestJobs { request_id: request.request_id, compiler_key: request.compiler_key.clone(), count: request.count },
        30,
    );
    assert_eq!(daemon_a.job(job_id).unwrap().status, Status::RemotePending);
    let job_message = actions
        .iter()
        .find_map(|a| match a {
            Action::SendToPeer { message: Message::JobMessage(msg), .. } => Some(msg.clone()),
            _ => None,
        })
        .expect("A ships the JobMessage for the granted job");
    assert_eq!(job_message.id, job_id);
    assert_eq!(job_message.preprocessed, b"int main(void){return 0;}");

    // B receives the job and queues it for a local compile.
    let actions = daemon_b.on_job_message(peer_a_from_b, job_message, 40);
    assert!(actions.iter().any(|a| matches!(a, Action::SpawnCompileRemoteServe { .. })));
    // B has a free compile slot, so start_jobs immediately dequeues it into
    // Compiling rather than leaving it at PendingCompiling.
    let remote_job = daemon_b.job(job_id).expect("B stored the remote job under the same JobId");
    assert_eq!(remote_job.origin, JobOrigin::Remote);
    assert_eq!(remote_job.status, Status::Compiling);
}

#[test]
fn a_peer_leaving_the_scheduler_does_not_disturb_the_other_peers_roster() {
    let mut scheduler = Scheduler::new();
    scheduler.on_peer_announce(ConnId(1), "10.0.0.1".parse().unwrap(), plast::protocol::PeerAnnounce { friendly_name: "a".into(), port: 5167, jobs: 0 });
    scheduler.on_peer_announce(ConnId(2), "10.0.0.2".parse().unwrap(), plast::protocol::PeerAnnounce { friendly_name: "b".into(), port: 5167, jobs: 0 });
    assert_eq!(scheduler.len(), 2);

    scheduler.on_peer_disconnected(ConnId(1));
    assert_eq!(scheduler.len(), 1);

    // A HasJobs from the now-gone connection is silently ignored rather than
    // fanned out to the survivor.
    let actions = scheduler.on_has_jobs(ConnId(1), HasJobs { compiler_key: key(), count: 1, port: 0, peer_address: String::new() });
    assert!(actions.is_empty());
}
