//! Protocol round-trip tests exercising `MessageCodec` as a consumer would:
//! through the public `plast::protocol` API, across multiple frames written
//! into a single buffer, rather than the codec's own in-module single-frame
//! checks.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use plast::job::{CompilerKey, CompilerType, JobId};
use plast::protocol::{
    Building, BuildingEvent, ClientJob, ClientJobResponse, ClientJobResponseBody, Handshake,
    JobDiscarded, JobMessage, JobResponse, JobResponseMode, Message, MessageCodec, PeerAnnounce,
};

fn key() -> CompilerKey {
    CompilerKey::new(CompilerType::GCC, 9, "x86_64-linux-gnu")
}

#[test]
fn a_sequence_of_frames_roundtrips_in_order() {
    let messages = vec![
        Message::Handshake(Handshake { port: 5167, capacity: 4, friendly_name: "builder-1".into() }),
        Message::ClientJob(ClientJob {
            argv: vec!["cc".into(), "-c".into(), "hello.c".into()],
            resolved_compiler: "/usr/bin/cc".into(),
            env: vec![("PATH".into(), "/usr/bin".into())],
            cwd: "/home/alice/project".into(),
        }),
        Message::JobDiscarded(JobDiscarded { id: JobId(7) }),
        Message::Quit,
    ];

    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    for msg in &messages {
        codec.encode(msg.clone(), &mut buf).unwrap();
    }

    let mut decoded = Vec::new();
    while let Some(msg) = codec.decode(&mut buf).unwrap() {
        decoded.push(msg);
    }
    assert_eq!(decoded, messages);
}

#[test]
fn decoder_waits_for_a_second_frame_split_across_reads() {
    let first = Message::Peer(PeerAnnounce { friendly_name: "a".into(), port: 5167, jobs: 2 });
    let second = Message::Building(Building {
        event: BuildingEvent::Start,
        job_id: JobId(1),
        peer: "builder-2".into(),
        file: "hello.c".into(),
    });

    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(first.clone(), &mut buf).unwrap();

    // Only the first frame has arrived so far.
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
    assert_eq!(codec.decode(&mut buf).unwrap(), None);

    codec.encode(second.clone(), &mut buf).unwrap();
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));
}

#[test]
fn large_job_response_payload_roundtrips_through_compression() {
    let payload = b"int main(void) { return 0; }\n".repeat(10_000);
    let msg = Message::JobResponse(JobResponse {
        id: JobId(3),
        serial: 1,
        mode: JobResponseMode::Stdout,
        payload: payload.clone(),
    });

    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(msg.clone(), &mut buf).unwrap();
    assert!(buf.len() < payload.len());

    let decoded = codec.decode(&mut buf).unwrap().unwrap();
    assert_eq!(decoded, msg);
}

#[test]
fn client_job_response_finished_roundtrips() {
    let msg = Message::ClientJobResponse(ClientJobResponse {
        body: ClientJobResponseBody::Finished { exit_status: 1, infrastructure_failure: false },
    });
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(msg.clone(), &mut buf).unwrap();
    assert_eq!(codec.decode(&mut buf).unwrap(), Some(msg));
}

#[test]
fn job_message_carries_the_compiler_key_unchanged() {
    let msg = Message::JobMessage(JobMessage {
        id: JobId(9),
        serial: 2,
        compiler_key: key(),
        preprocessed: b"int main(){}".to_vec(),
        argv: vec!["cc".into(), "-c".into(), "-".into()],
        resolved_compiler_path: "/usr/bin/cc".into(),
        remote_name: "builder-3".into(),
    });
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    codec.encode(msg.clone(), &mut buf).unwrap();
    let Message::JobMessage(decoded) = codec.decode(&mut buf).unwrap().unwrap() else {
        panic!("wrong variant")
    };
    assert_eq!(decoded.compiler_key, key());
    assert_eq!(decoded.argv, vec!["cc", "-c", "-"]);
}
