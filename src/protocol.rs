//! Wire protocol (spec §4.4, §6).
//!
//! Every frame is `u32` little-endian length, one tag byte (bit 7 is the
//! `Compressed` flag, bits 0-6 are the message tag from the table in §6),
//! then the bincode-encoded body, optionally zlib-deflated as a whole. The
//! length prefix covers the tag byte plus the (possibly compressed) body,
//! matching the teacher's own `large_delimited` framing built on
//! `length_delimited`, just with a hand-rolled tag byte ahead of the bincode
//! body instead of a bare `tokio-serde-bincode` stream (we need the stable
//! numeric tags in §6, and `tokio-serde-bincode` has no place to put one).

use std::io;
use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tokio_util::codec::{Decoder, Encoder};

use crate::job::{CompilerKey, JobId, PeerId};

/// Compress bodies above this size; small control messages aren't worth it.
const COMPRESS_THRESHOLD: usize = 4096;
const MAX_FRAME_LEN: usize = 1024 * 1024 * 1024; // 1 GiB, matches the teacher.
const COMPRESSED_FLAG: u8 = 0x80;
const TAG_MASK: u8 = 0x7f;

fn tag_of(msg: &Message) -> u8 {
    match msg {
        Message::ClientJob(_) => 1,
        Message::ClientJobResponse(_) => 2,
        Message::Quit => 3,
        Message::Handshake(_) => 10,
        Message::Peer(_) => 11,
        Message::HasJobs(_) => 12,
        Message::RequestJobs(_) => 13,
        Message::LastJob(_) => 14,
        Message::JobMessage(_) => 15,
        Message::JobResponse(_) => 16,
        Message::JobDiscarded(_) => 17,
        Message::Building(_) => 18,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientJob {
    pub argv: Vec<String>,
    pub resolved_compiler: PathBuf,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ClientJobResponseBody {
    OutputChunk { stdout: Vec<u8>, stderr: Vec<u8> },
    Finished { exit_status: i32, infrastructure_failure: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientJobResponse {
    pub body: ClientJobResponseBody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Handshake {
    pub port: u16,
    pub capacity: u32,
    pub friendly_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerAnnounce {
    pub friendly_name: String,
    pub port: u16,
    pub jobs: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HasJobs {
    pub compiler_key: CompilerKey,
    pub count: u32,
    pub port: u16,
    pub peer_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestJobs {
    pub request_id: [u8; 16],
    pub compiler_key: CompilerKey,
    pub count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LastJob {
    pub request_id: [u8; 16],
    pub compiler_key: CompilerKey,
    pub granted_count: u32,
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobMessage {
    pub id: JobId,
    pub serial: u32,
    pub compiler_key: CompilerKey,
    pub preprocessed: Vec<u8>,
    pub argv: Vec<String>,
    pub resolved_compiler_path: PathBuf,
    pub remote_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobResponseMode {
    Stdout,
    Stderr,
    Compiled,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobResponse {
    pub id: JobId,
    pub serial: u32,
    pub mode: JobResponseMode,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobDiscarded {
    pub id: JobId,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BuildingEvent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Building {
    pub event: BuildingEvent,
    pub job_id: JobId,
    pub peer: String,
    pub file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Message {
    ClientJob(ClientJob),
    ClientJobResponse(ClientJobResponse),
    Quit,
    Handshake(Handshake),
    Peer(PeerAnnounce),
    HasJobs(HasJobs),
    RequestJobs(RequestJobs),
    LastJob(LastJob),
    JobMessage(JobMessage),
    JobResponse(JobResponse),
    JobDiscarded(JobDiscarded),
    Building(Building),
}

/// The subset of [`Message`] encoded as one `u8` payload body; used only to
/// recover the tag for decoding (bincode doesn't store it, we do).
fn decode_body(tag: u8, body: &[u8]) -> io::Result<Message> {
    let err = |e: bincode::Error| io::Error::new(io::ErrorKind::InvalidData, e);
    Ok(match tag {
        1 => Message::ClientJob(bincode::deserialize(body).map_err(err)?),
        2 => Message::ClientJobResponse(bincode::deserialize(body).map_err(err)?),
        3 => Message::Quit,
        10 => Message::Handshake(bincode::deserialize(body).map_err(err)?),
        11 => Message::Peer(bincode::deserialize(body).map_err(err)?),
        12 => Message::HasJobs(bincode::deserialize(body).map_err(err)?),
        13 => Message::RequestJobs(bincode::deserialize(body).map_err(err)?),
        14 => Message::LastJob(bincode::deserialize(body).map_err(err)?),
        15 => Message::JobMessage(bincode::deserialize(body).map_err(err)?),
        16 => Message::JobResponse(bincode::deserialize(body).map_err(err)?),
        17 => Message::JobDiscarded(bincode::deserialize(body).map_err(err)?),
        18 => Message::Building(bincode::deserialize(body).map_err(err)?),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown message tag {}", other),
            ))
        }
    })
}

fn encode_body(msg: &Message) -> bincode::Result<Vec<u8>> {
    match msg {
        Message::ClientJob(m) => bincode::serialize(m),
        Message::ClientJobResponse(m) => bincode::serialize(m),
        Message::Quit => Ok(Vec::new()),
        Message::Handshake(m) => bincode::serialize(m),
        Message::Peer(m) => bincode::serialize(m),
        Message::HasJobs(m) => bincode::serialize(m),
        Message::RequestJobs(m) => bincode::serialize(m),
        Message::LastJob(m) => bincode::serialize(m),
        Message::JobMessage(m) => bincode::serialize(m),
        Message::JobResponse(m) => bincode::serialize(m),
        Message::JobDiscarded(m) => bincode::serialize(m),
        Message::Building(m) => bincode::serialize(m),
    }
}

/// A `tokio_util::codec` `Encoder`/`Decoder` for [`Message`], framed as
/// `u32` length + tag byte + body, with the body zlib-compressed above
/// [`COMPRESS_THRESHOLD`] bytes (signalled by the flag bit in the tag byte).
#[derive(Default)]
pub struct MessageCodec {
    next_len: Option<u32>,
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> io::Result<()> {
        let tag = tag_of(&msg);
        let raw_body = encode_body(&msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let (flag, body) = if raw_body.len() > COMPRESS_THRESHOLD {
            let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
            enc.write_all(&raw_body)?;
            (COMPRESSED_FLAG, enc.finish()?)
        } else {
            (0u8, raw_body)
        };

        let frame_len = 1 + body.len();
        if frame_len > MAX_FRAME_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "frame too large"));
        }
        dst.reserve(4 + frame_len);
        dst.put_u32_le(frame_len as u32);
        dst.put_u8(flag | (tag & TAG_MASK));
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Message>> {
        let len = match self.next_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = (&src[..4]).get_u32_le();
                src.advance(4);
                self.next_len = Some(len);
                len
            }
        };
        if src.len() < len as usize {
            return Ok(None);
        }
        self.next_len = None;

        let mut frame = src.split_to(len as usize);
        let tag_byte = frame[0];
        let compressed = tag_byte & COMPRESSED_FLAG != 0;
        let tag = tag_byte & TAG_MASK;
        let body_bytes = frame.split_off(1);

        let body = if compressed {
            let mut dec = ZlibDecoder::new(&body_bytes[..]);
            let mut out = Vec::new();
            dec.read_to_end(&mut out)?;
            out
        } else {
            body_bytes.to_vec()
        };

        Ok(Some(decode_body(tag, &body)?))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::{CompilerType};

    fn roundtrip(msg: Message) {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().expect("full frame");
        assert_eq!(msg, decoded);
        assert!(buf.is_empty());
    }

    #[test]
    fn small_messages_roundtrip_uncompressed() {
        roundtrip(Message::Quit);
        roundtrip(Message::JobDiscarded(JobDiscarded { id: JobId(42) }));
        roundtrip(Message::RequestJobs(RequestJobs {
            request_id: [7u8; 16],
            compiler_key: CompilerKey::new(CompilerType::GCC, 11, "x86_64-linux-gnu"),
            count: 3,
        }));
    }

    #[test]
    fn large_job_message_roundtrips_compressed() {
        let big_preprocessed = vec![b'x'; 64 * 1024];
        let msg = Message::JobMessage(JobMessage {
            id: JobId(1),
            serial: 0,
            compiler_key: CompilerKey::new(CompilerType::Clang, 15, "aarch64-apple-darwin"),
            preprocessed: big_preprocessed,
            argv: vec!["clang".into(), "-c".into(), "-".into()],
            resolved_compiler_path: PathBuf::from("/usr/bin/clang"),
            remote_name: "builder-1".into(),
        });
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        // Highly repetitive input compresses well below its raw size.
        assert!(buf.len() < 64 * 1024);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn partial_frame_returns_none_until_complete() {
        let msg = Message::Handshake(Handshake { port: 5167, capacity: 4, friendly_name: "a".into() });
        let mut codec = MessageCodec::default();
        let mut full = BytesMut::new();
        codec.encode(msg.clone(), &mut full).unwrap();

        let mut partial = full.split_to(full.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), msg);
    }
}
