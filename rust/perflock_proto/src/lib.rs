// SPDX-License-Identifier: GPL-2.0

//! # perflock wire protocol
//!
//! A bidirectional stream of length-prefixed messages over a Unix
//! domain socket: each frame is a 4-byte big-endian payload length
//! followed by one JSON document. Requests and responses are
//! externally tagged enums, so the variant name on the wire is the
//! message tag; protocol evolution adds variants rather than reordering
//! fields. Every request gets exactly one response, in request order.

mod client;

pub use client::Client;

use std::io::Read;
use std::io::Write;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

/// Default rendezvous point between client and daemon. A leading `@`
/// selects the abstract socket namespace instead of the filesystem.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/perflock.socket";

/// Upper bound on a frame payload. Nothing legitimate comes close; this
/// caps the allocation a corrupt or hostile length prefix can cause.
const MAX_FRAME_LEN: usize = 1 << 20;

/// Client-to-daemon messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Ask for the lock. `cores == 0` requests no reservation. The
    /// daemon reads the allowed CPU set of `pid` to bound the request.
    Acquire {
        pid: u32,
        cores: usize,
        shared: bool,
        non_blocking: bool,
        msg: String,
    },
    /// Ask for the current queue, one descriptive line per holder or
    /// waiter.
    List,
    /// Pin all frequency domains to `percent` of their hardware range.
    /// Only valid while holding the lock.
    SetGovernor { percent: u32 },
}

/// Reply to [`Request::Acquire`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub acquired: bool,
    /// Raw words of the reserved CPU set; empty when no cores were
    /// requested.
    #[serde(default)]
    pub cores: Vec<u64>,
    /// Non-empty when the request was rejected outright; the connection
    /// is closed afterwards. `acquired == false` with an empty error
    /// means a non-blocking request lost the race.
    #[serde(default)]
    pub err: String,
}

/// Daemon-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Acquire(AcquireResponse),
    List(Vec<String>),
    SetGovernor { err: String },
}

/// Write one framed message.
pub fn send_msg<M: Serialize, W: Write>(w: &mut W, msg: &M) -> Result<()> {
    let payload = serde_json::to_vec(msg).context("encoding message")?;
    if payload.len() > MAX_FRAME_LEN {
        bail!("message of {} bytes exceeds frame limit", payload.len());
    }
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(&payload)?;
    w.flush()?;
    Ok(())
}

/// Read one framed message.
pub fn recv_msg<M: DeserializeOwned, R: Read>(r: &mut R) -> Result<M> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds frame limit", len);
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload).context("decoding message")?)
}

/// Whether an error from [`recv_msg`] or [`send_msg`] just means the
/// peer went away.
pub fn is_disconnect(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<std::io::Error>().map(|e| e.kind()),
        Some(
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        )
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn round_trip(req: &Request) -> Request {
        let mut buf = Vec::new();
        send_msg(&mut buf, req).unwrap();
        recv_msg(&mut Cursor::new(buf)).unwrap()
    }

    #[test]
    fn acquire_round_trip() {
        let req = Request::Acquire {
            pid: 4321,
            cores: 4,
            shared: true,
            non_blocking: false,
            msg: "cargo bench --bench decode".to_string(),
        };
        match round_trip(&req) {
            Request::Acquire {
                pid,
                cores,
                shared,
                non_blocking,
                msg,
            } => {
                assert_eq!(pid, 4321);
                assert_eq!(cores, 4);
                assert!(shared);
                assert!(!non_blocking);
                assert_eq!(msg, "cargo bench --bench decode");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn list_and_governor_round_trip() {
        assert!(matches!(round_trip(&Request::List), Request::List));
        assert!(matches!(
            round_trip(&Request::SetGovernor { percent: 90 }),
            Request::SetGovernor { percent: 90 }
        ));
    }

    #[test]
    fn response_round_trip() {
        let resp = Response::Acquire(AcquireResponse {
            acquired: true,
            cores: vec![0xf0],
            err: String::new(),
        });
        let mut buf = Vec::new();
        send_msg(&mut buf, &resp).unwrap();
        match recv_msg::<Response, _>(&mut Cursor::new(buf)).unwrap() {
            Response::Acquire(r) => {
                assert!(r.acquired);
                assert_eq!(r.cores, vec![0xf0]);
                assert!(r.err.is_empty());
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn messages_with_newlines_survive_framing() {
        let req = Request::Acquire {
            pid: 1,
            cores: 0,
            shared: false,
            non_blocking: false,
            msg: "sh -c 'echo a\necho b'".to_string(),
        };
        let mut buf = Vec::new();
        send_msg(&mut buf, &req).unwrap();
        send_msg(&mut buf, &Request::List).unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(matches!(
            recv_msg::<Request, _>(&mut cursor).unwrap(),
            Request::Acquire { .. }
        ));
        assert!(matches!(
            recv_msg::<Request, _>(&mut cursor).unwrap(),
            Request::List
        ));
    }

    #[test]
    fn eof_reads_as_disconnect() {
        let err = recv_msg::<Request, _>(&mut Cursor::new(Vec::new())).unwrap_err();
        assert!(is_disconnect(&err));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(u32::MAX).to_be_bytes());
        let err = recv_msg::<Request, _>(&mut Cursor::new(buf)).unwrap_err();
        assert!(!is_disconnect(&err));
    }
}
