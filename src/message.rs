//! Wire protocol between nodes.
//!
//! Every remote operation is a single synchronous request/response exchange
//! over a fresh TCP connection. Messages are length-prefixed:
//!
//! - 4 bytes: payload length (big-endian u32)
//! - N bytes: bincode-encoded [`Request`] or [`Response`]
//!
//! The transport delivers each call exactly once or fails it. There are no
//! retries anywhere in the protocol; a failed call fails the enclosing
//! operation (chain build, write dispatch, read forward).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::process::ProcessId;
use crate::store::Book;

/// One process's links in the chain, as assigned by a build or reported by
/// [`Request::ListChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkAssignment {
    pub process: ProcessId,
    pub successor: Option<ProcessId>,
    pub predecessor: Option<ProcessId>,
}

/// Requests a node accepts from peers (and from its own shell via loopback
/// during topology operations).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// List this node's local process ids.
    CreateChain,
    /// Clear all local processes, then apply this node's subset of link
    /// assignments and record the global head and tail.
    Link {
        head: ProcessId,
        tail: ProcessId,
        assignments: Vec<LinkAssignment>,
    },
    /// Dump local link state.
    ListChain,
    /// Tail-only: the full current catalog.
    ListBooks,
    /// Tail-only: authoritative lookup.
    Read { name: String },
    /// Apply a write at the named local process and trigger forward
    /// propagation.
    Write { process: ProcessId, book: Book },
    /// Apply a clean-acknowledgement at the named local process and trigger
    /// backward propagation.
    Clean { process: ProcessId, book: Book },
    /// Set this node's propagation delay.
    SetTimeout { delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Processes(Vec<ProcessId>),
    Linked,
    Links(Vec<LinkAssignment>),
    Books(Vec<Book>),
    Book(Option<Book>),
    Ack,
    Error(String),
}

/// Writes one length-prefixed message.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let body = bincode::serialize(message).context("encode message")?;
    let len = u32::try_from(body.len()).context("message too large for frame")?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one length-prefixed message. Returns `None` on a clean EOF before
/// the length prefix (peer closed the connection).
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<Option<T>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    let message = bincode::deserialize(&body).context("decode message")?;
    Ok(Some(message))
}

/// Issues one blocking remote call: connect, send the request, read the
/// response, close. A transport failure is a hard failure of the call.
pub fn call(addr: &str, request: &Request) -> Result<Response> {
    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_nodelay(true)?;
    write_frame(&mut stream, request).with_context(|| format!("failed to send to {addr}"))?;
    read_frame(&mut stream)
        .with_context(|| format!("failed to read response from {addr}"))?
        .with_context(|| format!("{addr} closed the connection without responding"))
}

/// As [`call`], but gives up if the peer does not answer within `timeout`.
/// Used by topology operations so an unreachable node fails the build
/// promptly instead of hanging the shell.
pub fn call_with_timeout(addr: &str, request: &Request, timeout: Duration) -> Result<Response> {
    let mut stream =
        TcpStream::connect(addr).with_context(|| format!("failed to connect to {addr}"))?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(timeout))?;
    write_frame(&mut stream, request).with_context(|| format!("failed to send to {addr}"))?;
    read_frame(&mut stream)
        .with_context(|| format!("failed to read response from {addr}"))?
        .with_context(|| format!("{addr} closed the connection without responding"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip() {
        let request = Request::Write {
            process: ProcessId::new(1, 2),
            book: Book::new("dune", 9.99),
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request).expect("write frame");
        let parsed: Request = read_frame(&mut Cursor::new(&buf))
            .expect("read frame")
            .expect("frame present");

        assert_eq!(parsed, request);
    }

    #[test]
    fn read_frame_reports_eof_as_none() {
        let parsed: Option<Request> = read_frame(&mut Cursor::new(&[])).expect("clean eof");
        assert!(parsed.is_none());
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::ListChain).expect("write frame");
        buf.truncate(buf.len() - 1);

        let result: Result<Option<Request>> = read_frame(&mut Cursor::new(&buf));
        assert!(result.is_err());
    }

    #[test]
    fn link_request_roundtrip() {
        let request = Request::Link {
            head: ProcessId::new(1, 1),
            tail: ProcessId::new(2, 2),
            assignments: vec![LinkAssignment {
                process: ProcessId::new(1, 1),
                successor: Some(ProcessId::new(2, 2)),
                predecessor: None,
            }],
        };

        let mut buf = Vec::new();
        write_frame(&mut buf, &request).expect("write frame");
        let parsed: Request = read_frame(&mut Cursor::new(&buf))
            .expect("read frame")
            .expect("frame present");
        assert_eq!(parsed, request);
    }
}
