// SPDX-License-Identifier: Apache-2.0

//! One keep-alive connection to a document-store node.
//!
//! The connection is an explicit state machine driven by socket readiness:
//! `Uninit → Establishing → Writing → Reading → Idle`, with `Idle → Writing`
//! on reuse. At most one request is in flight per connection; a request
//! future owns the connection until the response completes or fails. A
//! `WouldBlock` from the socket always yields back to the readiness wait,
//! never spins.

use std::io::{self, IoSlice};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::parser::{ParseError, ResponseParser};

/// No bytes moving for this long means the node is stalled.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connect {node}: {source}")]
    Connect {
        node: String,
        #[source]
        source: io::Error,
    },
    #[error("socket: {0}")]
    Io(#[from] io::Error),
    #[error("response: {0}")]
    Parse(#[from] ParseError),
    #[error("no activity for {INACTIVITY_TIMEOUT:?}")]
    TimedOut,
    #[error("peer closed connection")]
    PeerClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Uninit,
    Establishing,
    Writing,
    Reading,
    Idle,
}

/// A framed request: header bytes and the record payload, written as a
/// two-segment scatter-gather vector with an advancing offset.
pub struct Request {
    pub header: Vec<u8>,
    pub body: Bytes,
}

impl Request {
    /// `POST /<index>/_doc` with the keep-alive header set the document
    /// store expects.
    pub fn post_doc(index: &str, node: &str, auth: Option<&str>, body: Bytes) -> Self {
        let mut header = format!(
            "POST /{index}/_doc HTTP/1.1\r\n\
             Host: {node}\r\n\
             Accept: */*\r\n\
             Connection: keep-alive\r\n\
             Content-Type: application/json; charset=utf-8\r\n\
             Content-Length: {}\r\n",
            body.len()
        );
        if let Some(auth) = auth {
            header.push_str("Authorization: Basic ");
            header.push_str(auth);
            header.push_str("\r\n");
        }
        header.push_str("\r\n");

        Self {
            header: header.into_bytes(),
            body,
        }
    }

    fn total_len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    /// Remaining segments after `written` bytes have gone out.
    fn remainder(&self, written: usize) -> ([IoSlice<'_>; 2], usize) {
        if written < self.header.len() {
            (
                [
                    IoSlice::new(&self.header[written..]),
                    IoSlice::new(&self.body),
                ],
                2,
            )
        } else {
            let body_off = written - self.header.len();
            (
                [IoSlice::new(&self.body[body_off..]), IoSlice::new(&[])],
                1,
            )
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub code: u16,
    pub body: Vec<u8>,
}

pub struct SenderConnection {
    state: ConnState,
    stream: Option<TcpStream>,
    node: usize,
    last_active: Instant,
}

impl SenderConnection {
    pub fn new(node: usize) -> Self {
        Self {
            state: ConnState::Uninit,
            stream: None,
            node,
            last_active: Instant::now(),
        }
    }

    pub fn node(&self) -> usize {
        self.node
    }

    pub fn set_node(&mut self, node: usize) {
        self.node = node;
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Tear the socket down; the next exchange reconnects.
    pub fn close(&mut self) {
        self.stream = None;
        self.state = ConnState::Uninit;
    }

    /// Issue one request and read the complete response. On success the
    /// connection parks in `Idle` for reuse; on any error the caller closes
    /// it and decides about failover.
    pub async fn exchange(&mut self, addr: &str, request: &Request) -> Result<HttpResponse, ConnError> {
        if self.stream.is_none() {
            self.state = ConnState::Establishing;
            let stream = timeout(INACTIVITY_TIMEOUT, TcpStream::connect(addr))
                .await
                .map_err(|_| ConnError::TimedOut)?
                .map_err(|source| ConnError::Connect {
                    node: addr.to_string(),
                    source,
                })?;
            self.stream = Some(stream);
        }
        self.last_active = Instant::now();

        self.state = ConnState::Writing;
        self.write_request(request).await?;

        self.state = ConnState::Reading;
        let response = self.read_response().await?;

        self.state = ConnState::Idle;
        self.last_active = Instant::now();
        Ok(response)
    }

    async fn write_request(&mut self, request: &Request) -> Result<(), ConnError> {
        let stream = self.stream.as_ref().expect("stream in Writing state");
        let total = request.total_len();
        let mut written = 0usize;

        while written < total {
            timeout(INACTIVITY_TIMEOUT, stream.ready(Interest::WRITABLE))
                .await
                .map_err(|_| ConnError::TimedOut)??;

            let (slices, n) = request.remainder(written);
            match stream.try_write_vectored(&slices[..n]) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) => {
                    written += n;
                    self.last_active = Instant::now();
                }
                // spurious readiness: go back to the readiness wait
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<HttpResponse, ConnError> {
        let stream = self.stream.as_ref().expect("stream in Reading state");
        let mut parser = ResponseParser::new();
        let mut buf = [0u8; 4096];

        loop {
            timeout(INACTIVITY_TIMEOUT, stream.ready(Interest::READABLE))
                .await
                .map_err(|_| ConnError::TimedOut)??;

            match stream.try_read(&mut buf) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) => {
                    self.last_active = Instant::now();
                    if parser.push(&buf[..n])? {
                        return Ok(HttpResponse {
                            code: parser.code(),
                            body: parser.body().to_vec(),
                        });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ConnError::Io(e)),
            }
        }
    }
}
