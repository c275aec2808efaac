//! Per-connection serving: the cooperative read loop and its
//! finalizers
//!
//! Each connection is one tokio task. The read loop fills the request
//! buffer and asks a finalizer after every read whether framing is
//! complete; the verdict decides between reading on, yielding to the
//! scheduler, or failing with a timeout or size error. Pipelined
//! requests ride the same buffer: the tail past one request moves to
//! offset 0 and seeds the next.

use std::net::SocketAddr;
use std::sync::Arc;

use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::config::ServerConfig;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::parser::Method;
use crate::proxy;
use crate::request::{Request, RequestBuffer, RequestFlags};
use crate::response::{Response, StatusCode};
use crate::router::RouteTable;

/// What a read finalizer decides after each read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Framing complete
    Done,
    /// Read more without yielding
    TryAgain,
    /// Surrender the task before reading more
    YieldTryAgain,
    /// Buffer exhausted without completing
    TooLarge,
    /// Packet budget exceeded
    Timeout,
}

/// Packet budget for reading `total` bytes: half a typical MTU per
/// packet, so the estimate errs toward allowing twice the expected
/// packet count.
pub(crate) fn calculate_n_packets(total: usize) -> i32 {
    std::cmp::max(1, (total / 740) as i32)
}

fn head_finalizer(
    bytes: &[u8],
    capacity: usize,
    latched: &mut bool,
    n_packets: i32,
    budget: i32,
) -> Verdict {
    if n_packets > budget {
        return Verdict::Timeout;
    }
    if bytes.len() < 4 {
        return Verdict::YieldTryAgain;
    }
    if bytes.len() == capacity {
        return Verdict::TooLarge;
    }
    if *latched {
        *latched = false;
        return Verdict::Done;
    }
    if memmem::find(bytes, b"\r\n\r\n").is_some() {
        return Verdict::Done;
    }
    Verdict::TryAgain
}

/// Read the remainder of a body into `dest`, which already holds
/// `filled` bytes. Times out on the wall-clock `deadline` or when the
/// packet budget runs dry; large bodies from slow-but-alive senders
/// are legitimate, so time gets a say alongside packet count.
pub(crate) async fn read_body<S>(
    stream: &mut S,
    dest: &mut [u8],
    mut filled: usize,
    deadline: Instant,
    budget: i32,
) -> Result<()>
where
    S: AsyncRead + Unpin,
{
    let total = dest.len();
    let mut n_packets: i32 = 0;

    while filled < total {
        let n = match timeout_at(deadline, stream.read(&mut dest[filled..])).await {
            Err(_) => return Err(Error::RequestTimeout),
            Ok(Ok(0)) => return Err(Error::Closed),
            Ok(Ok(n)) => n,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::Interrupted => {
                n_packets += 1;
                continue;
            }
            Ok(Err(_)) if filled == 0 => return Err(Error::BadRequest),
            Ok(Err(_)) => return Err(Error::Closed),
        };
        filled += n;

        if filled == total {
            break;
        }
        if Instant::now() >= deadline {
            return Err(Error::RequestTimeout);
        }
        if n_packets > budget {
            return Err(Error::RequestTimeout);
        }
        n_packets += 1;
    }

    Ok(())
}

/// One client connection and its buffer, flags and configuration.
pub struct Connection<S> {
    stream: S,
    peer_addr: Option<SocketAddr>,
    buf: RequestBuffer,
    keep_alive: bool,
    websocket: bool,
    config: Arc<ServerConfig>,
}

impl Connection<TcpStream> {
    pub fn new(stream: TcpStream, config: Arc<ServerConfig>) -> Self {
        let peer_addr = stream.peer_addr().ok();
        Self::with_stream(stream, peer_addr, config)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Build a connection over any byte stream. Tests drive this with
    /// an in-memory duplex pipe.
    pub fn with_stream(stream: S, peer_addr: Option<SocketAddr>, config: Arc<ServerConfig>) -> Self {
        Self {
            stream,
            peer_addr,
            buf: RequestBuffer::new(),
            keep_alive: true,
            websocket: false,
            config,
        }
    }

    /// Serve requests until the peer closes, keep-alive ends, or the
    /// connection upgrades to websocket.
    pub async fn serve(mut self, table: Arc<RouteTable>) {
        let mut latch: Option<usize> = None;

        loop {
            match self.process_one(&table, latch.take()).await {
                Ok(next) => latch = next,
                Err(error) => {
                    trace!("connection torn down: {}", error);
                    return;
                }
            }
            if self.websocket {
                debug!("connection switched to websocket mode");
                return;
            }
            if !self.keep_alive {
                return;
            }
        }
    }

    /// Process a single request. Returns the offset of a pipelined
    /// follow-up, if the buffer holds one.
    async fn process_one(
        &mut self,
        table: &RouteTable,
        latch: Option<usize>,
    ) -> Result<Option<usize>> {
        if let Err(error) = self.read_head(latch).await {
            if let Some(status) = error.status() {
                self.send_response(Response::default_for(status), false).await;
            }
            return Err(if error.is_fatal() { error } else { Error::Closed });
        }

        let mut proxy_info = None;
        let mut start = 0;
        if self.config.allow_proxy {
            match proxy::parse(self.buf.bytes()) {
                Ok(Some((addresses, consumed))) => {
                    proxy_info = Some(addresses);
                    start = consumed;
                }
                Ok(None) => {}
                Err(error) => {
                    let status = error.status().unwrap_or(StatusCode::BAD_REQUEST);
                    self.send_response(Response::default_for(status), self.keep_alive)
                        .await;
                    return Ok(None);
                }
            }
        }

        let buf = std::mem::replace(&mut self.buf, RequestBuffer::with_capacity(0));
        let mut request = match Request::parse(buf, start, self.peer_addr, proxy_info) {
            Ok(request) => request,
            Err(failure) => {
                // A bad request may still have a good one queued
                // behind it; respond and keep going.
                self.buf = failure.buf;
                let status = failure.error.status().unwrap_or(StatusCode::BAD_REQUEST);
                self.send_response(Response::default_for(status), self.keep_alive)
                    .await;
                return Ok(failure.next_request);
            }
        };

        self.keep_alive = request.keep_alive();
        trace!(
            "{} {} (keep-alive: {})",
            request.method(),
            String::from_utf8_lossy(request.url()),
            self.keep_alive
        );

        match dispatch::invoke(&mut request, &mut self.stream, table, &self.config).await {
            Ok(response) => {
                let websocket = request.is_websocket();
                request.flags.set(RequestFlags::HEADERS_SENT);
                self.send_response(response, self.keep_alive || websocket).await;
                if websocket {
                    self.websocket = true;
                }
            }
            Err(error) => {
                if error.is_fatal() {
                    return Err(error);
                }
                let response = match &error {
                    Error::NotAuthorized { realm } => Response::unauthorized(realm),
                    _ => {
                        let status = error.status().unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                        Response::default_for(status)
                    }
                };
                // A POST whose body never got consumed leaves the
                // stream desynchronized; close instead of misreading
                // the body as the next request.
                if request.method() == Method::Post && request.body().is_empty() {
                    self.keep_alive = false;
                }
                request.flags.set(RequestFlags::HEADERS_SENT);
                self.send_response(response, self.keep_alive).await;
            }
        }

        let (buf, next_request) = request.into_parts();
        self.buf = buf;
        Ok(next_request)
    }

    /// Fill the buffer until the head finalizer reports a complete
    /// request. A consumed pipelined tail counts as one.
    async fn read_head(&mut self, latch: Option<usize>) -> Result<()> {
        let mut latched = false;
        match latch {
            Some(offset) => {
                self.buf.shift_front(offset);
                latched = true;
            }
            None => self.buf.reset(),
        }

        let budget = calculate_n_packets(self.buf.capacity());
        let mut n_packets: i32 = 0;
        let mut pending_finalize = latched;

        loop {
            if !pending_finalize {
                let n = match self.stream.read(self.buf.spare_mut()).await {
                    Ok(0) => return Err(Error::Closed),
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                        n_packets += 1;
                        continue;
                    }
                    Err(_) if self.buf.filled() == 0 => return Err(Error::BadRequest),
                    Err(_) => return Err(Error::Closed),
                };
                self.buf.advance(n);
            }
            pending_finalize = false;

            match head_finalizer(
                self.buf.bytes(),
                self.buf.capacity(),
                &mut latched,
                n_packets,
                budget,
            ) {
                Verdict::Done => return Ok(()),
                Verdict::TryAgain => {}
                Verdict::YieldTryAgain => tokio::task::yield_now().await,
                Verdict::TooLarge => return Err(Error::TooLarge),
                Verdict::Timeout => return Err(Error::RequestTimeout),
            }
            n_packets += 1;
        }
    }

    async fn send_response(&mut self, response: Response, keep_alive: bool) {
        let bytes = response.to_http1_bytes(keep_alive);
        if let Err(error) = self.stream.write_all(&bytes).await {
            trace!("response write failed: {}", error);
            return;
        }
        let _ = self.stream.flush().await;
    }
}
