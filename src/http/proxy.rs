//! HTTP reverse proxy
//!
//! One proxy per device: accept loops on the device's listeners, one task
//! per connection, every request forwarded through the transport's
//! round-trip capability. The proxy terminates client-side framing
//! completely, so a client disconnect never reaches the USB side as
//! anything but a dropped body receiver.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::err::{Error, Result};
use crate::http::message::{Body, BodyTx, HeaderMap, Request, Response, Version};
use crate::http::parse::{self, BodyFraming, ChunkedDecoder};
use crate::http::{rewrite, RoundTripper};

/// Process-global monotonic session id source, shared by every proxy.
pub type SessionCounter = Arc<AtomicU64>;

pub struct HttpProxy {
    shutdown: watch::Sender<bool>,
    accept_tasks: Vec<JoinHandle<()>>,
}

impl HttpProxy {
    /// Start accept loops on the given listeners. The listeners come from
    /// the device state store, which already proved port ownership.
    pub fn spawn<T: RoundTripper>(
        transport: Arc<T>,
        listeners: Vec<StdTcpListener>,
        sessions: SessionCounter,
    ) -> Result<HttpProxy> {
        let (shutdown, _) = watch::channel(false);
        let mut accept_tasks = Vec::new();

        for listener in listeners {
            listener.set_nonblocking(true)?;
            let listener = TcpListener::from_std(listener)?;
            let host = pseudo_host(listener.local_addr()?);
            let transport = Arc::clone(&transport);
            let sessions = Arc::clone(&sessions);
            let shutdown_rx = shutdown.subscribe();
            accept_tasks.push(tokio::spawn(accept_loop(
                listener,
                host,
                transport,
                sessions,
                shutdown_rx,
            )));
        }

        Ok(HttpProxy {
            shutdown,
            accept_tasks,
        })
    }

    /// Stop accepting and wait for the accept loops. In-flight responses
    /// are bounded by the transport's own shutdown.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.accept_tasks.drain(..) {
            let _ = task.await;
        }
        debug!("HTTP proxy closed");
    }
}

/// The Host value clients of this listener implicitly addressed.
fn pseudo_host(addr: SocketAddr) -> String {
    addr.to_string()
}

async fn accept_loop<T: RoundTripper>(
    listener: TcpListener,
    host: String,
    transport: Arc<T>,
    sessions: SessionCounter,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = %host, "HTTP proxy listening");

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let transport = Arc::clone(&transport);
                    let sessions = Arc::clone(&sessions);
                    let host = host.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, host, transport, sessions).await {
                            debug!(peer = %peer, error = %e, "connection terminated");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    debug!(addr = %host, "accept loop stopped");
}

/// Serve one client connection, possibly over several keep-alive
/// transactions.
async fn serve_connection<T: RoundTripper>(
    mut stream: TcpStream,
    host: String,
    transport: Arc<T>,
    sessions: SessionCounter,
) -> Result<()> {
    let mut leftover: Vec<u8> = Vec::new();

    loop {
        // --- request head
        let head_end = loop {
            if let Some(end) = parse::find_head_end(&leftover) {
                break end;
            }
            if leftover.len() > parse::MAX_HEAD_SIZE {
                return Err(Error::Protocol("oversized request head".into()));
            }
            let mut chunk = [0u8; 8192];
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                if leftover.is_empty() {
                    // Idle connection closed by the client.
                    return Ok(());
                }
                return Err(Error::Protocol("client closed mid-head".into()));
            }
            leftover.extend_from_slice(&chunk[..n]);
        };

        let tail = leftover.split_off(head_end);
        let head_buf = std::mem::replace(&mut leftover, tail);
        let (method, target, version, mut headers) = match parse::parse_request_head(&head_buf) {
            Ok(parsed) => parsed,
            Err(e) => {
                write_error(&mut stream, 400, &e.to_string()).await?;
                return Ok(());
            }
        };

        let session = sessions.fetch_add(1, Ordering::Relaxed);
        debug!(session, %method, %target, "HTTP request");

        let client_close = wants_close(version, &headers);

        if let Some((status, msg)) = rewrite::check_request(&method, &target, &headers) {
            debug!(session, status, msg, "request rejected");
            write_error(&mut stream, status, msg).await?;
            return Ok(());
        }

        let framing = match parse::request_body_framing(&headers) {
            Ok(framing) => framing,
            Err(e) => {
                write_error(&mut stream, 400, &e.to_string()).await?;
                return Ok(());
            }
        };

        rewrite::remove_hop_by_hop(&mut headers);
        rewrite::force_host(&mut headers, &host);

        // --- forward, feeding the request body while the round trip runs
        let (body, feeder) = match framing {
            BodyFraming::Empty | BodyFraming::Eof => (Body::Empty, None),
            BodyFraming::Length(n) => {
                let (tx, rx) = mpsc::channel(8);
                (Body::stream(Some(n), rx), Some(tx))
            }
            BodyFraming::Chunked => {
                let (tx, rx) = mpsc::channel(8);
                (Body::stream(None, rx), Some(tx))
            }
        };

        let request = Request {
            method,
            target,
            version,
            headers,
            body,
        };

        let outcome = match feeder {
            Some(tx) => {
                let body_input = std::mem::take(&mut leftover);
                let (fed, outcome) = tokio::join!(
                    feed_body(&mut stream, body_input, framing, tx),
                    transport.round_trip(request)
                );
                leftover = fed?;
                outcome
            }
            None => transport.round_trip(request).await,
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                warn!(session, error = %e, "round trip failed");
                write_error(&mut stream, 503, &e.to_string()).await?;
                return Ok(());
            }
        };

        debug!(session, status = response.status, "HTTP response");

        // --- response back to the client
        let clean = write_response(&mut stream, response).await?;
        if !clean || client_close {
            return Ok(());
        }
    }
}

/// Did the client ask for this to be the last transaction?
fn wants_close(version: Version, headers: &HeaderMap) -> bool {
    let connection_has = |token: &str| {
        headers
            .get_all("Connection")
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };
    match version {
        Version::Http10 => !connection_has("keep-alive"),
        Version::Http11 => connection_has("close"),
    }
}

/// Pump the request body from the client socket into the transport.
/// Returns bytes read beyond the body (the next pipelined head, if any).
async fn feed_body(
    stream: &mut TcpStream,
    mut leftover: Vec<u8>,
    framing: BodyFraming,
    tx: BodyTx,
) -> Result<Vec<u8>> {
    match framing {
        BodyFraming::Length(total) => {
            let mut remaining = total;

            if !leftover.is_empty() {
                let take = (leftover.len() as u64).min(remaining) as usize;
                let rest = leftover.split_off(take);
                remaining -= take as u64;
                if tx.send(Ok(leftover)).await.is_err() {
                    // Transaction died early; the connection closes anyway.
                    return Ok(Vec::new());
                }
                leftover = rest;
            }

            let mut buf = vec![0u8; 16384];
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = stream.read(&mut buf[..want]).await?;
                if n == 0 {
                    let _ = tx
                        .send(Err(std::io::Error::other("client closed mid-body")))
                        .await;
                    return Err(Error::Protocol("client closed mid-body".into()));
                }
                remaining -= n as u64;
                if tx.send(Ok(buf[..n].to_vec())).await.is_err() {
                    return Ok(Vec::new());
                }
            }
            Ok(leftover)
        }

        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut input = leftover;
            let mut buf = vec![0u8; 16384];

            loop {
                if !input.is_empty() {
                    let mut out = Vec::new();
                    let used = match decoder.feed(&input, &mut out) {
                        Ok(used) => used,
                        Err(e) => {
                            let _ = tx
                                .send(Err(std::io::Error::other("bad chunked body")))
                                .await;
                            return Err(e);
                        }
                    };
                    if !out.is_empty() && tx.send(Ok(out)).await.is_err() {
                        return Ok(Vec::new());
                    }
                    if decoder.is_done() {
                        return Ok(input.split_off(used));
                    }
                    input.clear();
                }

                let n = stream.read(&mut buf).await?;
                if n == 0 {
                    let _ = tx
                        .send(Err(std::io::Error::other("client closed mid-body")))
                        .await;
                    return Err(Error::Protocol("client closed mid-body".into()));
                }
                input.extend_from_slice(&buf[..n]);
            }
        }

        BodyFraming::Empty | BodyFraming::Eof => Ok(leftover),
    }
}

/// Forward the device response. Returns false when the connection must be
/// dropped because the body ended in an error mid-stream.
async fn write_response(stream: &mut TcpStream, mut response: Response) -> Result<bool> {
    rewrite::remove_hop_by_hop(&mut response.headers);

    let body = std::mem::replace(&mut response.body, Body::Empty);
    let chunked = match body.len() {
        // Keep the device's own headers: a HEAD response legitimately
        // carries a Content-Length with no body.
        Some(0) => false,
        Some(n) => {
            response.headers.set("Content-Length", n.to_string());
            false
        }
        None => {
            response.headers.remove("Content-Length");
            response.headers.set("Transfer-Encoding", "chunked");
            true
        }
    };

    let mut head = Vec::with_capacity(512);
    parse::write_response_head(&mut head, &response);
    stream.write_all(&head).await?;

    match body {
        Body::Empty => {}
        Body::Bytes(data) => stream.write_all(&data).await?,
        Body::Stream { mut rx, .. } => {
            while let Some(item) = rx.recv().await {
                match item {
                    Ok(chunk) => {
                        if chunked {
                            stream.write_all(&parse::chunk_header(chunk.len())).await?;
                            stream.write_all(&chunk).await?;
                            stream.write_all(parse::CHUNK_TRAILER).await?;
                        } else {
                            stream.write_all(&chunk).await?;
                        }
                    }
                    Err(e) => {
                        // The device side failed mid-body. The client
                        // can only learn this from a torn connection.
                        debug!(error = %e, "response body failed mid-stream");
                        stream.flush().await?;
                        return Ok(false);
                    }
                }
            }
            if chunked {
                stream.write_all(parse::LAST_CHUNK).await?;
            }
        }
    }

    stream.flush().await?;
    Ok(true)
}

/// Plain-text error response with caching disabled, as proxies must.
async fn write_error(stream: &mut TcpStream, status: u16, msg: &str) -> Result<()> {
    let mut response = Response::new(status);
    response
        .headers
        .set("Content-Type", "text/plain; charset=utf-8");
    response
        .headers
        .set("Cache-Control", "no-cache, no-store, must-revalidate");
    response.headers.set("Pragma", "no-cache");
    response.headers.set("Expires", "0");
    response.headers.set("Connection", "close");

    let body = format!("{msg}\n");
    response
        .headers
        .set("Content-Length", body.len().to_string());

    let mut wire = Vec::with_capacity(256);
    parse::write_response_head(&mut wire, &response);
    wire.extend_from_slice(body.as_bytes());
    stream.write_all(&wire).await?;
    stream.flush().await?;
    Ok(())
}
