//! USB transport
//!
//! Multiplexes HTTP transactions over the device's bulk endpoint pairs and
//! guarantees that no stray bytes are ever left on a pair between
//! transactions: every response is read to the end of its framing before
//! the pair returns to the pool, even when the HTTP client has long since
//! given up.
//!
//! A pair moves through `idle → busy-writing → busy-reading →
//! busy-draining → idle`; any I/O or framing fault sends it to `poisoned`
//! instead, removing it from the pool. When the last pair is gone the
//! transport is dead and every request fails with *transport-unavailable*.
//!
//! The pool is a bounded channel that holds the idle pairs themselves:
//! acquire is a cancel-safe `recv`, release is a `send`, poisoning is
//! simply not sending the pair back.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::err::{Error, Result};
use crate::http::message::{Body, BodyTx, HeaderMap, Request, Response, Version};
use crate::http::parse::{self, BodyFraming, ChunkedDecoder};
use crate::http::RoundTripper;
use crate::quirks::Quirks;
use crate::usb::addr::UsbIfAddr;
use crate::usb::discover::OpenedDevice;
use crate::usb::info::UsbDeviceInfo;
use crate::usb::io::UsbIo;

/// Bounds every single bulk transfer, and with it the read-response
/// phase: a device that goes quiet for this long poisons its pair.
const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(60);

/// Consecutive zero-length reads tolerated inside a framed body.
const MAX_ZERO_READS: u32 = 8;

const READ_BUF_SIZE: usize = 64 * 1024;

/// One claimed bulk IN/OUT endpoint pair.
#[derive(Debug)]
struct EndpointPair {
    ifaddr: UsbIfAddr,
}

struct PoolShared {
    tx: async_channel::Sender<EndpointPair>,
    rx: async_channel::Receiver<EndpointPair>,
    /// Pairs not yet poisoned.
    alive: AtomicUsize,
    closed: AtomicBool,
}

pub struct UsbTransport {
    io: Arc<dyn UsbIo>,
    info: UsbDeviceInfo,
    quirks: Quirks,
    io_timeout: Duration,
    shared: Arc<PoolShared>,
    /// Cloned into every in-flight transaction; taken on close so that
    /// `busy_rx` closes once the last transaction finishes.
    busy_tx: StdMutex<Option<async_channel::Sender<()>>>,
    busy_rx: async_channel::Receiver<()>,
}

impl UsbTransport {
    /// Build a transport over an opened, claimed device.
    pub fn new(opened: OpenedDevice, quirks: Quirks) -> Self {
        let OpenedDevice { handle, desc, info } = opened;
        Self::with_io(Arc::new(handle), desc.if_addrs, info, quirks, DEFAULT_IO_TIMEOUT)
    }

    /// Seam used by `new` and by tests that script the device side.
    pub fn with_io(
        io: Arc<dyn UsbIo>,
        if_addrs: Vec<UsbIfAddr>,
        info: UsbDeviceInfo,
        quirks: Quirks,
        io_timeout: Duration,
    ) -> Self {
        let pool_size = if_addrs.len();
        let (tx, rx) = async_channel::bounded(pool_size.max(1));
        for ifaddr in if_addrs {
            let _ = tx.try_send(EndpointPair { ifaddr });
        }

        let (busy_tx, busy_rx) = async_channel::bounded::<()>(1);

        debug!(
            device = %info.product_name,
            pairs = pool_size,
            "USB transport ready"
        );

        Self {
            io,
            info,
            quirks,
            io_timeout,
            shared: Arc::new(PoolShared {
                tx,
                rx,
                alive: AtomicUsize::new(pool_size),
                closed: AtomicBool::new(false),
            }),
            busy_tx: StdMutex::new(Some(busy_tx)),
            busy_rx,
        }
    }

    pub fn usb_info(&self) -> &UsbDeviceInfo {
        &self.info
    }

    /// Perform one HTTP transaction. The returned response carries a
    /// streaming body; dropping it early does not shortcut the drain.
    pub async fn transact(&self, mut request: Request) -> Result<Response> {
        let busy = self
            .busy_tx
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::Shutdown)?;

        apply_quirks(&mut request.headers, &self.quirks);

        let pair = self.acquire().await?;
        debug!(pair = %pair.ifaddr, method = %request.method, target = %request.target, "transaction start");

        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(8);
        let io = Arc::clone(&self.io);
        let shared = Arc::clone(&self.shared);
        let timeout = self.io_timeout;

        tokio::task::spawn_blocking(move || {
            let _busy = busy;
            run_transaction(&*io, &shared, pair, request, head_tx, body_tx, timeout);
        });

        let head: WireHead = head_rx
            .await
            .map_err(|_| Error::Protocol("transaction dropped before response head".into()))??;

        Ok(Response {
            version: head.version,
            status: head.status,
            reason: head.reason,
            headers: head.headers,
            body: Body::stream(head.body_len, body_rx),
        })
    }

    async fn acquire(&self) -> Result<EndpointPair> {
        match self.shared.rx.recv().await {
            Ok(pair) => Ok(pair),
            Err(_) => {
                if self.shared.closed.load(Ordering::SeqCst) {
                    Err(Error::Shutdown)
                } else {
                    Err(Error::TransportUnavailable)
                }
            }
        }
    }

    /// Close the transport: pending acquires fail with *shutdown*,
    /// in-flight transactions stop at their next I/O point, and the call
    /// returns only when the last of them is gone.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.rx.close();

        let busy = self.busy_tx.lock().unwrap().take();
        drop(busy);
        // Err means every transaction's sender clone is dropped.
        let _ = self.busy_rx.recv().await;
        debug!(device = %self.info.product_name, "USB transport closed");
    }
}

impl RoundTripper for UsbTransport {
    fn round_trip(
        &self,
        request: Request,
    ) -> impl std::future::Future<Output = Result<Response>> + Send {
        self.transact(request)
    }
}

/// Response head handed from the blocking transaction to the caller.
struct WireHead {
    version: Version,
    status: u16,
    reason: String,
    headers: HeaderMap,
    body_len: Option<u64>,
}

/// Quirk `http-*` overrides: replace, or delete on empty value.
fn apply_quirks(headers: &mut HeaderMap, quirks: &Quirks) {
    for (name, value) in quirks.http_headers() {
        if value.is_empty() {
            headers.remove(name);
        } else {
            headers.set(name, value);
        }
    }
}

/// Run one transaction to completion on a blocking thread, then return
/// the pair to the pool or poison it.
fn run_transaction(
    io: &dyn UsbIo,
    shared: &PoolShared,
    pair: EndpointPair,
    request: Request,
    head_tx: oneshot::Sender<Result<WireHead>>,
    body_tx: BodyTx,
    timeout: Duration,
) {
    let mut head_tx = Some(head_tx);

    match transact_on_pair(io, shared, &pair, request, &mut head_tx, &body_tx, timeout) {
        Ok(()) => {
            debug!(pair = %pair.ifaddr, "transaction complete, pair released");
            // Fails only when the transport is closing; the pair is
            // dropped along with the claimed interface then.
            let _ = shared.tx.try_send(pair);
        }
        Err(e) => {
            match head_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(e));
                }
                None => {
                    let _ = body_tx.blocking_send(Err(std::io::Error::other(e.to_string())));
                }
            }
            poison(io, shared, pair);
        }
    }
}

fn poison(io: &dyn UsbIo, shared: &PoolShared, pair: EndpointPair) {
    if shared.closed.load(Ordering::SeqCst) {
        return;
    }

    let _ = io.clear_halt(pair.ifaddr.in_ep);
    let _ = io.clear_halt(pair.ifaddr.out_ep);

    let alive = shared.alive.fetch_sub(1, Ordering::SeqCst) - 1;
    warn!(pair = %pair.ifaddr, alive, "endpoint pair poisoned");

    if alive == 0 {
        error!("no usable endpoint pairs left, transport failed");
        shared.rx.close();
    }
}

#[allow(clippy::too_many_arguments)]
fn transact_on_pair(
    io: &dyn UsbIo,
    shared: &PoolShared,
    pair: &EndpointPair,
    mut request: Request,
    head_tx: &mut Option<oneshot::Sender<Result<WireHead>>>,
    body_tx: &BodyTx,
    timeout: Duration,
) -> Result<()> {
    // --- busy-writing: request head and body onto the OUT endpoint.
    set_framing_headers(&mut request);
    let mut head = Vec::with_capacity(1024);
    parse::write_request_head(&mut head, &request);
    write_all(io, pair.ifaddr.out_ep, &head, timeout)?;
    write_body(io, pair.ifaddr.out_ep, request.body, timeout)?;

    // --- busy-reading: response head.
    let method = request.method;
    let mut buf: Vec<u8> = Vec::with_capacity(8192);
    let mut scratch = vec![0u8; READ_BUF_SIZE];
    let mut zero_reads = 0u32;

    let head_end = loop {
        if let Some(end) = parse::find_head_end(&buf) {
            break end;
        }
        if buf.len() > parse::MAX_HEAD_SIZE {
            return Err(Error::Protocol("oversized response head".into()));
        }
        check_shutdown(shared)?;
        let n = io.read_bulk(pair.ifaddr.in_ep, &mut scratch, timeout)?;
        if n == 0 {
            zero_reads += 1;
            if zero_reads > MAX_ZERO_READS {
                return Err(Error::Protocol("device stalled before response head".into()));
            }
            continue;
        }
        zero_reads = 0;
        buf.extend_from_slice(&scratch[..n]);
    };

    let (version, status, reason, headers) = parse::parse_response_head(&buf[..head_end])?;
    let framing = parse::response_body_framing(&method, status, &headers)?;
    let body_len = match framing {
        BodyFraming::Empty => Some(0),
        BodyFraming::Length(n) => Some(n),
        BodyFraming::Chunked | BodyFraming::Eof => None,
    };

    if let Some(tx) = head_tx.take() {
        // The caller may be gone already; the drain below happens anyway.
        let _ = tx.send(Ok(WireHead {
            version,
            status,
            reason,
            headers,
            body_len,
        }));
    }

    // --- busy-reading / busy-draining: the body, to the exact end of its
    // framing. Chunks go to the caller for as long as it listens.
    let excess = buf.split_off(head_end);
    read_body(io, shared, pair, framing, excess, body_tx, &mut scratch, timeout)
}

/// Replace whatever framing headers came in with ones describing how the
/// body is actually written to the device.
fn set_framing_headers(request: &mut Request) {
    request.headers.remove("Content-Length");
    request.headers.remove("Transfer-Encoding");
    match request.body.len() {
        Some(0) => {
            if !matches!(request.method.as_str(), "GET" | "HEAD") {
                request.headers.set("Content-Length", "0");
            }
        }
        Some(n) => request.headers.set("Content-Length", n.to_string()),
        None => request.headers.set("Transfer-Encoding", "chunked"),
    }
}

fn write_body(io: &dyn UsbIo, endpoint: u8, body: Body, timeout: Duration) -> Result<()> {
    match body {
        Body::Empty => Ok(()),
        Body::Bytes(data) => write_all(io, endpoint, &data, timeout),
        Body::Stream { len, mut rx } => {
            let chunked = len.is_none();
            while let Some(chunk) = rx.blocking_recv() {
                let chunk = chunk.map_err(Error::Io)?;
                if chunk.is_empty() {
                    continue;
                }
                if chunked {
                    write_all(io, endpoint, &parse::chunk_header(chunk.len()), timeout)?;
                    write_all(io, endpoint, &chunk, timeout)?;
                    write_all(io, endpoint, parse::CHUNK_TRAILER, timeout)?;
                } else {
                    write_all(io, endpoint, &chunk, timeout)?;
                }
            }
            if chunked {
                write_all(io, endpoint, parse::LAST_CHUNK, timeout)?;
            }
            Ok(())
        }
    }
}

fn write_all(io: &dyn UsbIo, endpoint: u8, mut data: &[u8], timeout: Duration) -> Result<()> {
    while !data.is_empty() {
        let n = io.write_bulk(endpoint, data, timeout)?;
        if n == 0 {
            return Err(Error::Protocol("bulk write made no progress".into()));
        }
        data = &data[n..];
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn read_body(
    io: &dyn UsbIo,
    shared: &PoolShared,
    pair: &EndpointPair,
    framing: BodyFraming,
    excess: Vec<u8>,
    body_tx: &BodyTx,
    scratch: &mut [u8],
    timeout: Duration,
) -> Result<()> {
    match framing {
        BodyFraming::Empty => {
            if excess.is_empty() {
                Ok(())
            } else {
                Err(Error::Protocol("data after a bodyless response".into()))
            }
        }

        BodyFraming::Length(total) => {
            let mut received = 0u64;
            let mut zero_reads = 0u32;

            if !excess.is_empty() {
                if excess.len() as u64 > total {
                    return Err(Error::Protocol("more data than Content-Length".into()));
                }
                received += excess.len() as u64;
                deliver(body_tx, excess);
            }

            while received < total {
                check_shutdown(shared)?;
                let n = io.read_bulk(pair.ifaddr.in_ep, scratch, timeout)?;
                if n == 0 {
                    zero_reads += 1;
                    if zero_reads > MAX_ZERO_READS {
                        return Err(Error::Protocol("device stalled mid-body".into()));
                    }
                    continue;
                }
                zero_reads = 0;
                if received + n as u64 > total {
                    return Err(Error::Protocol("more data than Content-Length".into()));
                }
                received += n as u64;
                deliver(body_tx, scratch[..n].to_vec());
            }
            Ok(())
        }

        BodyFraming::Chunked => {
            let mut decoder = ChunkedDecoder::new();
            let mut zero_reads = 0u32;

            let mut out = Vec::new();
            let used = decoder.feed(&excess, &mut out)?;
            if decoder.is_done() && used < excess.len() {
                return Err(Error::Protocol("data after the final chunk".into()));
            }
            deliver(body_tx, out);

            while !decoder.is_done() {
                check_shutdown(shared)?;
                let n = io.read_bulk(pair.ifaddr.in_ep, scratch, timeout)?;
                if n == 0 {
                    zero_reads += 1;
                    if zero_reads > MAX_ZERO_READS {
                        return Err(Error::Protocol("device stalled mid-chunk".into()));
                    }
                    continue;
                }
                zero_reads = 0;
                let mut out = Vec::new();
                let used = decoder.feed(&scratch[..n], &mut out)?;
                if decoder.is_done() && used < n {
                    return Err(Error::Protocol("data after the final chunk".into()));
                }
                deliver(body_tx, out);
            }
            Ok(())
        }

        BodyFraming::Eof => {
            deliver(body_tx, excess);
            loop {
                check_shutdown(shared)?;
                match io.read_bulk(pair.ifaddr.in_ep, scratch, timeout) {
                    // USB has no EOF; a zero-length read or a timeout is
                    // how a close-delimited body ends.
                    Ok(0) | Err(rusb::Error::Timeout) => return Ok(()),
                    Ok(n) => deliver(body_tx, scratch[..n].to_vec()),
                    Err(e) => return Err(Error::Usb(e)),
                }
            }
        }
    }
}

fn check_shutdown(shared: &PoolShared) -> Result<()> {
    if shared.closed.load(Ordering::SeqCst) {
        Err(Error::Shutdown)
    } else {
        Ok(())
    }
}

/// Hand a decoded chunk to the caller. A send error means the caller
/// dropped the body; the transaction still must read the device to the
/// end, so the error is ignored here.
fn deliver(body_tx: &BodyTx, data: Vec<u8>) {
    if !data.is_empty() {
        let _ = body_tx.blocking_send(Ok(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::addr::UsbAddr;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    /// Scripted device: reads are served per IN endpoint from a queue;
    /// writes are recorded per OUT endpoint. An exhausted queue times out.
    struct FakeUsbIo {
        reads: Mutex<HashMap<u8, VecDeque<rusb::Result<Vec<u8>>>>>,
        written: Mutex<HashMap<u8, Vec<u8>>>,
        halts: Mutex<Vec<u8>>,
    }

    impl FakeUsbIo {
        fn new() -> Self {
            Self {
                reads: Mutex::new(HashMap::new()),
                written: Mutex::new(HashMap::new()),
                halts: Mutex::new(Vec::new()),
            }
        }

        fn script(&self, endpoint: u8, items: Vec<rusb::Result<Vec<u8>>>) {
            self.reads
                .lock()
                .unwrap()
                .entry(endpoint)
                .or_default()
                .extend(items);
        }

        fn written_to(&self, endpoint: u8) -> Vec<u8> {
            self.written
                .lock()
                .unwrap()
                .get(&endpoint)
                .cloned()
                .unwrap_or_default()
        }

        fn reads_left(&self, endpoint: u8) -> usize {
            self.reads
                .lock()
                .unwrap()
                .get(&endpoint)
                .map(|q| q.len())
                .unwrap_or(0)
        }
    }

    impl UsbIo for FakeUsbIo {
        fn write_bulk(&self, endpoint: u8, data: &[u8], _: Duration) -> rusb::Result<usize> {
            self.written
                .lock()
                .unwrap()
                .entry(endpoint)
                .or_default()
                .extend_from_slice(data);
            Ok(data.len())
        }

        fn read_bulk(&self, endpoint: u8, buf: &mut [u8], _: Duration) -> rusb::Result<usize> {
            let item = self
                .reads
                .lock()
                .unwrap()
                .get_mut(&endpoint)
                .and_then(|q| q.pop_front());
            match item {
                Some(Ok(data)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok(data.len())
                }
                Some(Err(e)) => Err(e),
                None => Err(rusb::Error::Timeout),
            }
        }

        fn clear_halt(&self, endpoint: u8) -> rusb::Result<()> {
            self.halts.lock().unwrap().push(endpoint);
            Ok(())
        }
    }

    fn ifaddr(n: u8) -> UsbIfAddr {
        UsbIfAddr {
            addr: UsbAddr { bus: 1, device: 2 },
            num: n,
            alt: 1,
            in_ep: 0x81 + n,
            out_ep: 0x01 + n,
        }
    }

    fn info() -> UsbDeviceInfo {
        UsbDeviceInfo {
            vendor: 0x03f0,
            product: 0x0c17,
            serial: "CN12345".to_string(),
            manufacturer: "HP".to_string(),
            product_name: "HP Test MFP".to_string(),
        }
    }

    fn transport(io: Arc<FakeUsbIo>, pairs: u8) -> UsbTransport {
        let if_addrs = (0..pairs).map(ifaddr).collect();
        UsbTransport::with_io(
            io,
            if_addrs,
            info(),
            Quirks::default(),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn round_trip_with_content_length() {
        let io = Arc::new(FakeUsbIo::new());
        io.script(
            0x81,
            vec![Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec())],
        );
        let transport = transport(Arc::clone(&io), 1);

        let request = Request::new("POST", "/ipp/print").with_body(b"job-data".to_vec());
        let response = transport.transact(request).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.collect().await.unwrap(), b"hello");

        let written = io.written_to(0x01);
        let text = String::from_utf8_lossy(&written);
        assert!(text.starts_with("POST /ipp/print HTTP/1.1\r\n"));
        assert!(text.contains("Content-Length: 8"));
        assert!(text.ends_with("job-data"));
    }

    #[tokio::test]
    async fn pair_is_reused_after_completion() {
        let io = Arc::new(FakeUsbIo::new());
        io.script(
            0x81,
            vec![
                Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA".to_vec()),
                Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nB".to_vec()),
            ],
        );
        let transport = transport(io, 1);

        let r1 = transport.transact(Request::new("GET", "/a")).await.unwrap();
        assert_eq!(r1.body.collect().await.unwrap(), b"A");
        let r2 = transport.transact(Request::new("GET", "/b")).await.unwrap();
        assert_eq!(r2.body.collect().await.unwrap(), b"B");
    }

    #[tokio::test]
    async fn chunked_response_is_decoded_and_consumed() {
        let io = Arc::new(FakeUsbIo::new());
        io.script(
            0x81,
            vec![
                Ok(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec()),
                Ok(b"5\r\nhello\r\n".to_vec()),
                Ok(b"6\r\n world\r\n".to_vec()),
                Ok(b"0\r\n\r\n".to_vec()),
            ],
        );
        let transport = transport(Arc::clone(&io), 1);

        let response = transport.transact(Request::new("GET", "/")).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"hello world");
        assert_eq!(io.reads_left(0x81), 0);
    }

    #[tokio::test]
    async fn dropped_body_still_drains_before_release() {
        let io = Arc::new(FakeUsbIo::new());
        io.script(
            0x81,
            vec![
                Ok(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec()),
                Ok(b"400\r\n".to_vec()),
                Ok(vec![b'x'; 0x400]),
                Ok(b"\r\n".to_vec()),
                Ok(b"400\r\n".to_vec()),
                Ok(vec![b'y'; 0x400]),
                Ok(b"\r\n".to_vec()),
                Ok(b"0\r\n\r\n".to_vec()),
                // The next transaction's response.
                Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfresh".to_vec()),
            ],
        );
        let transport = transport(Arc::clone(&io), 1);

        // Client aborts: response dropped without reading the body.
        let response = transport.transact(Request::new("GET", "/big")).await.unwrap();
        assert_eq!(response.status, 200);
        drop(response);

        // The pair must come back only after the remaining chunks and the
        // final zero-chunk are consumed, so the next transaction sees a
        // fresh, correctly framed response.
        let response = transport.transact(Request::new("GET", "/next")).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"fresh");
        assert_eq!(io.reads_left(0x81), 0);
    }

    #[tokio::test]
    async fn short_body_poisons_pair_and_kills_single_pair_transport() {
        let io = Arc::new(FakeUsbIo::new());
        // Content-Length: 10 but only 6 bytes arrive, then the device
        // stalls (queue exhausted => timeout).
        io.script(
            0x81,
            vec![Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nsix by".to_vec())],
        );
        let transport = transport(Arc::clone(&io), 1);

        let response = transport.transact(Request::new("GET", "/")).await.unwrap();
        assert!(response.body.collect().await.is_err());

        // K=1: the poisoned pair empties the pool for good.
        let err = transport.transact(Request::new("GET", "/")).await.unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable));
        assert!(!io.halts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn with_two_pairs_service_survives_one_poisoning() {
        let io = Arc::new(FakeUsbIo::new());
        // First pair (ep 0x81) returns garbage framing.
        io.script(0x81, vec![Ok(b"not-http at all\r\n\r\n".to_vec())]);
        // Second pair (ep 0x82) works.
        io.script(
            0x82,
            vec![
                Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()),
                Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()),
            ],
        );
        let transport = transport(Arc::clone(&io), 2);

        let first = transport.transact(Request::new("GET", "/")).await;
        assert!(first.is_err());

        // The survivor keeps serving.
        let response = transport.transact(Request::new("GET", "/")).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"ok");
        let response = transport.transact(Request::new("GET", "/")).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"ok");
    }

    #[tokio::test]
    async fn quirk_deletes_header_from_forwarded_request() {
        let io = Arc::new(FakeUsbIo::new());
        io.script(
            0x81,
            vec![Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())],
        );

        let mut db = crate::quirks::QuirksDb::default();
        db.add_text("[HP *]\nhttp-connection = \"\"\n", "test.conf")
            .unwrap();
        let quirks = db.lookup("HP Test MFP");

        let transport = UsbTransport::with_io(
            Arc::clone(&io) as Arc<dyn UsbIo>,
            vec![ifaddr(0)],
            info(),
            quirks,
            Duration::from_millis(100),
        );

        let request = Request::new("GET", "/").with_header("Connection", "keep-alive");
        transport.transact(request).await.unwrap();

        let text = String::from_utf8_lossy(&io.written_to(0x01)).to_string();
        assert!(!text.to_ascii_lowercase().contains("connection:"));
    }

    #[tokio::test]
    async fn close_fails_new_requests_with_shutdown() {
        let io = Arc::new(FakeUsbIo::new());
        let transport = transport(io, 1);

        transport.close().await;

        let err = transport.transact(Request::new("GET", "/")).await.unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }

    #[tokio::test]
    async fn eof_delimited_body_reads_until_timeout() {
        let io = Arc::new(FakeUsbIo::new());
        io.script(
            0x81,
            vec![
                Ok(b"HTTP/1.1 200 OK\r\n\r\npart one ".to_vec()),
                Ok(b"part two".to_vec()),
                // Queue exhaustion acts as the device falling silent.
            ],
        );
        let transport = transport(io, 1);

        let response = transport.transact(Request::new("GET", "/")).await.unwrap();
        assert_eq!(response.body.collect().await.unwrap(), b"part one part two");
    }
}
