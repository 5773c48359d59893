//! End-to-end tests: real TCP clients against the HTTP proxy, backed by
//! the USB transport over a scripted fake device.
//!
//! These cover the failure modes the daemon exists for: a client that
//! aborts mid-response must not poison the next transaction, and a
//! device that breaks HTTP framing must take its endpoint pair out of
//! service.

use std::collections::{HashMap, VecDeque};
use std::net::TcpListener as StdTcpListener;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ipp_usb::http::proxy::{HttpProxy, SessionCounter};
use ipp_usb::quirks::QuirksDb;
use ipp_usb::usb::addr::{UsbAddr, UsbIfAddr};
use ipp_usb::usb::info::UsbDeviceInfo;
use ipp_usb::usb::io::UsbIo;
use ipp_usb::usb::transport::UsbTransport;

/// Fake device: per-endpoint read scripts, per-endpoint write capture.
struct ScriptedDevice {
    reads: Mutex<HashMap<u8, VecDeque<rusb::Result<Vec<u8>>>>>,
    written: Mutex<HashMap<u8, Vec<u8>>>,
}

impl ScriptedDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            reads: Mutex::new(HashMap::new()),
            written: Mutex::new(HashMap::new()),
        })
    }

    fn script(&self, endpoint: u8, items: Vec<rusb::Result<Vec<u8>>>) {
        self.reads
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .extend(items);
    }

    fn reads_left(&self, endpoint: u8) -> usize {
        self.reads
            .lock()
            .unwrap()
            .get(&endpoint)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    fn written_to(&self, endpoint: u8) -> Vec<u8> {
        self.written
            .lock()
            .unwrap()
            .get(&endpoint)
            .cloned()
            .unwrap_or_default()
    }
}

impl UsbIo for ScriptedDevice {
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

    fn clear_halt(&self, _: u8) -> rusb::Result<()> {
        Ok(())
    }
}

fn device_info() -> UsbDeviceInfo {
    UsbDeviceInfo {
        vendor: 0x03f0,
        product: 0x0c17,
        serial: "CN12345".into(),
        manufacturer: "HP".into(),
        product_name: "HP LaserJet MFP M28w".into(),
    }
}

fn if_addrs(pairs: u8) -> Vec<UsbIfAddr> {
    (0..pairs)
        .map(|n| UsbIfAddr {
            addr: UsbAddr { bus: 1, device: 3 },
            num: n,
            alt: 1,
            in_ep: 0x81 + n,
            out_ep: 0x01 + n,
        })
        .collect()
}

/// Proxy + transport over the scripted device, bound to an ephemeral
/// loopback port.
fn start_stack(
    io: Arc<ScriptedDevice>,
    pairs: u8,
    quirks_text: Option<&str>,
) -> (HttpProxy, std::net::SocketAddr) {
    let quirks = match quirks_text {
        Some(text) => {
            let mut db = QuirksDb::default();
            db.add_text(text, "test-quirks.conf").unwrap();
            db.lookup(&device_info().mfg_and_product())
        }
        None => Default::default(),
    };

    let transport = Arc::new(UsbTransport::with_io(
        io,
        if_addrs(pairs),
        device_info(),
        quirks,
        Duration::from_millis(200),
    ));

    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let sessions: SessionCounter = Arc::new(AtomicU64::new(0));
    let proxy = HttpProxy::spawn(transport, vec![listener], sessions).unwrap();
    (proxy, addr)
}

/// Read one Content-Length framed response.
async fn read_response(stream: &mut TcpStream) -> (u16, Vec<u8>) {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed before response head");
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let status: u16 = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    let len: usize = head
        .lines()
        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(str::to_string))
        .and_then(|v| v.trim().parse().ok())
        .expect("content-length");

    let mut body = buf.split_off(head_end);
    while body.len() < len {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        body.extend_from_slice(&chunk[..n]);
    }
    (status, body)
}

/// A large chunked response followed by a small fresh one.
fn script_big_then_fresh(io: &ScriptedDevice) {
    let mut items: Vec<rusb::Result<Vec<u8>>> = vec![Ok(
        b"HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec(),
    )];
    // 64 chunks of 32 KiB.
    for _ in 0..64 {
        items.push(Ok(b"8000\r\n".to_vec()));
        items.push(Ok(vec![0x42u8; 0x8000]));
        items.push(Ok(b"\r\n".to_vec()));
    }
    items.push(Ok(b"0\r\n\r\n".to_vec()));
    items.push(Ok(
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfresh".to_vec()
    ));
    io.script(0x81, items);
}

#[tokio::test]
async fn client_abort_mid_response_does_not_corrupt_the_next_one() {
    let io = ScriptedDevice::new();
    script_big_then_fresh(&io);
    let (_proxy, addr) = start_stack(Arc::clone(&io), 1, None);

    // First client reads a little of a 2 MiB response and walks away.
    {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /download HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut first = [0u8; 1024];
        let n = stream.read(&mut first).await.unwrap();
        assert!(n > 0);
        assert!(first.starts_with(b"HTTP/1.1 200"));
        // Dropping the stream aborts the download.
    }

    // Second client must see a clean, fresh response. The transport may
    // still be draining; the request simply waits for the pair.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /next HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let (status, body) = read_response(&mut stream).await;
    assert_eq!(status, 200);
    assert_eq!(body, b"fresh");

    // Every scripted byte, terminating zero-chunk included, was drained.
    assert_eq!(io.reads_left(0x81), 0);
}

#[tokio::test]
async fn broken_device_framing_takes_the_transport_down() {
    let io = ScriptedDevice::new();
    // Content-Length lies: 10 declared, 6 delivered, then a stall.
    io.script(
        0x81,
        vec![Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nsix by".to_vec())],
    );
    let (_proxy, addr) = start_stack(Arc::clone(&io), 1, None);

    // First request: the 200 head goes out, then the connection tears.
    {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /doc HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
            }
        }
        assert!(buf.starts_with(b"HTTP/1.1 200"));
        // The declared 10 body bytes never fully arrive.
        let body_start = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert!(buf.len() - body_start < 10);
    }

    // With its only endpoint pair poisoned, the transport is dead: 503.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /again HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 503);
}

#[tokio::test]
async fn two_pairs_keep_serving_after_one_poisoning() {
    let io = ScriptedDevice::new();
    io.script(0x81, vec![Ok(b"garbage\r\n\r\n".to_vec())]);
    io.script(
        0x82,
        vec![
            Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()),
            Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()),
        ],
    );
    let (_proxy, addr) = start_stack(Arc::clone(&io), 2, None);

    // First request lands on the bad pair and fails with 503.
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 503);

    // The survivor pair serves subsequent requests.
    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let (status, body) = read_response(&mut stream).await;
        assert_eq!(status, 200);
        assert_eq!(body, b"ok");
    }
}

#[tokio::test]
async fn connection_quirk_strips_the_header_end_to_end() {
    let io = ScriptedDevice::new();
    io.script(
        0x81,
        vec![Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec())],
    );
    let (_proxy, addr) = start_stack(
        Arc::clone(&io),
        1,
        Some("[HP LaserJet MFP M28w]\nhttp-connection = \"\"\n"),
    );

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /ipp/print HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 200);

    let forwarded = String::from_utf8_lossy(&io.written_to(0x01)).to_ascii_lowercase();
    assert!(!forwarded.contains("connection:"));
}

#[tokio::test]
async fn post_body_reaches_the_device_verbatim() {
    let io = ScriptedDevice::new();
    io.script(
        0x81,
        vec![Ok(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())],
    );
    let (_proxy, addr) = start_stack(Arc::clone(&io), 1, None);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /ipp/print HTTP/1.1\r\nHost: x\r\nContent-Type: application/ipp\r\n\
              Content-Length: 9\r\n\r\njob-bytes",
        )
        .await
        .unwrap();
    let (status, _) = read_response(&mut stream).await;
    assert_eq!(status, 200);

    let forwarded = io.written_to(0x01);
    let text = String::from_utf8_lossy(&forwarded);
    assert!(text.starts_with("POST /ipp/print HTTP/1.1\r\n"));
    assert!(text.contains("Content-Length: 9"));
    assert!(text.ends_with("job-bytes"));
}
