//! Integration tests for the broadcast server.
//!
//! These tests run a real `Supervisor` against a temporary log file and
//! connect plain TCP clients on 127.0.0.1, checking ordering, isolation,
//! session lifecycle and recovery from a missing or rotated source.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use klogd::discovery::{InterfaceAddr, StaticInterfaces};
use klogd::notify::RecordingNotifier;
use klogd::server::ServerConfig;
use klogd::supervisor::{Supervisor, SupervisorStats};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// How long to wait for the listener or a byte to show up
const WAIT_TIMEOUT: Duration = Duration::from_secs(3);

/// Time for the session loop to pick up a newly accepted client
const SETTLE: Duration = Duration::from_millis(60);

/// Interval between state checks
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Supervisor backoff used by the tests
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Grace period for supervisor shutdown
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_millis(100);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages supervisor lifecycle and cleanup.
struct TestServer {
    source: PathBuf,
    supervisor: Arc<Supervisor>,
    notifier: Arc<RecordingNotifier>,
    cancel_token: CancellationToken,
    _temp_dir: TempDir, // Keep alive for RAII cleanup
}

impl TestServer {
    /// Spawns a supervisor; creates the source file first when asked to.
    fn spawn_with(create_source: bool) -> Self {
        Self::spawn_prepared(|source| {
            if create_source {
                std::fs::write(source, b"history that must never be sent\n").unwrap();
            }
        })
    }

    /// Spawns a supervisor whose source is a named pipe, like a log device.
    fn spawn_fifo() -> Self {
        Self::spawn_prepared(make_fifo)
    }

    fn spawn_prepared(prepare: impl FnOnce(&Path)) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let source = temp_dir.path().join("klog");
        prepare(&source);

        let config = ServerConfig {
            source_path: source.clone(),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            poll_interval: Duration::from_millis(5),
            retry_delay: RETRY_DELAY,
            ..ServerConfig::default()
        };

        let cancel_token = CancellationToken::new();
        let notifier = Arc::new(RecordingNotifier::new());
        let interfaces = StaticInterfaces(vec![
            InterfaceAddr::new("lo", Ipv4Addr::LOCALHOST),
            InterfaceAddr::new("eth0", Ipv4Addr::new(192, 168, 7, 2)),
        ]);

        let supervisor = Arc::new(Supervisor::new(
            config,
            Arc::new(interfaces),
            notifier.clone(),
            cancel_token.clone(),
        ));

        tokio::spawn({
            let supervisor = Arc::clone(&supervisor);
            async move { supervisor.run().await }
        });

        TestServer {
            source,
            supervisor,
            notifier,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    fn spawn() -> Self {
        Self::spawn_with(true)
    }

    /// Waits for the supervisor to have a bound listener.
    async fn addr(&self) -> SocketAddr {
        let mut listening = self.supervisor.listening();
        let bound = timeout(WAIT_TIMEOUT, listening.wait_for(Option::is_some))
            .await
            .expect("listener did not come up")
            .unwrap();
        (*bound).unwrap()
    }

    fn stats(&self) -> SupervisorStats {
        self.supervisor.stats()
    }

    async fn wait_until(&self, what: &str, check: impl Fn(SupervisorStats) -> bool) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < WAIT_TIMEOUT {
            if check(self.stats()) {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("timed out waiting for {what}: {:?}", self.stats());
    }

    /// Connects a client and waits until the session has taken it in.
    async fn connect(&self, addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).await.expect("connect to server");
        sleep(SETTLE).await;
        stream
    }

    fn write(&self, data: &[u8]) {
        append(&self.source, data);
    }

    async fn shutdown(self) {
        self.cancel_token.cancel();
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

fn make_fifo(path: &Path) {
    let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: c_path is a valid NUL-terminated string.
    assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);
}

/// Opens the write end of a pipe without blocking; fails if nobody reads.
fn fifo_writer(path: &Path) -> File {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .expect("pipe has a reader")
}

/// Number of descriptors of this process that refer to `path`.
fn open_handles(path: &Path) -> usize {
    let target = path.canonicalize().unwrap();
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .filter(|link| *link == target)
        .count()
}

fn append(path: &Path, data: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .unwrap();
    file.write_all(data).unwrap();
}

/// Reads exactly `len` bytes or fails the test.
async fn recv(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    timeout(WAIT_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out waiting for bytes")
        .expect("read from server");
    buf
}

/// Asserts that nothing else arrives within a short window.
async fn assert_silent(stream: &mut TcpStream) {
    let mut buf = [0u8; 64];
    match timeout(Duration::from_millis(150), stream.read(&mut buf)).await {
        Err(_) => {}
        Ok(Ok(0)) => panic!("connection closed unexpectedly"),
        Ok(Ok(n)) => panic!("unexpected bytes: {:?}", &buf[..n]),
        Ok(Err(e)) => panic!("read failed: {e}"),
    }
}

// ============================================================================
// Delivery Tests
// ============================================================================

#[tokio::test]
async fn test_client_receives_bytes_in_order() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let mut client = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;

    server.write(b"A");
    server.write(b"B");
    server.write(b"C");

    assert_eq!(recv(&mut client, 3).await, b"ABC");
    assert_silent(&mut client).await;

    server.shutdown().await;
}

#[tokio::test]
async fn test_late_client_sees_only_later_bytes() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let mut first = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;

    server.write(b"A");
    assert_eq!(recv(&mut first, 1).await, b"A");

    let mut second = server.connect(addr).await;

    server.write(b"B");
    server.write(b"C");

    assert_eq!(recv(&mut first, 2).await, b"BC");
    assert_eq!(recv(&mut second, 2).await, b"BC");
    assert_silent(&mut second).await;

    // Both clients joined the same session.
    assert_eq!(server.stats().sessions_started, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_back_to_back_connections_both_receive() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();
    sleep(SETTLE).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;

    server.write(b"both");

    assert_eq!(recv(&mut first, 4).await, b"both");
    assert_eq!(recv(&mut second, 4).await, b"both");

    server.shutdown().await;
}

#[tokio::test]
async fn test_many_bytes_reach_all_clients_unmodified() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(server.connect(addr).await);
    }
    server.wait_until("session start", |s| s.sessions_started == 1).await;

    let payload: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(97) {
        server.write(chunk);
    }

    for client in &mut clients {
        assert_eq!(recv(client, payload.len()).await, payload);
    }

    server.shutdown().await;
}

// ============================================================================
// Isolation and Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_closed_client_does_not_affect_others() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let first = server.connect(addr).await;
    let mut second = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;

    drop(first);
    sleep(SETTLE).await;

    server.write(b"X");
    assert_eq!(recv(&mut second, 1).await, b"X");

    // Keep writing until the dead client has certainly been pruned.
    for _ in 0..5 {
        server.write(b"Y");
        sleep(POLL_INTERVAL).await;
    }
    assert_eq!(recv(&mut second, 5).await, b"YYYYY");

    // The session survives as long as the second client is connected.
    assert_eq!(server.stats().sessions_drained, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_last_disconnect_ends_session_and_reopens_source() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let mut client = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;

    server.write(b"A");
    assert_eq!(recv(&mut client, 1).await, b"A");
    drop(client);

    // Removal happens on a failed write, so keep the source moving.
    let start = tokio::time::Instant::now();
    while server.stats().sessions_drained == 0 && start.elapsed() < WAIT_TIMEOUT {
        server.write(b"z");
        sleep(POLL_INTERVAL).await;
    }
    assert_eq!(server.stats().sessions_drained, 1);

    // Replace the file. A stale handle would keep reading the old one.
    let dir = server.source.parent().unwrap().to_path_buf();
    std::fs::rename(&server.source, dir.join("klog.1")).unwrap();
    std::fs::write(&server.source, b"").unwrap();

    let mut client = server.connect(addr).await;
    server.wait_until("second session", |s| s.sessions_started == 2).await;
    sleep(SETTLE).await;

    server.write(b"N");
    assert_eq!(recv(&mut client, 1).await, b"N");

    // Still the same listener: draining a session is not a failure.
    assert_eq!(server.stats().failed_attempts, 0);

    server.shutdown().await;
}

// ============================================================================
// Recovery Tests
// ============================================================================

#[tokio::test]
async fn test_missing_source_has_no_listener_until_it_appears() {
    let server = TestServer::spawn_with(false);

    server
        .wait_until("repeated failures", |s| s.failed_attempts >= 2)
        .await;
    assert!(server.supervisor.listening().borrow().is_none());
    assert_eq!(server.stats().sessions_started, 0);

    std::fs::write(&server.source, b"").unwrap();
    let addr = server.addr().await;

    let mut client = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;

    server.write(b"up");
    assert_eq!(recv(&mut client, 2).await, b"up");

    server.shutdown().await;
}

#[tokio::test]
async fn test_rotated_source_ends_session_and_recovers() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let mut client = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;

    let dir = server.source.parent().unwrap().to_path_buf();
    std::fs::rename(&server.source, dir.join("klog.1")).unwrap();
    std::fs::write(&server.source, b"").unwrap();

    // The session fails, closing every client.
    let mut buf = [0u8; 8];
    let n = timeout(WAIT_TIMEOUT, client.read(&mut buf))
        .await
        .expect("client was not disconnected")
        .unwrap_or(0);
    assert_eq!(n, 0);
    server.wait_until("failed attempt", |s| s.failed_attempts == 1).await;

    // The supervisor rebinds after its backoff and serves the new file.
    let addr = server.addr().await;
    let mut client = server.connect(addr).await;
    server.wait_until("second session", |s| s.sessions_started == 2).await;
    sleep(SETTLE).await;

    server.write(b"fresh");
    assert_eq!(recv(&mut client, 5).await, b"fresh");

    server.shutdown().await;
}

#[tokio::test]
async fn test_announces_servable_addresses_only() {
    let server = TestServer::spawn();
    let addr = server.addr().await;

    let messages = server.notifier.messages();
    assert_eq!(
        messages,
        vec![format!(
            "Serving {} on 192.168.7.2:{} (eth0)",
            server.source.display(),
            addr.port()
        )]
    );

    server.shutdown().await;
}

// ============================================================================
// Device Source Tests
// ============================================================================

#[tokio::test]
async fn test_device_source_is_reopened_after_drain() {
    let server = TestServer::spawn_fifo();
    // Read-write handle: keeps a writer attached between sessions.
    let mut feed = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&server.source)
        .unwrap();
    let addr = server.addr().await;

    let mut client = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;
    assert_eq!(open_handles(&server.source), 2);

    feed.write_all(b"dev").unwrap();
    assert_eq!(recv(&mut client, 3).await, b"dev");
    drop(client);

    let start = tokio::time::Instant::now();
    while server.stats().sessions_drained == 0 && start.elapsed() < WAIT_TIMEOUT {
        feed.write_all(b"z").unwrap();
        sleep(POLL_INTERVAL).await;
    }
    assert_eq!(server.stats().sessions_drained, 1);
    assert_eq!(open_handles(&server.source), 1);

    let _client = server.connect(addr).await;
    server.wait_until("second session", |s| s.sessions_started == 2).await;
    sleep(SETTLE).await;
    assert_eq!(open_handles(&server.source), 2);

    // Shutdown releases the device even while a read is pending.
    server.cancel_token.cancel();
    sleep(SHUTDOWN_GRACE_PERIOD).await;
    assert_eq!(open_handles(&server.source), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_device_end_of_stream_ends_session_and_recovers() {
    let server = TestServer::spawn_fifo();
    let addr = server.addr().await;

    let mut client = server.connect(addr).await;
    server.wait_until("session start", |s| s.sessions_started == 1).await;
    sleep(SETTLE).await;

    let mut writer = fifo_writer(&server.source);
    writer.write_all(b"A").unwrap();
    assert_eq!(recv(&mut client, 1).await, b"A");

    // Last writer gone: end-of-stream fails the session and closes clients.
    drop(writer);
    let mut buf = [0u8; 8];
    let n = timeout(WAIT_TIMEOUT, client.read(&mut buf))
        .await
        .expect("client was not disconnected")
        .unwrap_or(0);
    assert_eq!(n, 0);
    server.wait_until("failed attempt", |s| s.failed_attempts == 1).await;
    assert_eq!(open_handles(&server.source), 0);

    // After the backoff the device is opened again for the next session.
    let addr = server.addr().await;
    let mut client = server.connect(addr).await;
    server.wait_until("second session", |s| s.sessions_started == 2).await;
    sleep(SETTLE).await;

    let mut writer = fifo_writer(&server.source);
    writer.write_all(b"B").unwrap();
    assert_eq!(recv(&mut client, 1).await, b"B");

    server.shutdown().await;
}
