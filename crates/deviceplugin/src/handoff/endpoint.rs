use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::fd;
use super::protocol::MAX_MESSAGE_LEN;
use super::HandoffError;
use super::Request;
use super::Response;
use super::SessionLedger;
use crate::constants;
use crate::pool::AllocationId;

/// A socket created for one allocated device, waiting for its workload.
#[derive(Debug)]
pub struct HandoffSession {
    pub device: String,
    pub socket: OwnedFd,
}

/// The listening side of one container allocation. Dropping it removes the
/// socket file and its directory.
#[derive(Debug)]
pub struct HandoffEndpoint {
    allocation: AllocationId,
    dir: PathBuf,
    socket_path: PathBuf,
    listener: UnixListener,
    sessions: BTreeMap<String, OwnedFd>,
    deadline: Instant,
}

impl HandoffEndpoint {
    /// Binds `<dir>/afxdp.sock`. Sessions not consumed within `timeout` are
    /// reclaimed.
    pub fn bind(
        dir: impl Into<PathBuf>,
        allocation: AllocationId,
        sessions: Vec<HandoffSession>,
        timeout: Duration,
    ) -> io::Result<Self> {
        let dir = dir.into();
        let socket_path = dir.join(constants::HANDOFF_SOCKET_NAME);

        fs::create_dir_all(&dir)?;
        utils::fs::remove_file_if_exists(&socket_path)?;
        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = utils::fs::remove_dir_if_exists(&dir);
                return Err(e);
            }
        };

        let endpoint = Self {
            allocation,
            dir,
            socket_path,
            listener,
            sessions: sessions
                .into_iter()
                .map(|session| (session.device, session.socket))
                .collect(),
            deadline: Instant::now() + timeout,
        };
        // workloads may run unprivileged
        fs::set_permissions(&endpoint.socket_path, fs::Permissions::from_mode(0o666))?;

        debug!(
            path = %endpoint.socket_path.display(),
            devices = ?endpoint.pending(),
            "handoff endpoint bound"
        );
        Ok(endpoint)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Devices whose session has not been consumed yet.
    pub fn pending(&self) -> Vec<String> {
        self.sessions.keys().cloned().collect()
    }

    /// Serves handshakes until every session is consumed, the deadline passes
    /// or `token` is cancelled. Unconsumed sessions are handed back to
    /// `ledger`, then the endpoint is removed.
    ///
    /// Requests are read concurrently, each within
    /// [`constants::HANDSHAKE_READ_TIMEOUT`], so a silent client does not hold
    /// up the others.
    #[tracing::instrument(skip_all, fields(allocation = %self.allocation))]
    pub async fn serve<L: SessionLedger>(mut self, ledger: Arc<L>, token: CancellationToken) {
        let deadline = tokio::time::sleep_until(self.deadline);
        tokio::pin!(deadline);
        let mut requests = JoinSet::new();

        while !self.sessions.is_empty() {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("handoff endpoint cancelled");
                    break;
                }
                _ = &mut deadline => {
                    warn!(devices = ?self.pending(), "handoff session expired unconsumed, reclaiming devices");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        requests.spawn(read_request_within_timeout(stream));
                    }
                    Err(e) => warn!("failed to accept handoff connection: {e}"),
                },
                Some(read) = requests.join_next() => match read {
                    Ok((stream, Ok(line))) => self.handle(stream, &line, ledger.as_ref()).await,
                    Ok((_, Err(HandoffError::Timeout))) => warn!("handoff client sent no request in time"),
                    Ok((_, Err(e))) => warn!("failed to read handoff request: {e}"),
                    Err(e) => warn!("handoff request reader failed: {e}"),
                },
            }
        }
        // drops connections still being read
        requests.shutdown().await;

        let pending = self.pending();
        // close our copies before the devices become allocatable again
        self.sessions.clear();
        if !pending.is_empty() {
            ledger.reclaimed(self.allocation, pending).await;
        }
    }

    async fn handle<L: SessionLedger>(&mut self, mut stream: UnixStream, line: &str, ledger: &L) {
        let device = match Request::parse(line) {
            Ok(Request::Socket { device }) => device,
            Err(e) => {
                reply(&mut stream, Response::nak(e.to_string())).await;
                return;
            }
        };

        let Some(socket) = self.sessions.remove(&device) else {
            warn!(device = %device, "handoff requested for a device without pending session");
            reply(
                &mut stream,
                Response::nak(format!("device {device} has no pending session")),
            )
            .await;
            return;
        };

        match fd::send_fd(&stream, Response::Ack.encode().as_bytes(), socket.as_fd()).await {
            Ok(()) => {
                info!(device = %device, "socket handed over to workload");
                ledger.consumed(self.allocation, &device).await;
            }
            Err(e) => {
                warn!(device = %device, "failed to transfer socket, session stays pending: {e}");
                self.sessions.insert(device, socket);
            }
        }
    }
}

impl Drop for HandoffEndpoint {
    fn drop(&mut self) {
        if let Err(e) = utils::fs::remove_dir_if_exists(&self.dir) {
            warn!(path = %self.dir.display(), "failed to remove handoff endpoint: {e}");
        }
    }
}

async fn read_request_within_timeout(
    mut stream: UnixStream,
) -> (UnixStream, Result<String, HandoffError>) {
    let line = tokio::time::timeout(constants::HANDSHAKE_READ_TIMEOUT, read_request(&mut stream))
        .await
        .unwrap_or(Err(HandoffError::Timeout));
    (stream, line)
}

/// Reads one newline-terminated request.
async fn read_request(stream: &mut UnixStream) -> Result<String, HandoffError> {
    let mut buf = Vec::with_capacity(64);
    let mut chunk = [0u8; MAX_MESSAGE_LEN];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandoffError::Io(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.iter().position(|&b| b == b'\n') {
            buf.truncate(end);
            return String::from_utf8(buf)
                .map_err(|e| HandoffError::Malformed(String::from_utf8_lossy(e.as_bytes()).into_owned()));
        }
        if buf.len() >= MAX_MESSAGE_LEN {
            return Err(HandoffError::Malformed(String::from_utf8_lossy(&buf).into_owned()));
        }
    }
}

async fn reply(stream: &mut UnixStream, response: Response) {
    if let Err(e) = stream.write_all(response.encode().as_bytes()).await {
        debug!("failed to send handoff reply: {e}");
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixDatagram;
    use std::sync::Mutex;

    use test_log::test;

    use super::*;
    use crate::handoff::request_socket;

    #[derive(Default)]
    struct RecordingLedger {
        consumed: Mutex<Vec<String>>,
        reclaimed: Mutex<Vec<String>>,
    }

    impl SessionLedger for RecordingLedger {
        async fn consumed(&self, _allocation: AllocationId, device: &str) {
            self.consumed.lock().unwrap().push(device.to_string());
        }

        async fn reclaimed(&self, _allocation: AllocationId, devices: Vec<String>) {
            self.reclaimed.lock().unwrap().extend(devices);
        }
    }

    /// A session whose socket identifies itself by sending the device name.
    fn session(device: &str) -> (HandoffSession, UnixDatagram) {
        let (ours, theirs) = UnixDatagram::pair().unwrap();
        (
            HandoffSession {
                device: device.to_string(),
                socket: OwnedFd::from(ours),
            },
            theirs,
        )
    }

    #[test(tokio::test)]
    async fn each_session_is_consumed_once() {
        let root = tempfile::tempdir().unwrap();
        let (first, first_peer) = session("eth-pool-0");
        let (second, _second_peer) = session("eth-pool-1");
        let endpoint = HandoffEndpoint::bind(
            root.path().join("alloc"),
            AllocationId::new(),
            vec![first, second],
            Duration::from_secs(30),
        )
        .unwrap();
        let path = endpoint.socket_path().to_path_buf();
        let dir = endpoint.dir().to_path_buf();

        let ledger = Arc::new(RecordingLedger::default());
        let task = tokio::spawn(endpoint.serve(ledger.clone(), CancellationToken::new()));

        let fd = request_socket(&path, "eth-pool-0").await.unwrap();
        UnixDatagram::from(fd).send(b"hello").unwrap();
        let mut buf = [0u8; 5];
        first_peer.recv(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        let err = request_socket(&path, "eth-pool-0").await.unwrap_err();
        assert!(matches!(err, HandoffError::Rejected(_)), "{err:?}");

        request_socket(&path, "eth-pool-1").await.unwrap();
        task.await.unwrap();

        assert_eq!(*ledger.consumed.lock().unwrap(), vec!["eth-pool-0", "eth-pool-1"]);
        assert!(ledger.reclaimed.lock().unwrap().is_empty());
        assert!(!dir.exists(), "endpoint must be removed once every session is consumed");
        assert!(matches!(
            request_socket(&path, "eth-pool-0").await,
            Err(HandoffError::Connect(_))
        ));
    }

    #[test(tokio::test)]
    async fn expired_sessions_are_reclaimed() {
        let root = tempfile::tempdir().unwrap();
        let (session, _peer) = session("eth-pool-0");
        let endpoint = HandoffEndpoint::bind(
            root.path().join("alloc"),
            AllocationId::new(),
            vec![session],
            Duration::from_millis(50),
        )
        .unwrap();
        let path = endpoint.socket_path().to_path_buf();

        let ledger = Arc::new(RecordingLedger::default());
        endpoint.serve(ledger.clone(), CancellationToken::new()).await;

        assert_eq!(*ledger.reclaimed.lock().unwrap(), vec!["eth-pool-0"]);
        assert!(!path.exists());
        assert!(request_socket(&path, "eth-pool-0").await.is_err());
    }

    #[test(tokio::test)]
    async fn cancellation_reclaims_and_removes() {
        let root = tempfile::tempdir().unwrap();
        let (session, _peer) = session("eth-pool-0");
        let endpoint = HandoffEndpoint::bind(
            root.path().join("alloc"),
            AllocationId::new(),
            vec![session],
            Duration::from_secs(30),
        )
        .unwrap();
        let dir = endpoint.dir().to_path_buf();

        let token = CancellationToken::new();
        let ledger = Arc::new(RecordingLedger::default());
        let task = tokio::spawn(endpoint.serve(ledger.clone(), token.clone()));
        token.cancel();
        task.await.unwrap();

        assert_eq!(*ledger.reclaimed.lock().unwrap(), vec!["eth-pool-0"]);
        assert!(!dir.exists());
    }

    #[test(tokio::test)]
    async fn silent_client_does_not_block_others() {
        let root = tempfile::tempdir().unwrap();
        let (first, _first_peer) = session("eth-pool-0");
        let (second, _second_peer) = session("eth-pool-1");
        let endpoint = HandoffEndpoint::bind(
            root.path().join("alloc"),
            AllocationId::new(),
            vec![first, second],
            Duration::from_secs(30),
        )
        .unwrap();
        let path = endpoint.socket_path().to_path_buf();
        let token = CancellationToken::new();
        let ledger = Arc::new(RecordingLedger::default());
        let task = tokio::spawn(endpoint.serve(ledger.clone(), token.clone()));

        let mut silent = UnixStream::connect(&path).await.unwrap();

        let fd = tokio::time::timeout(Duration::from_secs(2), request_socket(&path, "eth-pool-1"))
            .await
            .expect("a silent client must not delay other handshakes")
            .unwrap();
        drop(fd);

        // the silent connection is closed once the read timeout passes
        let mut buf = Vec::new();
        let read = tokio::time::timeout(
            constants::HANDSHAKE_READ_TIMEOUT + Duration::from_secs(5),
            silent.read_to_end(&mut buf),
        )
        .await
        .expect("silent connection was never closed");
        assert_eq!(read.unwrap(), 0);

        assert_eq!(*ledger.consumed.lock().unwrap(), vec!["eth-pool-1"]);
        token.cancel();
        task.await.unwrap();
        assert_eq!(*ledger.reclaimed.lock().unwrap(), vec!["eth-pool-0"]);
    }

    #[test(tokio::test)]
    async fn unknown_device_and_garbage_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let (session, _peer) = session("eth-pool-0");
        let endpoint = HandoffEndpoint::bind(
            root.path().join("alloc"),
            AllocationId::new(),
            vec![session],
            Duration::from_secs(30),
        )
        .unwrap();
        let path = endpoint.socket_path().to_path_buf();
        let token = CancellationToken::new();
        let task = tokio::spawn(endpoint.serve(Arc::new(RecordingLedger::default()), token.clone()));

        let err = request_socket(&path, "eth-pool-9").await.unwrap_err();
        assert!(matches!(err, HandoffError::Rejected(reason) if reason.contains("eth-pool-9")));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"hello\n").await.unwrap();
        let mut reply = String::new();
        stream.read_to_string(&mut reply).await.unwrap();
        assert!(reply.starts_with("/fd_nak,"), "{reply}");

        token.cancel();
        task.await.unwrap();
    }
}
