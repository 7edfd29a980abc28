use std::os::fd::OwnedFd;
use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;

use super::fd;
use super::protocol::MAX_MESSAGE_LEN;
use super::HandoffError;
use super::Request;
use super::Response;
use crate::constants;

/// Workload side of the handshake: asks the endpoint at `path` for the socket
/// of `device`.
pub async fn request_socket(path: impl AsRef<Path>, device: &str) -> Result<OwnedFd, HandoffError> {
    let mut stream = UnixStream::connect(path.as_ref())
        .await
        .map_err(HandoffError::Connect)?;

    let request = Request::Socket {
        device: device.to_string(),
    };
    stream.write_all(request.encode().as_bytes()).await?;

    let mut buf = [0u8; MAX_MESSAGE_LEN];
    let (n, socket) = tokio::time::timeout(
        constants::HANDSHAKE_READ_TIMEOUT,
        fd::recv_fd(&stream, &mut buf),
    )
    .await
    .map_err(|_| HandoffError::Timeout)??;

    let line = String::from_utf8_lossy(&buf[..n]);
    match Response::parse(&line)? {
        Response::Ack => socket.ok_or(HandoffError::MissingFd),
        Response::Nak { reason } => Err(HandoffError::Rejected(reason)),
    }
}
