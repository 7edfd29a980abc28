use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tower::service_fn;

use super::KubeletError;
use crate::constants;

/// Opens a gRPC channel over the Unix socket at `socket_path`.
pub async fn connect_uds(socket_path: &Path) -> Result<Channel, Report<KubeletError>> {
    let path = socket_path.to_path_buf();

    // The URI is a placeholder, the connector always dials the socket.
    let endpoint = Endpoint::from_static("http://tonic");
    let connect = endpoint.connect_with_connector(service_fn({
        let path = path.clone();
        move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await.map(TokioIo::new) }
        }
    }));

    tokio::time::timeout(constants::KUBELET_DIAL_TIMEOUT, connect)
        .await
        .map_err(|_| Report::new(KubeletError::Timeout(path.clone())))?
        .change_context_lazy(|| KubeletError::Connect(path))
}
