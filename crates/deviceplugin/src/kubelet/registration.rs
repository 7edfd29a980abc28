use std::path::Path;

use device_plugin_pb::api;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::RegisterRequest;
use error_stack::Report;
use error_stack::ResultExt;
use tonic::Request;
use tracing::info;

use super::connect_uds;
use super::KubeletError;

/// Announces `resource_name`, served at `endpoint` inside the device plugin
/// directory, to the kubelet.
#[tracing::instrument(skip(options))]
pub async fn register(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
    options: DevicePluginOptions,
) -> Result<(), Report<KubeletError>> {
    let channel = connect_uds(kubelet_socket).await?;
    let mut client = RegistrationClient::new(channel);

    let request = RegisterRequest {
        version: api::VERSION.to_string(),
        endpoint: endpoint.to_string(),
        resource_name: resource_name.to_string(),
        options: Some(options),
    };

    client
        .register(Request::new(request))
        .await
        .change_context_lazy(|| KubeletError::Registration(resource_name.to_string()))?;

    info!("registered with kubelet");
    Ok(())
}
