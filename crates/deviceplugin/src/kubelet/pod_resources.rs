use std::collections::HashSet;
use std::path::Path;

use device_plugin_pb::pod_resources::pod_resources_lister_client::PodResourcesListerClient;
use device_plugin_pb::pod_resources::ListPodResourcesRequest;
use device_plugin_pb::pod_resources::ListPodResourcesResponse;
use error_stack::Report;
use error_stack::ResultExt;

use super::connect_uds;
use super::KubeletError;

/// Ids of the `resource_name` devices held by any container the kubelet
/// currently knows about.
pub async fn devices_in_use(
    socket: &Path,
    resource_name: &str,
) -> Result<HashSet<String>, Report<KubeletError>> {
    let channel = connect_uds(socket).await?;
    let mut client = PodResourcesListerClient::new(channel);

    let response = client
        .list(ListPodResourcesRequest {})
        .await
        .change_context(KubeletError::PodResources)?
        .into_inner();

    Ok(collect_devices(&response, resource_name))
}

fn collect_devices(response: &ListPodResourcesResponse, resource_name: &str) -> HashSet<String> {
    response
        .pod_resources
        .iter()
        .flat_map(|pod| &pod.containers)
        .flat_map(|container| &container.devices)
        .filter(|devices| devices.resource_name == resource_name)
        .flat_map(|devices| devices.device_ids.iter().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use device_plugin_pb::pod_resources::ContainerDevices;
    use device_plugin_pb::pod_resources::ContainerResources;
    use device_plugin_pb::pod_resources::PodResources;
    use test_log::test;

    use super::*;

    fn container(devices: &[(&str, &[&str])]) -> ContainerResources {
        ContainerResources {
            name: "app".to_string(),
            devices: devices
                .iter()
                .map(|(resource, ids)| ContainerDevices {
                    resource_name: resource.to_string(),
                    device_ids: ids.iter().map(|id| id.to_string()).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn only_devices_of_the_resource_are_collected() {
        let response = ListPodResourcesResponse {
            pod_resources: vec![
                PodResources {
                    name: "a".to_string(),
                    namespace: "default".to_string(),
                    containers: vec![
                        container(&[("afxdp/fast", &["ens1", "ens2"])]),
                        container(&[("afxdp/slow", &["ens9"]), ("nvidia.com/gpu", &["0"])]),
                    ],
                },
                PodResources {
                    name: "b".to_string(),
                    namespace: "default".to_string(),
                    containers: vec![container(&[("afxdp/fast", &["ens3"])])],
                },
            ],
        };

        let in_use = collect_devices(&response, "afxdp/fast");
        assert_eq!(
            in_use,
            HashSet::from(["ens1".to_string(), "ens2".to_string(), "ens3".to_string()])
        );
        assert!(collect_devices(&response, "afxdp/none").is_empty());
    }

    #[test(tokio::test)]
    async fn missing_socket_fails_to_connect() {
        let dir = tempfile::tempdir().unwrap();
        let err = devices_in_use(&dir.path().join("kubelet.sock"), "afxdp/fast")
            .await
            .unwrap_err();
        assert!(matches!(err.current_context(), KubeletError::Connect(_)));
    }
}
