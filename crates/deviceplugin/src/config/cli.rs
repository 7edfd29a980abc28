use std::path::PathBuf;

use clap::Parser;
use utils::version;

use crate::constants;

/// AF_XDP device plugin for Kubernetes
#[derive(Parser, Debug, Clone)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "AFXDP_DP_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = constants::DEFAULT_CONFIG_FILE,
        help = "Location of the device plugin configuration file"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = constants::DEFAULT_LOG_DIR,
        help = "Directory the configured log file is created in"
    )]
    pub log_dir: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = constants::DEFAULT_DEVICE_PLUGIN_DIR,
        help = "Kubelet device plugin directory, holds kubelet.sock and the pool sockets"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        default_value = constants::DEFAULT_POD_RESOURCES_SOCKET,
        help = "Kubelet pod-resources socket used to detect released devices"
    )]
    pub pod_resources_socket: PathBuf,

    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        default_value = constants::DEFAULT_HANDOFF_DIR,
        help = "Host directory the per-pod handoff sockets are created in"
    )]
    pub handoff_dir: PathBuf,
}
