//! Configuration for the virtual kubelet.
//!
//! Flags are parsed with clap; every flag can also come from the
//! environment. [`Config::from_cli`] validates and converts them into the
//! settings the components consume.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use k8s_openapi::api::core::v1::Taint;
use vk_errdefs::{Error, Result};

use crate::control_plane::PodScope;
use crate::node::NodeConfig;
use crate::provider::{ProviderInit, ProviderKind};
use crate::status::MirrorConfig;

/// Default taint key keeping ordinary workloads off the node.
pub const DEFAULT_TAINT_KEY: &str = "virtual-kubelet.io/provider";

/// Kubelet version reported in node info.
pub const KUBELET_VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));

const TAINT_EFFECTS: &[&str] = &["NoSchedule", "NoExecute", "PreferNoSchedule"];

// =============================================================================
// Flags
// =============================================================================

/// Command-line flags.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "virtual-kubelet",
    version,
    about = "Registers a virtual node and runs its pods on a provider"
)]
pub struct Cli {
    /// Credentials for the control plane. In-cluster config when absent.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Namespace to watch. Empty watches all namespaces.
    #[arg(long, env = "VK_NAMESPACE", default_value = "")]
    pub namespace: String,

    /// Unique node name.
    #[arg(long, env = "DEFAULT_NODE_NAME", default_value = "virtual-kubelet")]
    pub nodename: String,

    /// Operating system label (Linux or Windows).
    #[arg(long, env = "VK_OS", default_value = "Linux")]
    pub os: String,

    /// Registered provider name.
    #[arg(long, env = "VK_PROVIDER", default_value = "mock")]
    pub provider: String,

    /// Provider-specific config file.
    #[arg(long, env = "VK_PROVIDER_CONFIG")]
    pub provider_config: Option<PathBuf>,

    /// Taint key.
    #[arg(long = "taint", env = "VK_TAINT_KEY", default_value = DEFAULT_TAINT_KEY)]
    pub taint_key: String,

    /// Taint value. Defaults to the provider name.
    #[arg(long, env = "VK_TAINT_VALUE")]
    pub taint_value: Option<String>,

    /// Taint effect.
    #[arg(long, env = "VK_TAINT_EFFECT", default_value = "NoSchedule")]
    pub taint_effect: String,

    /// Register the node without a taint.
    #[arg(long, env = "VK_DISABLE_TAINT")]
    pub disable_taint: bool,

    /// Kubelet daemon endpoint port.
    #[arg(long, env = "KUBELET_PORT", default_value_t = 10250)]
    pub daemon_port: u16,

    /// Node internal address.
    #[arg(long, env = "VKUBELET_POD_IP", default_value = "127.0.0.1")]
    pub internal_ip: String,

    /// Concurrent pod sync workers.
    #[arg(long, env = "VK_POD_SYNC_WORKERS", default_value_t = 4)]
    pub pod_sync_workers: usize,

    #[arg(long, env = "VK_PING_INTERVAL_SECS", default_value_t = 10)]
    pub ping_interval_secs: u64,

    /// Deadline for one provider ping. Unbounded when absent.
    #[arg(long, env = "VK_PING_TIMEOUT_SECS")]
    pub ping_timeout_secs: Option<u64>,

    #[arg(long, env = "VK_LEASE_RENEW_INTERVAL_SECS", default_value_t = 10)]
    pub lease_renew_interval_secs: u64,

    #[arg(long, env = "VK_NODE_STATUS_INTERVAL_SECS", default_value_t = 30)]
    pub node_status_interval_secs: u64,

    #[arg(long, env = "VK_STATUS_SYNC_INTERVAL_SECS", default_value_t = 5)]
    pub status_sync_interval_secs: u64,

    /// Per-component drain budget on shutdown.
    #[arg(long, env = "VK_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Concurrent requests to the control plane.
    #[arg(long, env = "VK_MAX_INFLIGHT_REQUESTS", default_value_t = 32)]
    pub max_inflight_requests: usize,

    /// Address for the kubelet HTTP surface; the port is the daemon port.
    #[arg(long, env = "VK_LISTEN_ADDR", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub listen_addr: IpAddr,

    /// PEM certificate chain for the HTTP surface.
    #[arg(long, env = "APISERVER_CERT_LOCATION")]
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for the HTTP surface.
    #[arg(long, env = "APISERVER_KEY_LOCATION")]
    pub tls_key: Option<PathBuf>,

    /// PEM CA bundle; when set, clients must present a certificate.
    #[arg(long, env = "APISERVER_CA_CERT_LOCATION")]
    pub client_ca: Option<PathBuf>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "VK_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "VK_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Operating systems a node may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatingSystem {
    Linux,
    Windows,
}

impl OperatingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "Linux",
            Self::Windows => "Windows",
        }
    }
}

impl fmt::Display for OperatingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingSystem {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            _ => Err(Error::invalid_input(format!(
                "unsupported operating system {s:?}, expected Linux or Windows"
            ))),
        }
    }
}

// =============================================================================
// Validated config
// =============================================================================

/// TLS material for the HTTP surface.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub client_ca: Option<PathBuf>,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub kubeconfig: Option<PathBuf>,
    pub namespace: Option<String>,
    pub node_name: String,
    pub os: OperatingSystem,
    pub provider: ProviderKind,
    pub provider_config: Option<PathBuf>,
    pub taint: Option<Taint>,
    pub internal_ip: String,
    pub daemon_port: u16,
    pub pod_sync_workers: usize,
    pub ping_interval: Duration,
    pub ping_timeout: Option<Duration>,
    pub lease_renew_interval: Duration,
    pub node_status_interval: Duration,
    pub status_sync_interval: Duration,
    pub shutdown_timeout: Duration,
    pub max_inflight_requests: usize,
    pub listen_addr: SocketAddr,
    pub tls: Option<TlsConfig>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let node_name = cli.nodename.trim().to_string();
        if node_name.is_empty() {
            return Err(Error::invalid_input("node name must not be empty"));
        }
        let os: OperatingSystem = cli.os.parse()?;
        let provider: ProviderKind = cli.provider.parse()?;

        let taint = if cli.disable_taint {
            None
        } else {
            let value = cli
                .taint_value
                .unwrap_or_else(|| provider.name().to_string());
            Some(parse_taint(&cli.taint_key, &value, &cli.taint_effect)?)
        };

        let tls = match (cli.tls_cert, cli.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig {
                cert,
                key,
                client_ca: cli.client_ca,
            }),
            (None, None) if cli.client_ca.is_none() => None,
            (None, None) => {
                return Err(Error::invalid_input("--client-ca requires --tls-cert and --tls-key"))
            }
            _ => {
                return Err(Error::invalid_input(
                    "--tls-cert and --tls-key must be given together",
                ))
            }
        };

        if cli.pod_sync_workers == 0 {
            return Err(Error::invalid_input("--pod-sync-workers must be at least 1"));
        }
        if cli.max_inflight_requests == 0 {
            return Err(Error::invalid_input("--max-inflight-requests must be at least 1"));
        }
        if cli.daemon_port == 0 {
            return Err(Error::invalid_input("daemon port must be nonzero"));
        }

        let namespace = Some(cli.namespace.trim().to_string()).filter(|ns| !ns.is_empty());

        Ok(Self {
            kubeconfig: cli.kubeconfig,
            namespace,
            node_name,
            os,
            provider,
            provider_config: cli.provider_config,
            taint,
            internal_ip: cli.internal_ip,
            daemon_port: cli.daemon_port,
            pod_sync_workers: cli.pod_sync_workers,
            ping_interval: seconds("--ping-interval-secs", cli.ping_interval_secs)?,
            ping_timeout: cli
                .ping_timeout_secs
                .map(|s| seconds("--ping-timeout-secs", s))
                .transpose()?,
            lease_renew_interval: seconds(
                "--lease-renew-interval-secs",
                cli.lease_renew_interval_secs,
            )?,
            node_status_interval: seconds(
                "--node-status-interval-secs",
                cli.node_status_interval_secs,
            )?,
            status_sync_interval: seconds(
                "--status-sync-interval-secs",
                cli.status_sync_interval_secs,
            )?,
            shutdown_timeout: seconds("--shutdown-timeout-secs", cli.shutdown_timeout_secs)?,
            max_inflight_requests: cli.max_inflight_requests,
            listen_addr: SocketAddr::new(cli.listen_addr, cli.daemon_port),
            tls,
            log_level: cli.log_level,
            log_format: cli.log_format,
        })
    }

    /// Deadline for a single control-plane request.
    pub fn request_timeout(&self) -> Duration {
        self.lease_renew_interval
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            name: self.node_name.clone(),
            taint: self.taint.clone(),
            version: KUBELET_VERSION.to_string(),
            status_interval: self.node_status_interval,
            ping_interval: self.ping_interval,
        }
    }

    pub fn provider_init(&self) -> ProviderInit {
        ProviderInit {
            node_name: self.node_name.clone(),
            operating_system: self.os.to_string(),
            internal_ip: self.internal_ip.clone(),
            daemon_port: i32::from(self.daemon_port),
            config_path: self.provider_config.clone(),
        }
    }

    pub fn pod_scope(&self) -> PodScope {
        PodScope {
            node_name: self.node_name.clone(),
            namespace: self.namespace.clone(),
        }
    }

    pub fn mirror_config(&self) -> MirrorConfig {
        MirrorConfig {
            interval: self.status_sync_interval,
            workers: self.pod_sync_workers,
        }
    }
}

fn seconds(flag: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        return Err(Error::invalid_input(format!("{flag} must be nonzero")));
    }
    Ok(Duration::from_secs(secs))
}

/// Build a node taint, validating the effect.
pub fn parse_taint(key: &str, value: &str, effect: &str) -> Result<Taint> {
    let key = key.trim();
    if key.is_empty() {
        return Err(Error::invalid_input("taint key must not be empty"));
    }
    if !TAINT_EFFECTS.contains(&effect) {
        return Err(Error::invalid_input(format!(
            "taint effect {effect:?} is not one of {}",
            TAINT_EFFECTS.join(", ")
        )));
    }
    Ok(Taint {
        key: key.to_string(),
        value: Some(value.to_string()).filter(|v| !v.is_empty()),
        effect: effect.to_string(),
        time_added: None,
    })
}
