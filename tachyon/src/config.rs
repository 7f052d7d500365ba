use crate::cluster::ClusterConfig;
use crate::net::codec::CodecKind;
use crate::net::reactor::{AcceptPolicy, WorkerSelect};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

pub const DEFAULT_PORT: u16 = 16379;

#[derive(Serialize, Deserialize)]
pub struct Server {
    pub address: String,
    pub worker_num: u32,
    /// `round_robin` or `addr_hash`.
    pub accept_select: String,
    pub downstream_codec: String,
    pub keep_alive_secs: f64,
    pub conn_limit_per_addr: u32,
    pub conn_limit_window_secs: f64,
}

#[derive(Serialize, Deserialize)]
pub struct Router {
    pub identify: String,
    /// Comma-separated seed list.
    pub seed_addresses: String,
    pub with_ssl: bool,
    pub pipeline: bool,
    pub enable_readonly: bool,
    pub timeout_seconds: f64,
    pub auth_password: Option<String>,
}

#[derive(Serialize, Deserialize)]
pub struct Log {
    pub level: String,
    pub destination: String,
}

#[derive(Serialize, Deserialize)]
pub struct NodeConfig {
    pub server: Server,
    pub router: Option<Router>,
    pub log: Log,
}

impl Default for NodeConfig {
    fn default() -> NodeConfig {
        NodeConfig {
            server: Server {
                address: format!("0.0.0.0:{}", DEFAULT_PORT),
                worker_num: 4,
                accept_select: "round_robin".to_string(),
                downstream_codec: "resp".to_string(),
                keep_alive_secs: 30.0,
                conn_limit_per_addr: 0,
                conn_limit_window_secs: 10.0,
            },
            router: None,
            log: Log {
                level: "debug".to_string(),
                destination: "stderr".to_string(),
            },
        }
    }
}

impl NodeConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> NodeConfig {
        serdeconv::from_toml_file(path).expect("Error loading node configuration file")
    }

    /// The sloggers TOML snippet matching the `[log]` section.
    pub fn logger_toml(&self) -> String {
        format!(
            "type = \"terminal\"\nlevel = \"{}\"\ndestination = \"{}\"\n",
            self.log.level, self.log.destination
        )
    }

    pub fn accept_policy(&self) -> AcceptPolicy {
        AcceptPolicy {
            select: match self.server.accept_select.as_str() {
                "addr_hash" => WorkerSelect::AddrHash,
                _ => WorkerSelect::RoundRobin,
            },
            codec: match self.server.downstream_codec.as_str() {
                "relay" => CodecKind::Relay,
                "raw" => CodecKind::Raw,
                _ => CodecKind::Resp,
            },
            keep_alive: self.server.keep_alive_secs,
            conn_limit_per_addr: self.server.conn_limit_per_addr,
            window_secs: self.server.conn_limit_window_secs,
        }
    }

    pub fn cluster_config(&self) -> Option<ClusterConfig> {
        self.router.as_ref().map(|router| ClusterConfig {
            identify: router.identify.clone(),
            with_ssl: router.with_ssl,
            pipeline: router.pipeline,
            enable_readonly: router.enable_readonly,
            timeout_seconds: router.timeout_seconds,
            seed_addresses: router
                .seed_addresses
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            auth_password: router.auth_password.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[server]
address = "0.0.0.0:16379"
worker_num = 2
accept_select = "addr_hash"
downstream_codec = "resp"
keep_alive_secs = 30.0
conn_limit_per_addr = 64
conn_limit_window_secs = 10.0

[router]
identify = "cache-main"
seed_addresses = "10.0.0.1:7000, 10.0.0.2:7000,10.0.0.3:7000"
with_ssl = false
pipeline = true
enable_readonly = true
timeout_seconds = 7.0

[log]
level = "info"
destination = "stderr"
"#;

    #[test]
    fn test_parse_example() {
        let config: NodeConfig = serdeconv::from_toml_str(EXAMPLE).unwrap();

        assert_eq!(config.server.worker_num, 2);
        assert_eq!(config.accept_policy().select, WorkerSelect::AddrHash);
        assert_eq!(config.accept_policy().conn_limit_per_addr, 64);

        let cluster = config.cluster_config().unwrap();
        assert_eq!(cluster.identify, "cache-main");
        assert_eq!(
            cluster.seed_addresses,
            ["10.0.0.1:7000", "10.0.0.2:7000", "10.0.0.3:7000"]
        );
        assert!(cluster.pipeline);
        assert!(cluster.enable_readonly);
        assert_eq!(cluster.auth_password, None);
    }

    #[test]
    fn test_default_has_no_router() {
        let config = NodeConfig::default();

        assert!(config.cluster_config().is_none());
        assert_eq!(config.accept_policy().select, WorkerSelect::RoundRobin);
    }

    #[test]
    fn test_logger_toml_shape() {
        let config = NodeConfig::default();

        let toml = config.logger_toml();

        assert!(toml.contains("type = \"terminal\""));
        assert!(toml.contains("level = \"debug\""));
    }
}
