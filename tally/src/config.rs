//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Any validation failure
//! here is expected to stop the program before it binds a socket.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Environment variable holding literal YAML configuration contents. When
/// set it wins over the configuration file path.
pub const CONFIG_ENV_VAR: &str = "TALLY_CONFIG";

/// Errors produced by configuration loading
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error for IO operations when reading the config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
}

fn default_server_address() -> String {
    "localhost:8080".to_string()
}

fn default_poll_interval_seconds() -> u64 {
    2
}

fn default_report_interval_seconds() -> u64 {
    10
}

fn default_rate_limit() -> usize {
    1
}

/// Configuration for the collection agent
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// `host:port` of the aggregation server's HTTP surface
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// `host:port` of the aggregation server's gRPC surface. When set the
    /// agent reports over gRPC instead of HTTP.
    pub grpc_address: Option<String>,
    /// The period on which runtime readings are collected
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// The period on which collected readings are shipped to the server
    #[serde(default = "default_report_interval_seconds")]
    pub report_interval_seconds: u64,
    /// Delivery granularity: one ships each reading as its own additive
    /// update, any other value ships the whole snapshot as one bulk reload.
    #[serde(default)]
    pub batch_size: usize,
    /// Maximum number of in-flight outbound requests
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,
    /// Shared secret for integrity tags, disabled when absent or empty
    pub secret_key: Option<String>,
    /// Path to the server's RSA public key in PEM form, plaintext when
    /// absent
    pub crypto_key_path: Option<PathBuf>,
    /// Address to expose internal telemetry for prometheus scraping,
    /// disabled when absent
    pub telemetry_address: Option<SocketAddr>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            grpc_address: None,
            poll_interval_seconds: default_poll_interval_seconds(),
            report_interval_seconds: default_report_interval_seconds(),
            batch_size: 0,
            rate_limit: default_rate_limit(),
            secret_key: None,
            crypto_key_path: None,
            telemetry_address: None,
        }
    }
}

fn default_address() -> SocketAddr {
    "0.0.0.0:8080"
        .parse()
        .expect("Not possible to parse to SocketAddr")
}

fn default_concurrent_requests_max() -> usize {
    100
}

fn default_store_interval_seconds() -> u64 {
    300
}

fn default_restore() -> bool {
    true
}

/// Configuration for the aggregation server
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address and port for the HTTP ingest surface
    #[serde(default = "default_address")]
    pub address: SocketAddr,
    /// Address and port for the gRPC ingest surface, disabled when absent
    pub grpc_address: Option<SocketAddr>,
    /// Number of concurrent connections to allow
    #[serde(default = "default_concurrent_requests_max")]
    pub concurrent_requests_max: usize,
    /// The period on which state is snapshotted to the storage file. Zero
    /// snapshots synchronously after every mutation.
    #[serde(default = "default_store_interval_seconds")]
    pub store_interval_seconds: u64,
    /// Path of the snapshot file. Selects the file backend when set and no
    /// database is configured.
    pub file_storage_path: Option<PathBuf>,
    /// Whether to load the snapshot file at startup
    #[serde(default = "default_restore")]
    pub restore: bool,
    /// Database connection string. Selects the relational backend when set.
    pub database_dsn: Option<String>,
    /// Shared secret for integrity tags, disabled when absent or empty
    pub secret_key: Option<String>,
    /// Path to the server's RSA private key in PEM form, plaintext when
    /// absent
    pub crypto_key_path: Option<PathBuf>,
    /// Source subnet admitted to the ingest surfaces, CIDR notation or a
    /// bare address. Every source is admitted when absent.
    pub trusted_subnet: Option<String>,
    /// Address to expose internal telemetry for prometheus scraping,
    /// disabled when absent
    pub telemetry_address: Option<SocketAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            grpc_address: None,
            concurrent_requests_max: default_concurrent_requests_max(),
            store_interval_seconds: default_store_interval_seconds(),
            file_storage_path: None,
            restore: default_restore(),
            database_dsn: None,
            secret_key: None,
            crypto_key_path: None,
            trusted_subnet: None,
            telemetry_address: None,
        }
    }
}

/// Load a configuration, preferring literal contents in [`CONFIG_ENV_VAR`]
/// over the file at `path`. A missing file is not an error, defaults apply.
///
/// # Errors
///
/// Function will error if the file exists but cannot be read, or contents
/// from either source do not parse.
pub fn load<T>(path: &Path) -> Result<T, Error>
where
    T: DeserializeOwned + Default,
{
    if let Ok(contents) = env::var(CONFIG_ENV_VAR) {
        debug!("Using config from env var '{CONFIG_ENV_VAR}'");
        return Ok(serde_yaml::from_str(&contents)?);
    }
    match fs::read_to_string(path) {
        Ok(contents) => Ok(serde_yaml::from_str(&contents)?),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!("No config file at {path:?}, using defaults");
            Ok(T::default())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_deserializes() {
        let contents = r#"
address: "127.0.0.1:9090"
grpc_address: "127.0.0.1:9091"
store_interval_seconds: 0
file_storage_path: "/var/lib/tally/metrics.json"
restore: false
secret_key: "church-key"
trusted_subnet: "10.0.0.0/8"
"#;
        let config: ServerConfig = serde_yaml::from_str(contents).expect("valid config");
        assert_eq!(
            config,
            ServerConfig {
                address: "127.0.0.1:9090".parse().expect("static string"),
                grpc_address: Some("127.0.0.1:9091".parse().expect("static string")),
                concurrent_requests_max: 100,
                store_interval_seconds: 0,
                file_storage_path: Some(PathBuf::from("/var/lib/tally/metrics.json")),
                restore: false,
                database_dsn: None,
                secret_key: Some("church-key".to_string()),
                crypto_key_path: None,
                trusted_subnet: Some("10.0.0.0/8".to_string()),
                telemetry_address: None,
            }
        );
    }

    #[test]
    fn agent_config_applies_defaults() {
        let config: AgentConfig = serde_yaml::from_str("{}").expect("valid config");
        assert_eq!(config, AgentConfig::default());
        assert_eq!(config.server_address, "localhost:8080");
        assert_eq!(config.poll_interval_seconds, 2);
        assert_eq!(config.report_interval_seconds, 10);
        assert_eq!(config.batch_size, 0);
        assert_eq!(config.rate_limit, 1);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let result = serde_yaml::from_str::<AgentConfig>("pol_interval_seconds: 5");
        assert!(result.is_err());

        let result = serde_yaml::from_str::<ServerConfig>("adress: \"0.0.0.0:1\"");
        assert!(result.is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config: ServerConfig =
            load(&dir.path().join("absent.yaml")).expect("defaults apply");
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn file_contents_are_loaded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("server.yaml");
        fs::write(&path, "store_interval_seconds: 17\n").expect("write config");

        let config: ServerConfig = load(&path).expect("valid config");
        assert_eq!(config.store_interval_seconds, 17);
    }
}
