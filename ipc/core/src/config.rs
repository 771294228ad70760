//! Configuration
//!
//! Typed configuration for servers and clients, plus optional loading from a
//! TOML file with environment overrides.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! name = "telemetry"
//! max_msg_size = 65536
//! unmask_permissions = false
//! multi_client = true
//!
//! [client]
//! name = "telemetry"
//! timeout_ms = 5000
//! retry_interval_ms = 500
//!
//! [transport]
//! kind = "unix_socket"
//! dir = "/run/user/1000"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::IpcError;
use crate::transport::tcp::{DEFAULT_HOST, DEFAULT_PORT};
use crate::transport::TransportType;

/// Largest message accepted when nothing else is configured (3 MiB)
pub const DEFAULT_MAX_MSG_SIZE: usize = 3 * 1024 * 1024;

/// Configured ceilings below this fall back to [`DEFAULT_MAX_MSG_SIZE`]
pub const MIN_MAX_MSG_SIZE: usize = 1024;

/// Wait between dial attempts when none is configured
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub const ENCRYPT_BY_DEFAULT: bool = true;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Tracks where a configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Log Level
// =============================================================================

/// Verbosity for the crate's tracing output
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    #[default]
    Error,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

// =============================================================================
// Server / Client Configuration
// =============================================================================

/// Reject empty connection names
pub fn check_name(name: &str) -> Result<(), IpcError> {
    if name.is_empty() {
        return Err(IpcError::EmptyName);
    }
    Ok(())
}

/// Server configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Connection name shared with clients
    pub name: String,
    /// Largest payload accepted in either direction
    pub max_msg_size: usize,
    /// Make socket files accessible to every local user
    pub unmask_permissions: bool,
    pub log_level: LogLevel,
    /// Serve each client on its own connection, see [`crate::pool`]
    pub multi_client: bool,
    pub encryption: bool,
    pub transport: TransportType,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    #[must_use]
    pub fn with_unmask_permissions(mut self, unmask: bool) -> Self {
        self.unmask_permissions = unmask;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_multi_client(mut self, multi_client: bool) -> Self {
        self.multi_client = multi_client;
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    /// Message ceiling after applying the floor
    pub fn effective_max_msg_size(&self) -> usize {
        if self.max_msg_size < MIN_MAX_MSG_SIZE {
            DEFAULT_MAX_MSG_SIZE
        } else {
            self.max_msg_size
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            max_msg_size: DEFAULT_MAX_MSG_SIZE,
            unmask_permissions: false,
            log_level: LogLevel::default(),
            multi_client: false,
            encryption: ENCRYPT_BY_DEFAULT,
            transport: TransportType::default(),
        }
    }
}

/// Client configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Connection name of the server to reach
    pub name: String,
    /// Dial deadline; zero retries forever
    pub timeout: Duration,
    /// Wait between dial attempts; zero uses [`DEFAULT_RETRY_INTERVAL`]
    pub retry_interval: Duration,
    pub log_level: LogLevel,
    /// Ask the server's pool manager for a dedicated connection
    pub multi_client: bool,
    pub encryption: bool,
    pub transport: TransportType,
}

impl ClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub fn with_multi_client(mut self, multi_client: bool) -> Self {
        self.multi_client = multi_client;
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, encryption: bool) -> Self {
        self.encryption = encryption;
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    /// Dial deadline, `None` when unbounded
    pub fn dial_timeout(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    pub fn effective_retry_interval(&self) -> Duration {
        if self.retry_interval.is_zero() {
            DEFAULT_RETRY_INTERVAL
        } else {
            self.retry_interval
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            timeout: Duration::ZERO,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            log_level: LogLevel::default(),
            multi_client: false,
            encryption: ENCRYPT_BY_DEFAULT,
            transport: TransportType::default(),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    pub name: Option<String>,
    pub max_msg_size: Option<usize>,
    pub unmask_permissions: Option<bool>,
    pub log_level: Option<LogLevel>,
    pub multi_client: Option<bool>,
    pub encryption: Option<bool>,
}

/// Client section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientToml {
    pub name: Option<String>,
    /// Dial deadline in milliseconds (0 = retry forever)
    pub timeout_ms: Option<u64>,
    pub retry_interval_ms: Option<u64>,
    pub log_level: Option<LogLevel>,
    pub multi_client: Option<bool>,
    pub encryption: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcToml {
    pub server: ServerToml,
    pub client: ClientToml,
    /// Applies to both sections
    pub transport: Option<TransportType>,
}

/// Configuration for both ends, as loaded from file and environment
#[derive(Clone, Debug)]
pub struct IpcConfigFile {
    pub server: ServerConfig,
    pub client: ClientConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for IpcConfigFile {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl IpcConfigFile {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Load configuration from a specific path, then apply the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
/// A missing file is not an error (defaults are used).
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<IpcConfigFile, ConfigError> {
    let mut config = load_file(path)?;
    apply_env_config(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn load_file(path: Option<PathBuf>) -> Result<IpcConfigFile, ConfigError> {
    let mut config = IpcConfigFile::default();

    let Some(config_path) = path else {
        return Ok(config);
    };

    if !config_path.exists() {
        tracing::debug!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return Ok(config);
    }

    let toml_content =
        std::fs::read_to_string(&config_path).map_err(|e| ConfigError::ReadError {
            path: config_path.clone(),
            source: e,
        })?;

    let toml_config: IpcToml = toml::from_str(&toml_content)?;
    apply_toml_config(&mut config, toml_config)?;
    config.config_file_path = Some(config_path.clone());
    config.source = ConfigSource::File;

    tracing::info!(path = %config_path.display(), "Loaded configuration from file");
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut IpcConfigFile, toml: IpcToml) -> Result<(), ConfigError> {
    let server = &mut config.server;
    if let Some(name) = toml.server.name {
        server.name = name;
    }
    if let Some(size) = toml.server.max_msg_size {
        server.max_msg_size = size;
    }
    if let Some(unmask) = toml.server.unmask_permissions {
        server.unmask_permissions = unmask;
    }
    if let Some(level) = toml.server.log_level {
        server.log_level = level;
    }
    if let Some(multi) = toml.server.multi_client {
        server.multi_client = multi;
    }
    if let Some(encryption) = toml.server.encryption {
        server.encryption = encryption;
    }

    let client = &mut config.client;
    if let Some(name) = toml.client.name {
        client.name = name;
    }
    if let Some(ms) = toml.client.timeout_ms {
        client.timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.client.retry_interval_ms {
        client.retry_interval = Duration::from_millis(ms);
    }
    if let Some(level) = toml.client.log_level {
        client.log_level = level;
    }
    if let Some(multi) = toml.client.multi_client {
        client.multi_client = multi;
    }
    if let Some(encryption) = toml.client.encryption {
        client.encryption = encryption;
    }

    if let Some(transport) = toml.transport {
        if transport == TransportType::InProcess {
            return Err(ConfigError::ValidationError(
                "in_process transport cannot be selected from a config file".to_string(),
            ));
        }
        config.server.transport = transport.clone();
        config.client.transport = transport;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
///
/// `lookup` resolves a variable name; production code passes `std::env::var`.
fn apply_env_config<F>(config: &mut IpcConfigFile, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(level) = lookup("IPC_LOG_LEVEL").and_then(|v| LogLevel::parse(&v)) {
        config.server.log_level = level;
        config.client.log_level = level;
        config.source = ConfigSource::Env;
    }
    if let Some(debug) = lookup("IPC_DEBUG") {
        if debug == "1" || debug.eq_ignore_ascii_case("true") {
            config.server.log_level = LogLevel::Debug;
            config.client.log_level = LogLevel::Debug;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(size) = lookup("IPC_MAX_MSG_SIZE").and_then(|v| v.parse::<usize>().ok()) {
        config.server.max_msg_size = size;
        config.source = ConfigSource::Env;
    }
    if let Some(enabled) = lookup("IPC_ENCRYPTION") {
        let enabled = enabled != "0" && !enabled.eq_ignore_ascii_case("false");
        config.server.encryption = enabled;
        config.client.encryption = enabled;
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("IPC_TIMEOUT_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.client.timeout = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }
    if let Some(ms) = lookup("IPC_RETRY_INTERVAL_MS").and_then(|v| v.parse::<u64>().ok()) {
        config.client.retry_interval = Duration::from_millis(ms);
        config.source = ConfigSource::Env;
    }

    // Network host/port switch both sides to TCP
    let host = lookup("IPC_NETWORK_HOST");
    let port = lookup("IPC_NETWORK_PORT").and_then(|v| v.parse::<u16>().ok());
    if host.is_some() || port.is_some() {
        let (mut tcp_host, mut tcp_port, mut randomize) = match &config.server.transport {
            TransportType::Tcp {
                host,
                port,
                randomize_ports,
            } => (host.clone(), *port, *randomize_ports),
            _ => (DEFAULT_HOST.to_string(), DEFAULT_PORT, false),
        };
        if let Some(host) = host {
            tcp_host = host;
        }
        if let Some(port) = port {
            tcp_port = port;
        }
        if let Some(flag) = lookup("IPC_RANDOMIZE_PORTS") {
            randomize = flag == "1" || flag.eq_ignore_ascii_case("true");
        }
        let transport = TransportType::Tcp {
            host: tcp_host,
            port: tcp_port,
            randomize_ports: randomize,
        };
        config.server.transport = transport.clone();
        config.client.transport = transport;
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::new("svc");
        assert_eq!(config.name, "svc");
        assert_eq!(config.max_msg_size, 3_145_728);
        assert!(config.encryption);
        assert!(!config.multi_client);
        assert!(!config.unmask_permissions);
    }

    #[test]
    fn test_max_msg_size_floor() {
        assert_eq!(
            ServerConfig::new("svc").with_max_msg_size(1023).effective_max_msg_size(),
            DEFAULT_MAX_MSG_SIZE
        );
        assert_eq!(
            ServerConfig::new("svc").with_max_msg_size(0).effective_max_msg_size(),
            DEFAULT_MAX_MSG_SIZE
        );
        assert_eq!(
            ServerConfig::new("svc").with_max_msg_size(1024).effective_max_msg_size(),
            1024
        );
    }

    #[test]
    fn test_client_timeout_and_retry() {
        let config = ClientConfig::new("svc");
        assert_eq!(config.dial_timeout(), None);
        assert_eq!(config.effective_retry_interval(), Duration::from_secs(1));

        let config = config
            .with_timeout(Duration::from_secs(2))
            .with_retry_interval(Duration::ZERO);
        assert_eq!(config.dial_timeout(), Some(Duration::from_secs(2)));
        assert_eq!(config.effective_retry_interval(), DEFAULT_RETRY_INTERVAL);
    }

    #[test]
    fn test_check_name() {
        assert!(matches!(check_name(""), Err(IpcError::EmptyName)));
        assert!(check_name("svc").is_ok());
    }

    #[test]
    fn test_parse_valid_toml() {
        let file = write_config(
            r#"
[server]
name = "telemetry"
max_msg_size = 65536
multi_client = true
encryption = false

[client]
name = "telemetry"
timeout_ms = 5000
retry_interval_ms = 250
log_level = "debug"

[transport]
kind = "tcp"
host = "127.0.0.1"
port = 9100
"#,
        );

        let mut config = load_file(Some(file.path().to_path_buf())).unwrap();
        apply_env_config(&mut config, env(&[]));

        assert_eq!(config.server.name, "telemetry");
        assert_eq!(config.server.max_msg_size, 65536);
        assert!(config.server.multi_client);
        assert!(!config.server.encryption);
        assert_eq!(config.client.timeout, Duration::from_millis(5000));
        assert_eq!(config.client.retry_interval, Duration::from_millis(250));
        assert_eq!(config.client.log_level, LogLevel::Debug);
        assert_eq!(
            config.client.transport,
            TransportType::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9100,
                randomize_ports: false,
            }
        );
        assert_eq!(config.server.transport, config.client.transport);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_empty_toml() {
        let file = write_config("");
        let config = load_file(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(config.client, ClientConfig::default());
    }

    #[test]
    fn test_missing_file_graceful() {
        let config = load_file(Some(PathBuf::from("/nonexistent/ipc.toml"))).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[server\nname = ");
        let result = load_file(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_in_process_rejected_from_file() {
        let file = write_config("[transport]\nkind = \"in_process\"\n");
        let result = load_file(Some(file.path().to_path_buf()));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[server]\nmax_msg_size = 4096\n[client]\ntimeout_ms = 100\n");
        let mut config = load_file(Some(file.path().to_path_buf())).unwrap();

        apply_env_config(
            &mut config,
            env(&[
                ("IPC_MAX_MSG_SIZE", "8192"),
                ("IPC_TIMEOUT_MS", "900"),
                ("IPC_ENCRYPTION", "false"),
            ]),
        );

        assert_eq!(config.server.max_msg_size, 8192);
        assert_eq!(config.client.timeout, Duration::from_millis(900));
        assert!(!config.server.encryption);
        assert!(!config.client.encryption);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_debug_flag_sets_log_level() {
        let mut config = IpcConfigFile::default();
        apply_env_config(&mut config, env(&[("IPC_DEBUG", "true")]));
        assert_eq!(config.server.log_level, LogLevel::Debug);
        assert_eq!(config.client.log_level, LogLevel::Debug);
    }

    #[test]
    fn test_invalid_env_values_ignored() {
        let mut config = IpcConfigFile::default();
        apply_env_config(
            &mut config,
            env(&[("IPC_LOG_LEVEL", "loud"), ("IPC_TIMEOUT_MS", "soon")]),
        );
        assert_eq!(config.client.timeout, Duration::ZERO);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_network_env_switches_to_tcp() {
        let mut config = IpcConfigFile::default();
        apply_env_config(
            &mut config,
            env(&[("IPC_NETWORK_PORT", "9500"), ("IPC_RANDOMIZE_PORTS", "1")]),
        );
        assert_eq!(
            config.server.transport,
            TransportType::Tcp {
                host: "127.0.0.1".to_string(),
                port: 9500,
                randomize_ports: true,
            }
        );
        assert_eq!(config.client.transport, config.server.transport);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
