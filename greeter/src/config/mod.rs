use std::{path::Path, time::Duration};

use greeter_core::{config::RuntimeConfig, listener::ListenerBuilder};
use greeter_services::RpcServerTimeout;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const DEFAULT_SERVER_NAME: &str = "greeter";
pub const DEFAULT_SHUTDOWN_TIMEOUT_SEC: u64 = 30;
pub const DEFAULT_KEEPALIVE_TIMEOUT_SEC: u64 = 75;
pub const DEFAULT_MESSAGE_TIMEOUT_SEC: u64 = 10;

macro_rules! define_const {
    ($name: ident, $val: expr, $type: ty) => {
        const fn $name() -> $type {
            $val
        }
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_listener")]
    pub listener: ListenerConfig,
    // Bound on draining in-flight calls at shutdown.
    #[serde(default = "default_shutdown_timeout_sec")]
    pub shutdown_timeout_sec: Option<u64>,
    #[serde(default)]
    pub timeout: RpcTimeout,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            listener: default_listener(),
            shutdown_timeout_sec: default_shutdown_timeout_sec(),
            timeout: Default::default(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        self.shutdown_timeout_sec.map(Duration::from_secs)
    }
}

fn default_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

fn default_listener() -> ListenerConfig {
    ListenerConfig::Socket(std::net::SocketAddr::from(([0, 0, 0, 0], 50051)))
}

define_const!(
    default_shutdown_timeout_sec,
    Some(DEFAULT_SHUTDOWN_TIMEOUT_SEC),
    Option<u64>
);
define_const!(
    default_keepalive_timeout_sec,
    Some(DEFAULT_KEEPALIVE_TIMEOUT_SEC),
    Option<u64>
);
define_const!(
    default_message_timeout_sec,
    Some(DEFAULT_MESSAGE_TIMEOUT_SEC),
    Option<u64>
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcTimeout {
    // Connection keepalive timeout: If no byte comes when decoder want next request, close the
    // connection. Link Nginx `keepalive_timeout`
    #[serde(default = "default_keepalive_timeout_sec")]
    pub keepalive_timeout_sec: Option<u64>,
    // Read a full request frame.
    #[serde(default = "default_message_timeout_sec")]
    pub message_timeout_sec: Option<u64>,
}

impl Default for RpcTimeout {
    fn default() -> Self {
        Self {
            keepalive_timeout_sec: default_keepalive_timeout_sec(),
            message_timeout_sec: default_message_timeout_sec(),
        }
    }
}

impl From<RpcTimeout> for RpcServerTimeout {
    fn from(t: RpcTimeout) -> Self {
        RpcServerTimeout {
            keepalive_timeout: t.keepalive_timeout_sec.map(Duration::from_secs),
            message_timeout: t.message_timeout_sec.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ListenerConfig {
    Socket(std::net::SocketAddr),
    Unix(std::path::PathBuf),
}

impl TryFrom<ListenerConfig> for ListenerBuilder {
    type Error = std::io::Error;

    fn try_from(value: ListenerConfig) -> Result<Self, Self::Error> {
        match value {
            ListenerConfig::Socket(addr) => ListenerBuilder::bind_tcp(addr, Default::default()),
            #[cfg(unix)]
            ListenerConfig::Unix(addr) => ListenerBuilder::bind_unix(addr),
            #[cfg(not(unix))]
            ListenerConfig::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not supported on this platform",
            )),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read(path.as_ref())?;
        parse_from_slice(&content)
    }
}

pub fn parse_from_slice<T: DeserializeOwned>(content: &[u8]) -> anyhow::Result<T> {
    // read first non-space u8
    let is_json = match content
        .iter()
        .find(|&&b| b != b' ' && b != b'\r' && b != b'\n' && b != b'\t')
    {
        Some(first) => *first == b'{',
        None => false,
    };
    match is_json {
        true => serde_json::from_slice::<T>(content).map_err(Into::into),
        false => toml::from_str::<T>(&String::from_utf8_lossy(content)).map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use greeter_core::config::RuntimeType;

    use super::*;

    #[test]
    fn test_toml_deserialize() {
        const TEST_CONFIG: &str = "
            [runtime]
            dispatch_threads = 2
            runtime_type = 'legacy'

            [server]
            name = 'greeter-test'
            listener = { type = 'socket', value = '127.0.0.1:50052' }
            shutdown_timeout_sec = 5

            [server.timeout]
            keepalive_timeout_sec = 30
        ";

        let config: Config = parse_from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.runtime.dispatch_threads, 2);
        assert_eq!(config.runtime.runtime_type, RuntimeType::Legacy);
        assert_eq!(config.server.name, "greeter-test");
        assert_eq!(
            config.server.listener,
            ListenerConfig::Socket("127.0.0.1:50052".parse().unwrap())
        );
        assert_eq!(config.server.shutdown_timeout(), Some(Duration::from_secs(5)));
        let timeout: RpcServerTimeout = config.server.timeout.into();
        assert_eq!(timeout.keepalive_timeout, Some(Duration::from_secs(30)));
        assert_eq!(timeout.message_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_json_deserialize() {
        const TEST_CONFIG: &str = r#"
            {
                "server": {
                    "listener": {"type": "unix", "value": "/tmp/greeter.sock"}
                }
            }
        "#;

        let config: Config = parse_from_slice(TEST_CONFIG.as_bytes()).unwrap();
        assert_eq!(config.runtime, RuntimeConfig::default());
        assert_eq!(config.server.name, "greeter");
        assert_eq!(
            config.server.listener,
            ListenerConfig::Unix("/tmp/greeter.sock".into())
        );
        assert_eq!(config.server.timeout, RpcTimeout::default());
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = parse_from_slice(b"").unwrap();
        assert_eq!(config.server, ServerConfig::default());
        assert_eq!(
            config.server.listener,
            ListenerConfig::Socket("0.0.0.0:50051".parse().unwrap())
        );
        assert_eq!(
            config.server.shutdown_timeout(),
            Some(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SEC))
        );
    }

    #[test]
    fn unknown_listener_type_is_rejected() {
        const TEST_CONFIG: &str = "
            [server]
            listener = { type = 'pipe', value = 'x' }
        ";
        assert!(parse_from_slice::<Config>(TEST_CONFIG.as_bytes()).is_err());
    }
}
