//! # Client Configuration
//!
//! Plain serde values describing servers, pool sizing, routing strategy,
//! failure policy and credentials. Durations are written in milliseconds.
//!
//! ```json
//! {
//!   "servers": ["10.0.0.1:11211", "10.0.0.2:11211"],
//!   "socket_pool": { "min_pool_size": 2, "max_pool_size": 8, "dead_timeout": 2000 },
//!   "locator": { "type": "consistent", "algorithm": "ketama" },
//!   "failure_policy": { "type": "throttling", "threshold": 3, "window": 500 }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use memring_common::MAX_KEY_LENGTH;
use serde::{Deserialize, Serialize};

use crate::auth::{PlainAuthenticator, SaslAuthenticator};
use crate::error::ConfigError;
use crate::failure::{FailurePolicyFactory, ImmediateFailureFactory, ThrottlingFailureFactory};
use crate::vbucket::VBucketMap;

/// Default number of ring points per node.
pub const DEFAULT_MUTATIONS: usize = 160;

/// Server-side item size limit out of the box (1 MiB).
pub const DEFAULT_MAX_ITEM_SIZE: usize = 1024 * 1024;

/// Per-node socket pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketPoolConfig {
    /// Connections opened when a pool is created or resurrected.
    pub min_pool_size: usize,
    /// Upper bound on open connections per node.
    pub max_pool_size: usize,
    /// Bounds connect, send and the wait for a free connection.
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Bounds every socket read.
    #[serde(with = "duration_ms")]
    pub receive_timeout: Duration,
    /// How long a dead node stays out before it is pinged.
    #[serde(with = "duration_ms")]
    pub dead_timeout: Duration,
    /// Largest value the servers accept. Bounds how much a response may
    /// announce before it is treated as corrupt.
    pub max_item_size: usize,
}

impl Default for SocketPoolConfig {
    fn default() -> Self {
        SocketPoolConfig {
            min_pool_size: 10,
            max_pool_size: 20,
            connection_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(10),
            dead_timeout: Duration::from_secs(10),
            max_item_size: DEFAULT_MAX_ITEM_SIZE,
        }
    }
}

impl SocketPoolConfig {
    /// Largest response body accepted: one item plus room for extras and key.
    pub fn max_response_body(&self) -> usize {
        self.max_item_size
            .saturating_add(MAX_KEY_LENGTH)
            .saturating_add(u8::MAX as usize)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::ZeroPoolSize);
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(ConfigError::PoolBounds {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }
        Ok(())
    }
}

/// Hash family used for ring points and key lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    /// 32-bit FNV-1a, one ring point per mutation.
    #[default]
    Fnv1a,
    /// MD5, four ring points per digest.
    Ketama,
}

/// Key routing strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocatorKind {
    Consistent {
        #[serde(default)]
        algorithm: HashAlgorithm,
        #[serde(default = "default_mutations")]
        mutations: usize,
    },
    Single,
    #[serde(rename = "vbucket")]
    VBucket { map: VBucketMap },
}

impl Default for LocatorKind {
    fn default() -> Self {
        LocatorKind::Consistent {
            algorithm: HashAlgorithm::Fnv1a,
            mutations: DEFAULT_MUTATIONS,
        }
    }
}

fn default_mutations() -> usize {
    DEFAULT_MUTATIONS
}

/// How many transport failures take a node out of service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailurePolicyConfig {
    /// First failure marks the node dead.
    #[default]
    Immediate,
    /// `threshold` failures, each within `window` of the previous one.
    Throttling {
        threshold: usize,
        #[serde(with = "duration_ms")]
        window: Duration,
    },
}

impl FailurePolicyConfig {
    pub fn factory(&self) -> Arc<dyn FailurePolicyFactory> {
        match self {
            FailurePolicyConfig::Immediate => Arc::new(ImmediateFailureFactory),
            FailurePolicyConfig::Throttling { threshold, window } => {
                Arc::new(ThrottlingFailureFactory::new(*threshold, *window))
            }
        }
    }
}

/// SASL PLAIN credentials.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub zone: String,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("zone", &self.zone)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Top-level client settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Endpoints as `host:port`.
    pub servers: Vec<String>,
    pub socket_pool: SocketPoolConfig,
    pub locator: LocatorKind,
    pub failure_policy: FailurePolicyConfig,
    pub authentication: Option<AuthConfig>,
}

impl ClientConfig {
    /// Config with default settings for `servers`.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }

    pub fn with_socket_pool(mut self, socket_pool: SocketPoolConfig) -> Self {
        self.socket_pool = socket_pool;
        self
    }

    pub fn with_locator(mut self, locator: LocatorKind) -> Self {
        self.locator = locator;
        self
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicyConfig) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_authentication(mut self, authentication: AuthConfig) -> Self {
        self.authentication = Some(authentication);
        self
    }

    /// Checks every setting. Nothing is connected until this passes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        for server in &self.servers {
            parse_endpoint(server)?;
        }
        self.socket_pool.validate()?;
        match &self.locator {
            LocatorKind::Consistent { mutations, .. } if *mutations == 0 => {
                Err(ConfigError::ZeroMutations)
            }
            LocatorKind::VBucket { map } => map.validate(&self.servers),
            _ => Ok(()),
        }
    }

    /// Authenticator for new connections, if credentials are configured.
    pub fn authenticator(&self) -> Option<Arc<dyn SaslAuthenticator>> {
        self.authentication.as_ref().map(|auth| {
            Arc::new(PlainAuthenticator::new(&auth.zone, &auth.username, &auth.password))
                as Arc<dyn SaslAuthenticator>
        })
    }
}

/// Splits `host:port`. The host may be a bracketed IPv6 literal.
pub fn parse_endpoint(endpoint: &str) -> Result<(&str, u16), ConfigError> {
    let invalid = || ConfigError::InvalidEndpoint(endpoint.to_string());
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let pool = SocketPoolConfig::default();
        assert_eq!(pool.min_pool_size, 10);
        assert_eq!(pool.max_pool_size, 20);
        assert_eq!(pool.connection_timeout, Duration::from_secs(10));
        assert_eq!(pool.receive_timeout, Duration::from_secs(10));
        assert_eq!(pool.dead_timeout, Duration::from_secs(10));
        assert_eq!(
            ClientConfig::default().locator,
            LocatorKind::Consistent {
                algorithm: HashAlgorithm::Fnv1a,
                mutations: 160
            }
        );
    }

    #[test]
    fn validation_rejects_bad_settings() {
        assert_eq!(
            ClientConfig::default().validate(),
            Err(ConfigError::NoServers)
        );
        assert!(matches!(
            ClientConfig::new(["localhost"]).validate(),
            Err(ConfigError::InvalidEndpoint(_))
        ));

        let mut pool = SocketPoolConfig::default();
        pool.min_pool_size = 30;
        assert_eq!(
            ClientConfig::new(["a:1"]).with_socket_pool(pool).validate(),
            Err(ConfigError::PoolBounds { min: 30, max: 20 })
        );

        let pool = SocketPoolConfig {
            min_pool_size: 0,
            max_pool_size: 0,
            ..SocketPoolConfig::default()
        };
        assert_eq!(
            ClientConfig::new(["a:1"]).with_socket_pool(pool).validate(),
            Err(ConfigError::ZeroPoolSize)
        );

        let zero = LocatorKind::Consistent {
            algorithm: HashAlgorithm::Ketama,
            mutations: 0,
        };
        assert_eq!(
            ClientConfig::new(["a:1"]).with_locator(zero).validate(),
            Err(ConfigError::ZeroMutations)
        );
    }

    #[test]
    fn parses_json_with_millisecond_durations() {
        let raw = r#"{
            "servers": ["127.0.0.1:11211", "[::1]:11212"],
            "socket_pool": { "min_pool_size": 1, "max_pool_size": 4, "dead_timeout": 250 },
            "locator": { "type": "consistent", "algorithm": "ketama" },
            "failure_policy": { "type": "throttling", "threshold": 3, "window": 100 },
            "authentication": { "username": "app", "password": "secret" }
        }"#;
        let config: ClientConfig = serde_json::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.socket_pool.dead_timeout, Duration::from_millis(250));
        assert_eq!(config.socket_pool.receive_timeout, Duration::from_secs(10));
        assert_eq!(
            config.locator,
            LocatorKind::Consistent {
                algorithm: HashAlgorithm::Ketama,
                mutations: DEFAULT_MUTATIONS
            }
        );
        assert_eq!(
            config.failure_policy,
            FailurePolicyConfig::Throttling {
                threshold: 3,
                window: Duration::from_millis(100)
            }
        );
        assert!(config.authenticator().is_some());
        assert!(!format!("{:?}", config).contains("secret"));
    }

    #[test]
    fn endpoint_parsing() {
        assert_eq!(parse_endpoint("cache-1:11211").unwrap(), ("cache-1", 11211));
        assert_eq!(parse_endpoint("[::1]:7000").unwrap(), ("[::1]", 7000));
        assert!(parse_endpoint(":11211").is_err());
        assert!(parse_endpoint("host:port").is_err());
        assert!(parse_endpoint("host:70000").is_err());
    }
}
