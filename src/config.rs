//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.*, config/local.*, $COURIER_CONFIG)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// Tenant URI prefixes (e.g. "https://social.example")
    pub tenants: Vec<String>,
    pub store: StoreConfig,
    pub http: HttpConfig,
    pub delivery: DeliveryConfig,
    pub html: HtmlConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Largest request body accepted, in bytes
    pub max_body_bytes: usize,
}

/// Resource store driver selector
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreDriver {
    #[default]
    Memory,
    Sqlite,
}

/// Resource store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub driver: StoreDriver,
    /// Path to SQLite database file (sqlite driver only)
    pub path: Option<PathBuf>,
}

/// Outbound HTTP defaults
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Request timeout in seconds
    pub timeout_seconds: u64,
    /// Verify TLS certificates
    pub verify: bool,
    /// Follow redirects
    pub follow_redirects: bool,
    pub user_agent: String,
    /// Let signature key lookups reach loopback and private hosts
    #[serde(default)]
    pub allow_private_addresses: bool,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum concurrent inbox deliveries per activity
    pub max_concurrency: usize,
    /// Deliver to local inboxes even when the actor has no signing key
    pub local_without_credentials: bool,
    /// Dereference remote recipients missing from the store
    pub fetch_remote_recipients: bool,
    /// How long shutdown waits for in-flight deliveries
    pub shutdown_grace_seconds: u64,
}

/// HTML presentation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HtmlConfig {
    /// Shared static asset directory
    pub static_dir: PathBuf,
    /// Per-tenant override root (`<tenants_dir>/<hostname>/static`)
    pub tenants_dir: PathBuf,
}

/// Actors provisioned at startup
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub actors: Vec<ActorBootstrap>,
    /// RSA modulus size for generated keys
    #[serde(default = "default_key_bits")]
    pub key_bits: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            actors: Vec::new(),
            key_bits: default_key_bits(),
        }
    }
}

fn default_key_bits() -> usize {
    2048
}

/// A single actor to provision
#[derive(Debug, Clone, Deserialize)]
pub struct ActorBootstrap {
    pub uri: String,
    pub name: String,
    pub handle: String,
    pub summary: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Bearer token accepted for this actor; only its hash is stored
    #[serde(default)]
    pub token: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.* (if exists)
    /// 3. config/local.* (if exists)
    /// 4. File named by COURIER_CONFIG (if set)
    /// 5. Environment variables (COURIER__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let mut builder = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.max_body_bytes", 1024 * 1024)?
            .set_default("store.driver", "memory")?
            .set_default("http.timeout_seconds", 5)?
            .set_default("http.verify", true)?
            .set_default("http.follow_redirects", false)?
            .set_default("http.allow_private_addresses", false)?
            .set_default("http.user_agent", concat!("Courier/", env!("CARGO_PKG_VERSION")))?
            .set_default("delivery.max_concurrency", 8)?
            .set_default("delivery.local_without_credentials", false)?
            .set_default("delivery.fetch_remote_recipients", true)?
            .set_default("delivery.shutdown_grace_seconds", 10)?
            .set_default("html.static_dir", "static")?
            .set_default("html.tenants_dir", "tenants")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false));

        if let Ok(path) = std::env::var("COURIER_CONFIG") {
            builder = builder.add_source(File::with_name(&path).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix("COURIER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("tenants")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let mut app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.normalize();
        app_config.validate()?;
        Ok(app_config)
    }

    /// Whether `uri` lives under one of the configured tenant prefixes
    pub fn is_local(&self, uri: &str) -> bool {
        self.tenant_for_uri(uri).is_some()
    }

    /// Tenant prefix that owns `uri`
    pub fn tenant_for_uri(&self, uri: &str) -> Option<&str> {
        self.tenants
            .iter()
            .map(String::as_str)
            .find(|prefix| {
                uri.strip_prefix(prefix).is_some_and(|rest| {
                    rest.is_empty() || rest.starts_with(['/', '?', '#'])
                })
            })
    }

    /// Tenant prefix served under the given `Host` header value
    pub fn tenant_for_host(&self, host: &str) -> Option<&str> {
        let host = host.trim().to_ascii_lowercase();
        self.tenants.iter().map(String::as_str).find(|prefix| {
            url::Url::parse(prefix)
                .ok()
                .and_then(|url| {
                    let name = url.host_str()?.to_ascii_lowercase();
                    Some(match url.port() {
                        Some(port) => format!("{}:{}", name, port),
                        None => name,
                    })
                })
                .is_some_and(|authority| authority == host)
        })
    }

    pub(crate) fn normalize(&mut self) {
        for tenant in &mut self.tenants {
            let trimmed = tenant.trim().trim_end_matches('/').to_string();
            *tenant = trimmed;
        }
    }

    pub(crate) fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;

        if self.tenants.is_empty() {
            return Err(AppError::Config(
                "at least one tenant prefix must be configured".to_string(),
            ));
        }

        for tenant in &self.tenants {
            let parsed = url::Url::parse(tenant).map_err(|e| {
                AppError::Config(format!("tenant {} is not a valid URL: {}", tenant, e))
            })?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(AppError::Config(format!(
                    "tenant {} must be an absolute http(s) URL",
                    tenant
                )));
            }
        }

        for actor in &self.bootstrap.actors {
            if !self.is_local(&actor.uri) {
                return Err(AppError::Config(format!(
                    "bootstrap actor {} is not under a configured tenant",
                    actor.uri
                )));
            }
        }

        if self.delivery.max_concurrency == 0 {
            return Err(AppError::Config(
                "delivery.max_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.store.driver == StoreDriver::Sqlite && self.store.path.is_none() {
            return Err(AppError::Config(
                "store.path is required when store.driver=sqlite".to_string(),
            ));
        }

        if !self.http.verify {
            tracing::warn!("TLS certificate verification is disabled for outbound requests");
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn valid_config() -> AppConfig {
        AppConfig {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                max_body_bytes: 1024 * 1024,
            },
            tenants: vec!["https://social.example".to_string()],
            store: StoreConfig {
                driver: StoreDriver::Memory,
                path: None,
            },
            http: HttpConfig {
                timeout_seconds: 5,
                verify: true,
                follow_redirects: false,
                user_agent: "Courier/test".to_string(),
                allow_private_addresses: false,
            },
            delivery: DeliveryConfig {
                max_concurrency: 4,
                local_without_credentials: false,
                fetch_remote_recipients: false,
                shutdown_grace_seconds: 1,
            },
            html: HtmlConfig {
                static_dir: PathBuf::from("static"),
                tenants_dir: PathBuf::from("tenants"),
            },
            bootstrap: BootstrapConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }

    #[test]
    fn validate_accepts_default_test_config() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_tenants() {
        let mut config = valid_config();
        config.tenants.clear();

        let error = config.validate().expect_err("tenants are required");
        assert!(matches!(
            error,
            crate::error::AppError::Config(message) if message.contains("tenant")
        ));
    }

    #[test]
    fn validate_rejects_relative_tenant() {
        let mut config = valid_config();
        config.tenants = vec!["social.example".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_foreign_bootstrap_actor() {
        let mut config = valid_config();
        config.bootstrap.actors.push(ActorBootstrap {
            uri: "https://remote.example/actor/eve".to_string(),
            name: "Eve".to_string(),
            handle: "eve".to_string(),
            summary: None,
            roles: Vec::new(),
            token: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = valid_config();
        config.delivery.max_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_path_for_sqlite() {
        let mut config = valid_config();
        config.store.driver = StoreDriver::Sqlite;
        assert!(config.validate().is_err());
    }

    #[test]
    fn normalize_strips_trailing_slash() {
        let mut config = valid_config();
        config.tenants = vec!["https://social.example/ ".to_string()];
        config.normalize();
        assert_eq!(config.tenants, vec!["https://social.example".to_string()]);
    }

    #[test]
    fn is_local_uses_tenant_prefix() {
        let config = valid_config();
        assert!(config.is_local("https://social.example/actor/alice/inbox"));
        assert!(!config.is_local("https://remote.example/inbox"));
        assert!(!config.is_local("https://social.example.evil/inbox"));
    }

    #[test]
    fn tenant_for_host_matches_authority() {
        let mut config = valid_config();
        config.tenants.push("http://127.0.0.1:9000".to_string());

        assert_eq!(
            config.tenant_for_host("social.example"),
            Some("https://social.example")
        );
        assert_eq!(
            config.tenant_for_host("127.0.0.1:9000"),
            Some("http://127.0.0.1:9000")
        );
        assert_eq!(config.tenant_for_host("other.example"), None);
    }
}
