//! Configuration loading and representation.
//!
//! Sources, lowest precedence first:
//! 1. built-in defaults
//! 2. TOML file (`MEMBERGUARD_CONFIG`, default `/etc/memberguard/config.toml`)
//! 3. environment, `MEMBERGUARD_<SECTION>_<FIELD>`
//!
//! Each source yields a [`ConfigLayer`] of optional values; layers are merged
//! and then finalized into the immutable [`MemberguardConfig`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonwebtoken::Algorithm;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use memberguard_callback::SigningConfig;
use memberguard_observability::LogFormat;

use crate::jobs::RetryPolicy;

pub const CONFIG_PATH_ENV: &str = "MEMBERGUARD_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/memberguard/config.toml";
const ENV_PREFIX: &str = "MEMBERGUARD";

/// Identifier attributes searched, in order, for the user's login at their IdP.
pub const DEFAULT_IDENTIFIER_ATTRIBUTES: [&str; 5] = [
    "eduPersonUniqueId",
    "eduPersonPrincipalName",
    "eduPersonTargetedID",
    "nameid",
    "uid",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    TomlParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing configuration option '{0}'")]
    Missing(String),

    #[error("invalid value for '{key}': {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl core::fmt::Display) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MemberguardConfig {
    pub gate: GateConfig,
    pub signing: SigningConfig,
    pub perun: PerunConfig,
    pub http: HttpConfig,
    pub sync: SyncConfig,
    pub logging: LoggingConfig,
}

/// What the membership check enforces and where it sends users.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub vo_short_name: String,
    pub group_name: Option<String>,
    pub register_url: Url,
    /// Name under which the callback URL is signed into the registration request.
    pub callback_parameter_name: String,
    pub unauthorized_redirect_url: Url,
    pub registration_result_url: Url,
    /// Proxy endpoint the browser returns to after a registration round trip.
    pub resume_url: Url,
    pub state_ttl: Duration,
    /// Lifetime of a ticket for redeeming a resumed request.
    pub handoff_ttl: Duration,
    pub result_fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PerunConfig {
    pub rpc_url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Externally visible base URL, used to build the callback URL.
    pub public_base_url: Url,
    /// Bearer token the proxy presents on its server-side calls.
    pub proxy_token: Option<String>,
}

impl HttpConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub enabled: bool,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub identifier_attributes: Vec<String>,
}

impl SyncConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub filter: String,
}

// ---------------------------------------------------------------------------
// Layers
// ---------------------------------------------------------------------------

macro_rules! merge_fields {
    ($dst:ident, $src:ident; $($field:ident),+ $(,)?) => {
        $(
            if $src.$field.is_some() {
                $dst.$field = $src.$field;
            }
        )+
    };
}

/// Partial configuration from one source.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigLayer {
    pub gate: GateLayer,
    pub signing: SigningLayer,
    pub perun: PerunLayer,
    pub http: HttpLayer,
    pub sync: SyncLayer,
    pub logging: LoggingLayer,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GateLayer {
    pub vo_short_name: Option<String>,
    pub group_name: Option<String>,
    pub register_url: Option<String>,
    pub callback_parameter_name: Option<String>,
    pub unauthorized_redirect_url: Option<String>,
    pub registration_result_url: Option<String>,
    pub resume_url: Option<String>,
    pub state_ttl_secs: Option<u64>,
    pub handoff_ttl_secs: Option<u64>,
    pub result_fetch_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SigningLayer {
    pub keystore: Option<PathBuf>,
    pub key_id: Option<String>,
    pub token_alg: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PerunLayer {
    pub rpc_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpLayer {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub public_base_url: Option<String>,
    pub proxy_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncLayer {
    pub enabled: Option<bool>,
    pub workers: Option<usize>,
    pub queue_capacity: Option<usize>,
    pub max_attempts: Option<u32>,
    pub identifier_attributes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingLayer {
    pub format: Option<LogFormat>,
    pub filter: Option<String>,
}

impl ConfigLayer {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::TomlParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load a TOML file; a missing file is an empty layer.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(Self::default());
        }
        debug!(path = %path.display(), "loading config file");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Build a layer from `MEMBERGUARD_<SECTION>_<FIELD>` variables via `lookup`.
    pub fn from_env<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };
        Ok(Self {
            gate: GateLayer {
                vo_short_name: env.string("gate", "vo_short_name"),
                group_name: env.string("gate", "group_name"),
                register_url: env.string("gate", "register_url"),
                callback_parameter_name: env.string("gate", "callback_parameter_name"),
                unauthorized_redirect_url: env.string("gate", "unauthorized_redirect_url"),
                registration_result_url: env.string("gate", "registration_result_url"),
                resume_url: env.string("gate", "resume_url"),
                state_ttl_secs: env.parse("gate", "state_ttl_secs")?,
                handoff_ttl_secs: env.parse("gate", "handoff_ttl_secs")?,
                result_fetch_timeout_secs: env.parse("gate", "result_fetch_timeout_secs")?,
            },
            signing: SigningLayer {
                keystore: env.string("signing", "keystore").map(PathBuf::from),
                key_id: env.string("signing", "key_id"),
                token_alg: env.string("signing", "token_alg"),
            },
            perun: PerunLayer {
                rpc_url: env.string("perun", "rpc_url"),
                username: env.string("perun", "username"),
                password: env.string("perun", "password"),
                timeout_secs: env.parse("perun", "timeout_secs")?,
            },
            http: HttpLayer {
                host: env.string("http", "host"),
                port: env.parse("http", "port")?,
                public_base_url: env.string("http", "public_base_url"),
                proxy_token: env.string("http", "proxy_token"),
            },
            sync: SyncLayer {
                enabled: env.parse("sync", "enabled")?,
                workers: env.parse("sync", "workers")?,
                queue_capacity: env.parse("sync", "queue_capacity")?,
                max_attempts: env.parse("sync", "max_attempts")?,
                identifier_attributes: env.string("sync", "identifier_attributes").map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }),
            },
            logging: LoggingLayer {
                format: env.parse("logging", "format")?,
                filter: env.string("logging", "filter"),
            },
        })
    }

    /// Overlay `other` on top of `self`; values set in `other` win.
    pub fn merge(&mut self, other: ConfigLayer) {
        let (dst, src) = (&mut self.gate, other.gate);
        merge_fields!(dst, src;
            vo_short_name, group_name, register_url, callback_parameter_name,
            unauthorized_redirect_url, registration_result_url, resume_url, state_ttl_secs,
            handoff_ttl_secs, result_fetch_timeout_secs,
        );
        let (dst, src) = (&mut self.signing, other.signing);
        merge_fields!(dst, src; keystore, key_id, token_alg);
        let (dst, src) = (&mut self.perun, other.perun);
        merge_fields!(dst, src; rpc_url, username, password, timeout_secs);
        let (dst, src) = (&mut self.http, other.http);
        merge_fields!(dst, src; host, port, public_base_url, proxy_token);
        let (dst, src) = (&mut self.sync, other.sync);
        merge_fields!(dst, src; enabled, workers, queue_capacity, max_attempts, identifier_attributes);
        let (dst, src) = (&mut self.logging, other.logging);
        merge_fields!(dst, src; format, filter);
    }

    /// Apply defaults and validate.
    pub fn finalize(self) -> Result<MemberguardConfig, ConfigError> {
        let gate = self.gate;
        let gate = GateConfig {
            vo_short_name: required(gate.vo_short_name, "gate.vo_short_name")?,
            group_name: gate.group_name.filter(|g| !g.trim().is_empty()),
            register_url: required_url(gate.register_url, "gate.register_url")?,
            callback_parameter_name: required(gate.callback_parameter_name, "gate.callback_parameter_name")?,
            unauthorized_redirect_url: required_url(
                gate.unauthorized_redirect_url,
                "gate.unauthorized_redirect_url",
            )?,
            registration_result_url: required_url(
                gate.registration_result_url,
                "gate.registration_result_url",
            )?,
            resume_url: required_url(gate.resume_url, "gate.resume_url")?,
            state_ttl: positive_secs(gate.state_ttl_secs, 1800, "gate.state_ttl_secs")?,
            handoff_ttl: positive_secs(gate.handoff_ttl_secs, 120, "gate.handoff_ttl_secs")?,
            result_fetch_timeout: Duration::from_secs(gate.result_fetch_timeout_secs.unwrap_or(10)),
        };

        let signing = SigningConfig {
            keystore: self
                .signing
                .keystore
                .ok_or_else(|| ConfigError::Missing("signing.keystore".to_string()))?,
            key_id: required(self.signing.key_id, "signing.key_id")?,
            token_alg: required(self.signing.token_alg, "signing.token_alg")?
                .parse::<Algorithm>()
                .map_err(|e| ConfigError::invalid("signing.token_alg", e))?,
        };

        let perun = PerunConfig {
            rpc_url: required_url(self.perun.rpc_url, "perun.rpc_url")?,
            username: self.perun.username,
            password: self.perun.password,
            timeout: Duration::from_secs(self.perun.timeout_secs.unwrap_or(10)),
        };

        let http = HttpConfig {
            host: self.http.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.http.port.unwrap_or(8080),
            public_base_url: parse_url(
                &self
                    .http
                    .public_base_url
                    .unwrap_or_else(|| "http://localhost:8080".to_string()),
                "http.public_base_url",
            )?,
            proxy_token: self.http.proxy_token.filter(|t| !t.trim().is_empty()),
        };

        let sync = SyncConfig {
            enabled: self.sync.enabled.unwrap_or(true),
            workers: self.sync.workers.unwrap_or(2),
            queue_capacity: self.sync.queue_capacity.unwrap_or(256),
            max_attempts: self.sync.max_attempts.unwrap_or(5),
            identifier_attributes: self
                .sync
                .identifier_attributes
                .unwrap_or_else(|| DEFAULT_IDENTIFIER_ATTRIBUTES.iter().map(|s| s.to_string()).collect()),
        };
        if sync.enabled && (sync.workers == 0 || sync.queue_capacity == 0) {
            return Err(ConfigError::invalid(
                "sync.workers",
                "workers and queue_capacity must be positive when sync is enabled",
            ));
        }

        let logging = LoggingConfig {
            format: self.logging.format.unwrap_or_default(),
            filter: self.logging.filter.unwrap_or_else(|| "info".to_string()),
        };

        Ok(MemberguardConfig {
            gate,
            signing,
            perun,
            http,
            sync,
            logging,
        })
    }
}

/// Load configuration from the file named by `MEMBERGUARD_CONFIG` and the process environment.
pub fn load() -> Result<MemberguardConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from(&path, |name| std::env::var(name).ok())
}

pub fn load_from<F>(path: &Path, env: F) -> Result<MemberguardConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layer = ConfigLayer::from_toml_file(path)?;
    layer.merge(ConfigLayer::from_env(env)?);
    layer.finalize()
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn key(section: &str, field: &str) -> String {
        format!("{ENV_PREFIX}_{}_{}", section.to_uppercase(), field.to_uppercase())
    }

    fn string(&self, section: &str, field: &str) -> Option<String> {
        (self.lookup)(&Self::key(section, field)).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, section: &str, field: &str) -> Result<Option<T>, ConfigError>
    where
        T: core::str::FromStr,
        T::Err: core::fmt::Display,
    {
        match self.string(section, field) {
            Some(v) => v
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::invalid(&Self::key(section, field), format!("'{v}': {e}"))),
            None => Ok(None),
        }
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn required_url(value: Option<String>, key: &str) -> Result<Url, ConfigError> {
    parse_url(&required(value, key)?, key)
}

fn positive_secs(value: Option<u64>, default: u64, key: &str) -> Result<Duration, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::invalid(key, "must be at least one second")),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_url(value: &str, key: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::invalid(key, format!("'{value}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const FULL: &str = r#"
        [gate]
        vo_short_name = "einfra"
        group_name = "members"
        register_url = "https://registrar.example.org/registrar/"
        callback_parameter_name = "targetnew"
        unauthorized_redirect_url = "https://proxy.example.org/unauthorized"
        registration_result_url = "https://registrar.example.org/registrar/result"
        resume_url = "https://proxy.example.org/perunensuremember/resume"

        [signing]
        keystore = "/etc/memberguard/keystore.json"
        key_id = "ed1"
        token_alg = "EdDSA"

        [perun]
        rpc_url = "https://perun.example.org/ba/rpc"
        username = "proxy"
        password = "secret"

        [logging]
        format = "pretty"
    "#;

    fn layer(toml: &str) -> ConfigLayer {
        ConfigLayer::from_toml_str(toml, Path::new("test.toml")).unwrap()
    }

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn full_file_finalizes_with_defaults() {
        let config = layer(FULL).finalize().unwrap();

        assert_eq!(config.gate.vo_short_name, "einfra");
        assert_eq!(config.gate.group_name.as_deref(), Some("members"));
        assert_eq!(config.gate.state_ttl, Duration::from_secs(1800));
        assert_eq!(config.gate.handoff_ttl, Duration::from_secs(120));
        assert_eq!(config.gate.result_fetch_timeout, Duration::from_secs(10));
        assert_eq!(config.signing.token_alg, Algorithm::EdDSA);
        assert_eq!(config.http.bind_addr(), "0.0.0.0:8080");
        assert_eq!(config.http.public_base_url.as_str(), "http://localhost:8080/");
        assert!(config.http.proxy_token.is_none());
        assert!(config.sync.enabled);
        assert_eq!(config.sync.workers, 2);
        assert_eq!(config.sync.queue_capacity, 256);
        assert_eq!(config.sync.identifier_attributes.len(), 5);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn missing_required_option_is_named() {
        let toml = FULL.replace("register_url = \"https://registrar.example.org/registrar/\"", "");
        let err = layer(&toml).finalize().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "gate.register_url"));

        let err = ConfigLayer::default().finalize().unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "gate.vo_short_name"));
    }

    #[test]
    fn blank_group_name_means_no_group() {
        let toml = FULL.replace("group_name = \"members\"", "group_name = \"  \"");
        let config = layer(&toml).finalize().unwrap();
        assert!(config.gate.group_name.is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let mut merged = layer(FULL);
        merged.merge(
            ConfigLayer::from_env(env(&[
                ("MEMBERGUARD_GATE_VO_SHORT_NAME", "cesnet"),
                ("MEMBERGUARD_GATE_STATE_TTL_SECS", "60"),
                ("MEMBERGUARD_HTTP_PORT", "9090"),
                ("MEMBERGUARD_HTTP_PROXY_TOKEN", "s3cret"),
                ("MEMBERGUARD_SYNC_IDENTIFIER_ATTRIBUTES", "uid, nameid"),
            ]))
            .unwrap(),
        );
        let config = merged.finalize().unwrap();

        assert_eq!(config.gate.vo_short_name, "cesnet");
        assert_eq!(config.gate.group_name.as_deref(), Some("members"));
        assert_eq!(config.gate.state_ttl, Duration::from_secs(60));
        assert_eq!(config.http.port, 9090);
        assert_eq!(config.http.proxy_token.as_deref(), Some("s3cret"));
        assert_eq!(config.sync.identifier_attributes, vec!["uid", "nameid"]);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = ConfigLayer::from_env(env(&[("MEMBERGUARD_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "MEMBERGUARD_HTTP_PORT"));

        let toml = FULL.replace("token_alg = \"EdDSA\"", "token_alg = \"XS999\"");
        let err = layer(&toml).finalize().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "signing.token_alg"));

        let toml = FULL.replace("https://proxy.example.org/unauthorized", "not a url");
        assert!(matches!(layer(&toml).finalize(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn zero_lifetimes_are_rejected() {
        let mut zero_ttl = layer(FULL);
        zero_ttl.gate.state_ttl_secs = Some(0);
        let err = zero_ttl.finalize().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "gate.state_ttl_secs"));

        let mut zero_handoff = layer(FULL);
        zero_handoff.gate.handoff_ttl_secs = Some(0);
        let err = zero_handoff.finalize().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "gate.handoff_ttl_secs"));
    }

    #[test]
    fn load_from_reads_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, FULL).unwrap();

        let config = load_from(&path, env(&[("MEMBERGUARD_LOGGING_FILTER", "debug")])).unwrap();
        assert_eq!(config.logging.filter, "debug");

        let missing = load_from(&dir.path().join("absent.toml"), env(&[]));
        assert!(matches!(missing, Err(ConfigError::Missing(_))));
    }
}
