//! Relay configuration: a TOML file plus environment overrides.
//!
//! Lookup order for every key is environment variable, then config file,
//! then built-in default. The signing secret has no default and must be
//! supplied one way or the other.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const ENV_SIGNING_SECRET: &str = "ECHORELAY_SIGNING_SECRET";
pub const ENV_HOST: &str = "ECHORELAY_HOST";
pub const ENV_PORT: &str = "ECHORELAY_PORT";
pub const ENV_CREDENTIAL_BACKEND: &str = "ECHORELAY_CREDENTIAL_BACKEND";
pub const ENV_CREDENTIAL_PATH: &str = "ECHORELAY_CREDENTIAL_PATH";

/// Supported credential backends.
pub const CREDENTIAL_BACKENDS: &[&str] = &["memory", "sqlite"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub auth: AuthConfig,
    pub credentials: CredentialsConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Maximum HTTP request body size in bytes.
    pub max_body_bytes: usize,
    /// Per-request timeout for plain HTTP handlers. Upgraded sessions are not
    /// subject to it.
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            max_body_bytes: 65_536,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HMAC key for bearer tokens. Never logged.
    pub signing_secret: Option<String>,
    pub token_ttl_secs: u64,
    pub password_iterations: u32,
    pub min_secret_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: None,
            token_ttl_secs: crate::auth::token::DEFAULT_TOKEN_TTL_SECS,
            password_iterations: crate::auth::password::DEFAULT_ITERATIONS,
            min_secret_len: 32,
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field(
                "signing_secret",
                &self.signing_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("password_iterations", &self.password_iterations)
            .field("min_secret_len", &self.min_secret_len)
            .finish()
    }
}

impl AuthConfig {
    /// The configured signing secret, or an error naming how to supply one.
    pub fn signing_secret(&self) -> Result<&str> {
        match self.signing_secret.as_deref().map(str::trim) {
            Some(secret) if !secret.is_empty() => Ok(secret),
            _ => bail!(
                "No token signing secret configured. Set {ENV_SIGNING_SECRET} or \
                 [auth] signing_secret in the config file."
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    /// `memory` or `sqlite`.
    pub backend: String,
    /// SQLite database path; `~` is expanded.
    pub path: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            path: "~/.echorelay/credentials.db".into(),
        }
    }
}

impl CredentialsConfig {
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).into_owned())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close a session after this long without an inbound frame. 0 disables.
    pub idle_timeout_secs: u64,
    pub max_message_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 300,
            max_message_bytes: 65_536,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "echorelay=info,tower_http=warn".into(),
        }
    }
}

/// `<platform config dir>/echorelay/config.toml`, if a home directory is known.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "echorelay")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Config {
    /// Load from `path` (or the default location), apply environment
    /// overrides, and validate.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file just means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Overlay environment variables. `lookup` is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(secret) = get(ENV_SIGNING_SECRET) {
            self.auth.signing_secret = Some(secret);
        }
        if let Some(host) = get(ENV_HOST) {
            self.gateway.host = host;
        }
        if let Some(port) = get(ENV_PORT) {
            self.gateway.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a valid port: {port}"))?;
        }
        if let Some(backend) = get(ENV_CREDENTIAL_BACKEND) {
            self.credentials.backend = backend;
        }
        if let Some(path) = get(ENV_CREDENTIAL_PATH) {
            self.credentials.path = path;
        }
        Ok(())
    }

    /// Startup checks. Any failure here is fatal for the process.
    pub fn validate(&self) -> Result<()> {
        let secret = self.auth.signing_secret()?;
        if secret.len() < self.auth.min_secret_len {
            bail!(
                "Token signing secret is too short ({} chars); at least {} required",
                secret.len(),
                self.auth.min_secret_len
            );
        }
        if self.auth.token_ttl_secs == 0 {
            bail!("[auth] token_ttl_secs must be greater than zero");
        }
        if self.auth.password_iterations == 0 {
            bail!("[auth] password_iterations must be greater than zero");
        }
        let backend = self.credentials.backend.as_str();
        if !CREDENTIAL_BACKENDS.contains(&backend) {
            bail!(
                "Unknown credential backend '{backend}'. Supported values: {}",
                CREDENTIAL_BACKENDS.join(", ")
            );
        }
        if self.session.max_message_bytes == 0 {
            bail!("[session] max_message_bytes must be greater than zero");
        }
        Ok(())
    }
}
