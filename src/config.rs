use crate::error::ConfigError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the host binary
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Host HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Supervisor and router settings
    #[serde(default)]
    pub sidecar: SidecarConfig,

    /// The engine's own configuration, passed through opaquely
    #[serde(default = "default_engine_config")]
    pub engine: Value,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port of the host application (default: 4000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
        }
    }
}

/// Settings for the engine supervisor and the router in front of it
#[derive(Debug, Deserialize, Clone)]
pub struct SidecarConfig {
    /// Path the router intercepts and the engine frontend serves (default: /graphql)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Port of the host's own handler; falls back to the PORT environment variable
    pub backend_port: Option<u16>,

    /// Explicit origin URL for the engine (default: http://127.0.0.1:{backend_port}{endpoint})
    pub origin_url: Option<String>,

    /// Milliseconds to wait for the engine to report readiness; 0 or less waits forever
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: i64,

    /// Log the raw bytes of every forwarded request and response
    #[serde(default)]
    pub dump_traffic: bool,

    /// Explicit engine binary; skips platform lookup
    pub binary_path: Option<PathBuf>,

    /// Directory holding the per-platform engine binaries
    pub binary_dir: Option<PathBuf>,

    /// Per-OS binary names or paths, keyed by `std::env::consts::OS`
    #[serde(default)]
    pub binaries: HashMap<String, PathBuf>,

    /// Extra command-line arguments for the engine
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment variables to set on the engine process
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Let the engine restart itself as well (passes -restart=true)
    #[serde(default)]
    pub engine_restart: bool,

    /// Extra fields for the frontend injected into the engine config
    #[serde(default)]
    pub frontend: Map<String, Value>,

    /// Extra fields for the origin synthesized when the engine config has none
    #[serde(default)]
    pub origin: Map<String, Value>,

    /// Delay between re-sending the configuration and dropping the log filter
    #[serde(default = "default_config_reissue_delay_ms")]
    pub config_reissue_delay_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL on stop
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            backend_port: None,
            origin_url: None,
            startup_timeout_ms: default_startup_timeout_ms(),
            dump_traffic: false,
            binary_path: None,
            binary_dir: None,
            binaries: HashMap::new(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            engine_restart: false,
            frontend: Map::new(),
            origin: Map::new(),
            config_reissue_delay_ms: default_config_reissue_delay_ms(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl SidecarConfig {
    /// Create a config for a host handler on the given port
    pub fn for_backend(backend_port: u16) -> Self {
        Self {
            backend_port: Some(backend_port),
            ..Self::default()
        }
    }

    /// Use an explicit engine binary (builder pattern)
    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    /// Set the startup timeout (builder pattern)
    pub fn with_startup_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.startup_timeout_ms = timeout_ms;
        self
    }

    /// Set environment variables for the engine (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Startup timeout, or `None` when the supervisor waits indefinitely
    pub fn startup_timeout(&self) -> Option<Duration> {
        u64::try_from(self.startup_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn config_reissue_delay(&self) -> Duration {
        Duration::from_millis(self.config_reissue_delay_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Port of the host handler the engine forwards to
    pub fn resolve_backend_port(&self) -> Result<u16, ConfigError> {
        if let Some(port) = self.backend_port {
            return Ok(port);
        }
        std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .ok_or(ConfigError::MissingBackendPort)
    }

    /// URL the engine uses to reach the host handler
    pub fn backend_uri(&self) -> Result<String, ConfigError> {
        if let Some(ref url) = self.origin_url {
            return Ok(url.clone());
        }
        let port = self.resolve_backend_port()?;
        Ok(format!("http://127.0.0.1:{}{}", port, self.endpoint))
    }

    /// Validate the sidecar configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.starts_with('/') {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.clone()));
        }
        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    4000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_endpoint() -> String {
    "/graphql".to_string()
}

fn default_startup_timeout_ms() -> i64 {
    5000 // 5 seconds
}

fn default_config_reissue_delay_ms() -> u64 {
    1000 // give the engine a second to apply the reissued config
}

fn default_shutdown_grace_period() -> u64 {
    10 // 10 seconds between SIGTERM and SIGKILL
}

fn default_engine_config() -> Value {
    Value::Object(Map::new())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.sidecar.validate() {
            errors.push(e.to_string());
        }
        if !self.engine.is_object() {
            errors.push(ConfigError::NotAnObject.to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Point the engine's origin at this server when neither `origin_url`
    /// nor a backend port is configured. Returns whether the fallback applied.
    ///
    /// The standalone binary only answers 404 locally, so engine callbacks
    /// fail until an origin is configured.
    pub fn apply_origin_fallback(&mut self) -> bool {
        if self.sidecar.origin_url.is_some() || self.sidecar.resolve_backend_port().is_ok() {
            return false;
        }
        self.sidecar.backend_port = Some(self.server.port);
        true
    }
}
