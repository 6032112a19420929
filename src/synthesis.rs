//! Derive the configuration handed to the engine process
//!
//! The user's engine configuration is extended with a loopback frontend the
//! router forwards to, origins carrying the loop-prevention secret, and a
//! logging block the supervisor can parse. Nothing here performs I/O.

use crate::error::ConfigError;
use serde_json::{Map, Value};

/// Host the injected frontend listens on
pub const FRONTEND_HOST: &str = "127.0.0.1";

/// Log format the supervisor decodes
pub const LOG_FORMAT: &str = "JSON";

/// Log destination the supervisor reads
pub const LOG_DESTINATION: &str = "STDOUT";

/// Inputs to [`synthesize`] besides the user's configuration
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    /// Path the router intercepts; becomes the frontend endpoint
    pub mount_path: &'a str,
    /// URL of the host application's own handler, used for a synthesized origin
    pub backend_uri: &'a str,
    /// Secret the engine attaches when calling back into the host
    pub loop_secret: &'a str,
    /// Extra fields for the injected frontend
    pub frontend_params: &'a Map<String, Value>,
    /// Extra fields for a synthesized origin
    pub origin_params: &'a Map<String, Value>,
}

/// Configuration ready to be serialized to the engine's stdin
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    /// The full JSON document
    pub document: Value,
    /// Non-fatal findings about user settings that were overridden
    pub warnings: Vec<String>,
}

impl EffectiveConfig {
    /// Serialize as a single line, the framing the engine expects on stdin
    pub fn to_line(document: &Value) -> String {
        let mut line = document.to_string();
        line.push('\n');
        line
    }
}

/// Build the engine's effective configuration from the user's.
pub fn synthesize(user: &Value, input: &SynthesisInput<'_>) -> Result<EffectiveConfig, ConfigError> {
    let mut root = match user {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(ConfigError::NotAnObject),
    };
    let mut warnings = Vec::new();

    force_logging(&mut root, &mut warnings)?;
    append_frontend(&mut root, input)?;
    attach_origins(&mut root, input)?;

    Ok(EffectiveConfig {
        document: Value::Object(root),
        warnings,
    })
}

fn force_logging(root: &mut Map<String, Value>, warnings: &mut Vec<String>) -> Result<(), ConfigError> {
    let logging = root
        .entry("logging")
        .or_insert_with(|| Value::Object(Map::new()));
    if logging.is_null() {
        *logging = Value::Object(Map::new());
    }
    let logging = logging
        .as_object_mut()
        .ok_or(ConfigError::InvalidSection("logging"))?;

    for (key, forced) in [("format", LOG_FORMAT), ("destination", LOG_DESTINATION)] {
        if let Some(existing) = logging.get(key) {
            let matches = existing
                .as_str()
                .map(|s| s.eq_ignore_ascii_case(forced))
                .unwrap_or(false);
            if !matches {
                warnings.push(format!(
                    "logging.{} = {} is not supported and was replaced with \"{}\"",
                    key, existing, forced
                ));
            }
        }
        logging.insert(key.to_string(), Value::String(forced.to_string()));
    }

    Ok(())
}

fn append_frontend(root: &mut Map<String, Value>, input: &SynthesisInput<'_>) -> Result<(), ConfigError> {
    let mut frontend = input.frontend_params.clone();
    frontend.insert("host".to_string(), Value::String(FRONTEND_HOST.to_string()));
    frontend.insert(
        "endpoint".to_string(),
        Value::String(input.mount_path.to_string()),
    );
    frontend.insert("port".to_string(), Value::from(0));

    entries_mut(root, "frontends")?.push(Value::Object(frontend));
    Ok(())
}

fn attach_origins(root: &mut Map<String, Value>, input: &SynthesisInput<'_>) -> Result<(), ConfigError> {
    let origins = entries_mut(root, "origins")?;

    if origins.is_empty() {
        let mut origin = input.origin_params.clone();
        let mut http = match origin.remove("http") {
            Some(Value::Object(http)) => http,
            Some(Value::Null) | None => Map::new(),
            Some(_) => return Err(ConfigError::InvalidSection("origin.http")),
        };
        http.insert("url".to_string(), Value::String(input.backend_uri.to_string()));
        http.insert(
            "headerSecret".to_string(),
            Value::String(input.loop_secret.to_string()),
        );
        origin.insert("http".to_string(), Value::Object(http));
        origins.push(Value::Object(origin));
        return Ok(());
    }

    for (index, origin) in origins.iter_mut().enumerate() {
        let origin = origin.as_object_mut().ok_or(ConfigError::InvalidEntry {
            field: "origins",
            index,
        })?;
        // Only HTTP origins call back into the host
        if let Some(Value::Object(http)) = origin.get_mut("http") {
            http.insert(
                "headerSecret".to_string(),
                Value::String(input.loop_secret.to_string()),
            );
        }
    }

    Ok(())
}

/// The array stored under `field`, created when missing
fn entries_mut<'a>(
    root: &'a mut Map<String, Value>,
    field: &'static str,
) -> Result<&'a mut Vec<Value>, ConfigError> {
    let entry = root
        .entry(field)
        .or_insert_with(|| Value::Array(Vec::new()));
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let entries = entry.as_array_mut().ok_or(ConfigError::NotAnArray(field))?;

    if let Some(index) = entries.iter().position(|e| !e.is_object()) {
        return Err(ConfigError::InvalidEntry { field, index });
    }
    Ok(entries)
}
