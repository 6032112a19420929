//! Locate the engine binary for the host platform

use crate::config::SidecarConfig;
use crate::error::SupervisorError;
use std::path::PathBuf;
use tracing::debug;

/// Built-in engine binary name for an OS, as reported by `std::env::consts::OS`
pub fn builtin_binary_name(os: &str) -> Option<&'static str> {
    match os {
        "linux" => Some("engineproxy_linux_amd64"),
        "macos" => Some("engineproxy_darwin_amd64"),
        "windows" => Some("engineproxy_windows_amd64.exe"),
        _ => None,
    }
}

/// Directory searched when no `binary_dir` is configured
pub fn default_binary_dir() -> PathBuf {
    dirs_next::data_local_dir()
        .map(|dir| dir.join("enginegate").join("bin"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Resolve the engine binary for the current host
pub fn resolve_binary(config: &SidecarConfig) -> Result<PathBuf, SupervisorError> {
    resolve_binary_for(config, std::env::consts::OS)
}

/// Resolve the engine binary for a given OS.
///
/// An explicit `binary_path` wins; otherwise the per-OS entry (configured or
/// built in) is joined onto the binary directory. Absolute entries are used
/// as they are.
pub fn resolve_binary_for(config: &SidecarConfig, os: &str) -> Result<PathBuf, SupervisorError> {
    let path = match config.binary_path {
        Some(ref path) => path.clone(),
        None => {
            let entry = config
                .binaries
                .get(os)
                .cloned()
                .or_else(|| builtin_binary_name(os).map(PathBuf::from))
                .ok_or_else(|| SupervisorError::UnsupportedPlatform(os.to_string()))?;

            let dir = config.binary_dir.clone().unwrap_or_else(default_binary_dir);
            dir.join(entry)
        }
    };

    if !path.exists() {
        return Err(SupervisorError::BinaryNotFound(path));
    }

    debug!(path = %path.display(), os, "Resolved engine binary");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        assert_eq!(builtin_binary_name("linux"), Some("engineproxy_linux_amd64"));
        assert_eq!(builtin_binary_name("macos"), Some("engineproxy_darwin_amd64"));
        assert_eq!(
            builtin_binary_name("windows"),
            Some("engineproxy_windows_amd64.exe")
        );
        assert_eq!(builtin_binary_name("haiku"), None);
    }

    #[test]
    fn test_unsupported_platform() {
        let config = SidecarConfig::default();
        let err = resolve_binary_for(&config, "haiku").unwrap_err();
        assert!(matches!(err, SupervisorError::UnsupportedPlatform(os) if os == "haiku"));
    }

    #[test]
    fn test_configured_entry_enables_platform() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("engine-haiku"), b"").unwrap();

        let mut config = SidecarConfig::default();
        config.binary_dir = Some(dir.path().to_path_buf());
        config
            .binaries
            .insert("haiku".to_string(), PathBuf::from("engine-haiku"));

        let path = resolve_binary_for(&config, "haiku").unwrap();
        assert_eq!(path, dir.path().join("engine-haiku"));
    }

    #[test]
    fn test_builtin_name_in_binary_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("engineproxy_linux_amd64"), b"").unwrap();

        let mut config = SidecarConfig::default();
        config.binary_dir = Some(dir.path().to_path_buf());

        let path = resolve_binary_for(&config, "linux").unwrap();
        assert_eq!(path, dir.path().join("engineproxy_linux_amd64"));
    }

    #[test]
    fn test_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SidecarConfig::default();
        config.binary_dir = Some(dir.path().to_path_buf());

        let err = resolve_binary_for(&config, "linux").unwrap_err();
        assert!(matches!(err, SupervisorError::BinaryNotFound(p) if p.ends_with("engineproxy_linux_amd64")));
    }

    #[test]
    fn test_explicit_binary_path_wins() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = SidecarConfig::default().with_binary(file.path());

        assert_eq!(resolve_binary_for(&config, "haiku").unwrap(), file.path());

        let config = SidecarConfig::default().with_binary("/definitely/not/here/engine");
        assert!(matches!(
            resolve_binary_for(&config, "linux"),
            Err(SupervisorError::BinaryNotFound(_))
        ));
    }
}
