//! Global config singleton, loaded once from a JSON settings file. Same `OnceLock::get_or_init`
//! pattern as the teacher's `config.rs`, adapted to this gateway's settings.
//!
//! Unlike the teacher (which falls back to `Config::default()` on any read *or parse* failure),
//! a settings file that exists but fails to parse is a startup error here: a bastion that
//! silently runs with defaults instead of the operator's intended recording directory or
//! rendering-daemon address is a worse failure mode than a text editor doing the same.

use std::path::PathBuf;
use std::sync::OnceLock;

/// Cached config, loaded from `settings.json` (or the path passed to [`load`]).
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory recordings are written under (mode 0750). Default `./recordings`.
    pub recordings_dir: PathBuf,
    /// `host:port` of the Guacamole-speaking rendering daemon. Default `127.0.0.1:4822`.
    pub rendering_daemon_addr: String,
    /// Address the gateway's HTTP/WebSocket listener binds to. Default `127.0.0.1:8080`.
    pub listen_addr: String,
    /// Path to the audit sqlite database. Default `./bastion.db`.
    pub audit_db_path: PathBuf,
    /// SSH dial timeout in seconds (spec §4.5 step 1: "Connect TCP timeout 10 s"). Default 10.
    pub ssh_connect_timeout_secs: u64,
    /// Path to an OpenSSH-format known_hosts file. When set, SSH host-key verification is
    /// strict; when unset, the default permissive policy is used (spec §9: "pluggable...source
    /// default is permissive").
    pub known_hosts_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recordings_dir: PathBuf::from("./recordings"),
            rendering_daemon_addr: "127.0.0.1:4822".to_string(),
            listen_addr: "127.0.0.1:8080".to_string(),
            audit_db_path: PathBuf::from("./bastion.db"),
            ssh_connect_timeout_secs: 10,
            known_hosts_path: None,
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Ensure config is loaded (idempotent): the first caller loads `./settings.json` (or
/// `$BASTION_SETTINGS` if set), later callers get the same instance. A present-but-unparseable
/// settings file aborts startup (returns `Err`) rather than silently falling back to defaults.
pub fn ensure_loaded() -> Result<&'static Config, String> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let path = std::env::var("BASTION_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("settings.json"));
    let config = load(&path)?;
    Ok(CONFIG.get_or_init(|| config))
}

/// Load settings from `path`. A missing file yields defaults (not an error); a present-but-
/// unparseable file is an error.
pub fn load(path: &std::path::Path) -> Result<Config, String> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(format!("reading {}: {e}", path.display())),
    };
    let root: serde_json::Value =
        serde_json::from_str(&data).map_err(|e| format!("parsing {}: {e}", path.display()))?;

    let defaults = Config::default();
    let recordings_dir = root
        .get("recordings_dir")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or(defaults.recordings_dir);
    let rendering_daemon_addr = root
        .get("rendering_daemon_addr")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or(defaults.rendering_daemon_addr);
    let listen_addr = root
        .get("listen_addr")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or(defaults.listen_addr);
    let audit_db_path = root
        .get("audit_db_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
        .unwrap_or(defaults.audit_db_path);
    let ssh_connect_timeout_secs = root
        .get("ssh_connect_timeout_secs")
        .and_then(|v| v.as_u64())
        .unwrap_or(defaults.ssh_connect_timeout_secs);
    let known_hosts_path = root
        .get("known_hosts_path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);

    Ok(Config {
        recordings_dir,
        rendering_daemon_addr,
        listen_addr,
        audit_db_path,
        ssh_connect_timeout_secs,
        known_hosts_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load(std::path::Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080");
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn partial_overrides_fall_back_to_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"listen_addr": "0.0.0.0:9000"}"#).unwrap();
        let config = load(&path).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.rendering_daemon_addr, "127.0.0.1:4822");
    }
}
