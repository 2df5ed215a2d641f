//! TOML configuration loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse `<dataDir>/jarvis.toml` (or the path in `JARVIS_CONFIG`)
//! 2. Apply environment variable overrides (the recognized option set)
//! 3. Fall back to [`AppConfig::default()`] if the file is missing
//!
//! # Atomic save
//! Writes to `<path>.tmp` → fsync → rename to `<path>` to avoid partial
//! writes corrupting the config file.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::AppConfig;

pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::data_dir()
        .map(|d| d.join("jarvis").join("jarvis.toml"))
        .ok_or_else(|| "could not determine data directory".to_string())
}

pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

pub fn load_default_config() -> AppConfig {
    let path = env::var("JARVIS_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_config_path().unwrap_or_else(|_| PathBuf::from("jarvis.toml")));

    load_config(&path).unwrap_or_default()
}

/// Apply environment variable overrides to `config`.
///
/// Covers every recognized override variable. Unset variables leave the
/// corresponding field untouched.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("PORT") {
        if let Ok(port) = v.parse::<u16>() {
            config.server.port = port;
        }
    }
    if let Ok(v) = env::var("JWT_SECRET") {
        config.server.jwt_secret = v;
    }
    if let Ok(v) = env::var("CORS_ORIGINS") {
        config.server.cors_origins = v.split(',').map(|s| s.trim().to_owned()).collect();
    }
    if let Ok(v) = env::var("JARVIS_PASSWORD") {
        config.security.password = v;
    }
    if let Ok(v) = env::var("OVERRIDE_KEY") {
        config.security.override_key = v;
    }
    if let Ok(v) = env::var("APPROVAL_KEYWORD") {
        config.security.approval_keyword = v;
    }
    if let Ok(v) = env::var("PVE_TOKEN_SECRET") {
        config.proxmox.token_secret = v;
    }
    if let Ok(v) = env::var("NODE_TLS_REJECT_UNAUTHORIZED") {
        config.proxmox.tls_insecure = v == "0";
    }
    if let Ok(v) = env::var("DB_PATH") {
        config.database.path = v;
    }
    if let Ok(v) = env::var("SSH_KEY_PATH") {
        config.ssh.key_path = v;
    }
    if let Ok(v) = env::var("TTS_PRIMARY_ENDPOINT") {
        config.tts.primary_endpoint = v;
    }
    if let Ok(v) = env::var("TTS_FALLBACK_ENDPOINT") {
        config.tts.fallback_endpoint = v;
    }
    if let Ok(v) = env::var("TTS_CACHE_DIR") {
        config.tts.cache_dir = v;
    }
    if let Ok(v) = env::var("TTS_CACHE_MAX") {
        if let Ok(n) = v.parse::<usize>() {
            config.tts.cache_max_memory = n;
        }
    }
    if let Ok(v) = env::var("TTS_MAX_PARALLEL") {
        if let Ok(n) = v.parse::<usize>() {
            config.tts.max_parallel = n;
        }
    }
    if let Ok(v) = env::var("OPUS_ENABLED") {
        config.tts.opus_enabled = v == "1" || v.eq_ignore_ascii_case("true");
    }
    if let Ok(v) = env::var("OPUS_BITRATE") {
        if let Ok(n) = v.parse::<u32>() {
            config.tts.opus_bitrate = n;
        }
    }
    if let Ok(v) = env::var("STT_ENDPOINT") {
        config.stt.endpoint = v;
    }
    if let Ok(v) = env::var("LLM_CONV_ENDPOINT") {
        config.llm.conversational_endpoint = v;
    }
    if let Ok(v) = env::var("LLM_AGENTIC_API_KEY") {
        config.llm.agentic_api_key = v;
    }
}

/// Atomically save `config` to `path`: write to `<path>.tmp`, back up any
/// existing file as `<path>.bak`, then rename the temp file into place.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), String> {
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("failed to serialise config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &content).map_err(|e| format!("failed to write temp config: {e}"))?;

    if path.exists() {
        let bak_path = path.with_extension("toml.bak");
        fs::copy(path, &bak_path).map_err(|e| format!("failed to backup config: {e}"))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| format!("failed to replace config file: {e}"))?;
    Ok(())
}

#[cfg(test)]
#[allow(unsafe_code)] // env::set_var / remove_var are unsafe in Rust 2024; tests are single-threaded.
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("jarvis.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[server]
port = 9000
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.security.autonomy_level, "supervised");
        assert_eq!(config.llm.max_iterations, 10);
    }

    #[test]
    fn load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[security]
autonomy_level = "autonomous"
rate_limit_per_minute = 120

[proxmox]
tls_insecure = false

[[proxmox.nodes]]
name = "pve"
host = "192.168.1.10"
token_id = "root@pam!jarvis"

[tts]
max_parallel = 4
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.security.autonomy_level, "autonomous");
        assert_eq!(config.security.rate_limit_per_minute, 120);
        assert!(!config.proxmox.tls_insecure);
        assert_eq!(config.proxmox.nodes.len(), 1);
        assert_eq!(config.proxmox.nodes[0].name, "pve");
        assert_eq!(config.tts.max_parallel, 4);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jarvis.toml");

        let mut original = AppConfig::default();
        original.security.autonomy_level = "autonomous".to_owned();
        original.tts.max_parallel = 3;

        save_config(&path, &original).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded, original, "config should round-trip through save/load");
    }

    #[test]
    fn save_creates_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jarvis.toml");

        save_config(&path, &AppConfig::default()).unwrap();
        save_config(&path, &AppConfig::default()).unwrap();

        let bak = path.with_extension("toml.bak");
        assert!(bak.exists(), "backup file should exist after second save");
    }

    #[test]
    fn env_override_jarvis_password() {
        let key = "JARVIS_PASSWORD";
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe { env::set_var(key, "hunter2") };
        let config = load_default_config();
        // SAFETY: same as set_var above.
        unsafe { env::remove_var(key) };
        assert_eq!(config.security.password, "hunter2");
    }

    #[test]
    fn env_override_tts_max_parallel() {
        let key = "TTS_MAX_PARALLEL";
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe { env::set_var(key, "5") };
        let config = load_default_config();
        // SAFETY: same as set_var above.
        unsafe { env::remove_var(key) };
        assert_eq!(config.tts.max_parallel, 5);
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "this is not valid toml!!!");
        let result = load_config(&path);
        assert!(result.is_err(), "invalid TOML should return an error");
    }
}
