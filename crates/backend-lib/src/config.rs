// ============================
// pika-backend-lib/src/config.rs
// ============================
//! Configuration management.
use anyhow::Result;
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Application settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Data directory path
    pub data_dir: PathBuf,
    /// Log level
    pub log_level: String,
    /// Sticky grace window: a disconnected listener still counts as
    /// present for this long
    pub listener_grace_secs: u64,
    /// Entries idle longer than this are dropped by the periodic sweep
    pub listener_stale_secs: u64,
    /// Unique-listener count cache lifetime
    pub count_cache_ms: u64,
    /// Interval between stale-listener sweeps
    pub sweep_interval_secs: u64,
    /// Poll limits
    pub poll: PollLimits,
}

/// Bounds on poll questions and options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollLimits {
    pub min_options: usize,
    pub max_options: usize,
    pub max_option_len: usize,
    pub max_question_len: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".parse().unwrap(),
            data_dir: PathBuf::from("data"),
            log_level: "info".to_string(),
            listener_grace_secs: 5 * 60,
            listener_stale_secs: 60 * 60,
            count_cache_ms: 1000,
            sweep_interval_secs: 60,
            poll: PollLimits::default(),
        }
    }
}

impl Default for PollLimits {
    fn default() -> Self {
        Self {
            min_options: 2,
            max_options: 10,
            max_option_len: 200,
            max_question_len: 500,
        }
    }
}

impl Settings {
    /// Load settings from config files and `PIKA_` environment variables
    pub fn load() -> Result<Self> {
        let settings = Figment::new()
            .merge(Toml::file("config.toml"))
            .merge(Yaml::file("config.yaml"))
            .merge(Json::file("config.json"))
            .merge(Env::prefixed("PIKA_"))
            .extract()?;

        Ok(settings)
    }

    /// Load settings from an explicit TOML file, with env overrides
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("PIKA_"))
            .extract()?;

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.listener_grace_secs, 300);
        assert_eq!(settings.listener_stale_secs, 3600);
        assert_eq!(settings.count_cache_ms, 1000);
        assert_eq!(settings.poll.min_options, 2);
        assert_eq!(settings.poll.max_options, 10);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
bind_addr = "0.0.0.0:9000"
listener_grace_secs = 30

[poll]
max_options = 4
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.bind_addr.port(), 9000);
        assert_eq!(settings.listener_grace_secs, 30);
        assert_eq!(settings.poll.max_options, 4);
        // untouched fields keep their defaults
        assert_eq!(settings.poll.min_options, 2);
    }
}
