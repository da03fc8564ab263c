//! Engine configuration: defaults, then config file (if present), then env vars.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::chunk::{DEFAULT_MAX_MESSAGE_LEN, MIN_MESSAGE_LEN};
use crate::hash::DEFAULT_HASH_CACHE_CAPACITY;
use crate::protocol::FieldCode;

/// Engine configuration. File: $FIELDSYNC_CONFIG, ~/.config/fieldsync/config.toml or /etc/fieldsync/config.toml.
/// Env overrides: FIELDSYNC_MAX_MESSAGE_LEN, FIELDSYNC_FIELD_FREQUENCY, FIELDSYNC_PROBE_FREQUENCY.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Transport per-message byte limit (default 255).
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    /// Minimum seconds between requests for the same remote field (default 20).
    #[serde(default = "default_field_frequency")]
    pub field_frequency_secs: u64,
    /// Minimum seconds between probes of an unresponsive peer (default 120).
    #[serde(default = "default_probe_frequency")]
    pub probe_frequency_secs: u64,
    /// Window in which a repeated inbound request is ignored (default 5).
    #[serde(default = "default_request_dedup")]
    pub request_dedup_secs: u64,
    /// Age after which an incomplete inbound payload is dropped (default 60).
    #[serde(default = "default_buffer_timeout")]
    pub buffer_timeout_secs: u64,
    #[serde(default = "default_hash_cache_capacity")]
    pub hash_cache_capacity: usize,
    /// Dispatch separator-terminated commands before the last chunk arrives.
    #[serde(default = "default_speculative_dispatch")]
    pub speculative_dispatch: bool,
    /// Ordered members of the summary bundle.
    #[serde(default = "default_bundle_codes")]
    pub bundle_codes: Vec<String>,
}

fn default_max_message_len() -> usize {
    DEFAULT_MAX_MESSAGE_LEN
}
fn default_field_frequency() -> u64 {
    20
}
fn default_probe_frequency() -> u64 {
    120
}
fn default_request_dedup() -> u64 {
    5
}
fn default_buffer_timeout() -> u64 {
    60
}
fn default_hash_cache_capacity() -> usize {
    DEFAULT_HASH_CACHE_CAPACITY
}
fn default_speculative_dispatch() -> bool {
    true
}
fn default_bundle_codes() -> Vec<String> {
    ["VP", "VA", "NA", "NH", "NI", "NT", "RA", "RC", "CU", "FR", "FC"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            field_frequency_secs: default_field_frequency(),
            probe_frequency_secs: default_probe_frequency(),
            request_dedup_secs: default_request_dedup(),
            buffer_timeout_secs: default_buffer_timeout(),
            hash_cache_capacity: default_hash_cache_capacity(),
            speculative_dispatch: default_speculative_dispatch(),
            bundle_codes: default_bundle_codes(),
        }
    }
}

/// Invalid configuration value.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid bundle field code {0:?}")]
    InvalidFieldCode(String),
    #[error("max_message_len {0} is below the minimum of {min}", min = MIN_MESSAGE_LEN)]
    MessageLenTooSmall(usize),
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let c: Config = toml::from_str(s)?;
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_message_len < MIN_MESSAGE_LEN {
            return Err(ConfigError::MessageLenTooSmall(self.max_message_len));
        }
        self.bundle_field_codes().map(|_| ())
    }

    /// Bundle members as field codes, in configured order.
    pub fn bundle_field_codes(&self) -> Result<Vec<FieldCode>, ConfigError> {
        self.bundle_codes
            .iter()
            .map(|s| FieldCode::parse(s).ok_or_else(|| ConfigError::InvalidFieldCode(s.clone())))
            .collect()
    }

    /// Read and validate one config file.
    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let c = Self::from_toml_str(&s).with_context(|| format!("parsing {}", path.display()))?;
        Ok(c)
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_first(&config_paths()).unwrap_or_default();
    apply_env_overrides(&mut c, |key| std::env::var(key).ok());
    c
}

fn apply_env_overrides(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(n) = var("FIELDSYNC_MAX_MESSAGE_LEN").and_then(|s| s.parse::<usize>().ok()) {
        if n >= MIN_MESSAGE_LEN {
            c.max_message_len = n;
        }
    }
    if let Some(n) = var("FIELDSYNC_FIELD_FREQUENCY").and_then(|s| s.parse::<u64>().ok()) {
        c.field_frequency_secs = n;
    }
    if let Some(n) = var("FIELDSYNC_PROBE_FREQUENCY").and_then(|s| s.parse::<u64>().ok()) {
        c.probe_frequency_secs = n;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(p) = std::env::var_os("FIELDSYNC_CONFIG") {
        out.push(PathBuf::from(p));
    }
    if let Some(h) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(h.join(".config/fieldsync/config.toml"));
    }
    out.push(PathBuf::from("/etc/fieldsync/config.toml"));
    out
}

/// First existing path wins; if it does not parse, defaults are used.
fn load_first(paths: &[PathBuf]) -> Option<Config> {
    let p = paths.iter().find(|p| p.exists())?;
    match Config::load_from_path(p) {
        Ok(c) => Some(c),
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "ignoring config file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io;
    use std::sync::{Arc, Mutex};

    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.max_message_len, 255);
        assert_eq!(c.field_frequency_secs, 20);
        assert_eq!(c.probe_frequency_secs, 120);
        assert!(c.speculative_dispatch);
        let codes = c.bundle_field_codes().unwrap();
        assert_eq!(codes[0], FieldCode::VERSION);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let c = Config::from_toml_str(
            "max_message_len = 100\nbundle_codes = [\"VP\", \"NA\", \"RA\"]\n",
        )
        .unwrap();
        assert_eq!(c.max_message_len, 100);
        assert_eq!(c.bundle_codes, vec!["VP", "NA", "RA"]);
        assert_eq!(c.request_dedup_secs, 5);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(matches!(
            Config::from_toml_str("proxy_port = 3128"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::from_toml_str("bundle_codes = [\"na\"]"),
            Err(ConfigError::InvalidFieldCode(_))
        ));
        assert!(matches!(
            Config::from_toml_str("max_message_len = 4"),
            Err(ConfigError::MessageLenTooSmall(4))
        ));
    }

    fn write(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn first_existing_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let first = write(&dir, "a.toml", "field_frequency_secs = 7\n");
        let second = write(&dir, "b.toml", "field_frequency_secs = 9\n");
        let c = load_first(&[missing, first, second]).unwrap();
        assert_eq!(c.field_frequency_secs, 7);
        assert_eq!(c.probe_frequency_secs, 120);
    }

    #[test]
    fn invalid_file_falls_back_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write(&dir, "bad.toml", "max_message_len = \"large\"\n");
        let good = write(&dir, "good.toml", "max_message_len = 100\n");

        let logs = Arc::new(Mutex::new(Vec::new()));
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || Capture(sink.clone()))
            .finish();
        let loaded = tracing::subscriber::with_default(subscriber, || load_first(&[bad, good]));

        assert!(loaded.is_none());
        assert_eq!(loaded.unwrap_or_default().max_message_len, 255);
        let logs = String::from_utf8(logs.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("WARN"));
        assert!(logs.contains("ignoring config file"));
    }

    #[test]
    fn env_overrides_beat_file() {
        let mut c = Config::from_toml_str("field_frequency_secs = 7\nmax_message_len = 100\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("FIELDSYNC_FIELD_FREQUENCY", "30"),
            ("FIELDSYNC_PROBE_FREQUENCY", "soon"),
            ("FIELDSYNC_MAX_MESSAGE_LEN", "4"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.field_frequency_secs, 30);
        // unparsable and too-small values are ignored
        assert_eq!(c.probe_frequency_secs, 120);
        assert_eq!(c.max_message_len, 100);
    }

    #[test]
    fn load_reads_config_env_path_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "fieldsync.toml", "field_frequency_secs = 7\nprobe_frequency_secs = 50\n");
        std::env::set_var("FIELDSYNC_CONFIG", &path);
        std::env::set_var("FIELDSYNC_PROBE_FREQUENCY", "90");
        let c = load();
        std::env::remove_var("FIELDSYNC_CONFIG");
        std::env::remove_var("FIELDSYNC_PROBE_FREQUENCY");
        assert_eq!(c.field_frequency_secs, 7);
        assert_eq!(c.probe_frequency_secs, 90);
    }

    #[test]
    fn load_from_missing_path_errors() {
        let err = Config::load_from_path(Path::new("/nonexistent/fieldsync.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("reading"));
    }
}
