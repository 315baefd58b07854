// Process-wide bridge configuration.
//
// Precedence, lowest to highest: built-in defaults, the JSON file named by
// LLAMA_BRIDGE_CONFIG, then the individual LLAMA_BRIDGE_* variables.
// Anything malformed is skipped with a warning; configuration never makes
// backend_init fail.

use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::engine::SamplingConfig;

pub const CONFIG_FILE_ENV: &str = "LLAMA_BRIDGE_CONFIG";
pub const TEMPERATURE_ENV: &str = "LLAMA_BRIDGE_TEMPERATURE";
pub const TOP_K_ENV: &str = "LLAMA_BRIDGE_TOP_K";
pub const TOP_P_ENV: &str = "LLAMA_BRIDGE_TOP_P";
pub const SEED_ENV: &str = "LLAMA_BRIDGE_SEED";
pub const THREADS_ENV: &str = "LLAMA_BRIDGE_THREADS";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub sampling: SamplingConfig,
    /// Used when `create_context` is given `n_threads <= 0`. `None` means
    /// available parallelism.
    pub default_n_threads: Option<usize>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            default_n_threads: None,
            log_filter: "warn".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an environment lookup function.
    pub fn from_lookup(env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = match env(CONFIG_FILE_ENV) {
            Some(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Self::default(),
        };
        config.apply_overrides(&env);
        debug!(?config, "Bridge configuration resolved");
        config
    }

    /// Parse a JSON config file, falling back to defaults on any error.
    fn from_file(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read config file, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&text) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed config file, using defaults");
                Self::default()
            }
        }
    }

    fn apply_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(v) = parse_env::<f32>(env, TEMPERATURE_ENV) {
            if v.is_finite() && v >= 0.0 {
                self.sampling.temperature = v;
            } else {
                warn!(key = TEMPERATURE_ENV, value = v, "temperature must be >= 0, ignoring");
            }
        }
        if let Some(v) = parse_env::<usize>(env, TOP_K_ENV) {
            self.sampling.top_k = v;
        }
        if let Some(v) = parse_env::<f32>(env, TOP_P_ENV) {
            if v > 0.0 && v <= 1.0 {
                self.sampling.top_p = v;
            } else {
                warn!(key = TOP_P_ENV, value = v, "top_p must be in (0, 1], ignoring");
            }
        }
        if let Some(v) = parse_env::<u64>(env, SEED_ENV) {
            self.sampling.seed = Some(v);
        }
        if let Some(v) = parse_env::<usize>(env, THREADS_ENV) {
            if v > 0 {
                self.default_n_threads = Some(v);
            } else {
                warn!(key = THREADS_ENV, "thread count must be positive, ignoring");
            }
        }
    }

    /// Thread count for a context that did not ask for one.
    pub fn resolve_threads(&self) -> usize {
        self.default_n_threads.unwrap_or_else(available_threads)
    }
}

pub fn available_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

fn parse_env<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = raw, "malformed value, ignoring");
            None
        }
    }
}
