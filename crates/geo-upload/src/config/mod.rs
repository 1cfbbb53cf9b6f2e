use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};
use crate::workspace::StorageConfig;

pub const DEFAULT_CANDIDATE_NAME: &str = "Milena Predic";
pub const DEFAULT_MAX_ARTIFACT_BYTES: usize = 5_000_000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

fn default_upload_path() -> String {
    "/upload".into()
}

fn default_base_url_env() -> Option<String> {
    Some("API_URL".into())
}

fn default_candidate_name() -> String {
    DEFAULT_CANDIDATE_NAME.into()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_background_attempts() -> u32 {
    3
}

fn default_background_retry_delay_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_artifact_bytes() -> usize {
    DEFAULT_MAX_ARTIFACT_BYTES
}

fn default_probe_interval_secs() -> u64 {
    5
}

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    pub fn empty() -> Self {
        Self {
            path: PathBuf::from("<defaults>"),
            value: Value::Table(Default::default()),
        }
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let owned = v.clone();
        let parsed = owned
            .try_into()
            .map_err(|e| Error::msg(format!("failed to deserialize config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    pub fn app_config(&self) -> Result<AppConfig> {
        Ok(AppConfig {
            storage: self.deserialize_path("storage")?.unwrap_or_default(),
            uploader: self.deserialize_path("uploader")?.unwrap_or_default(),
            queue: self.deserialize_path("queue")?.unwrap_or_default(),
            connectivity: self.deserialize_path("connectivity")?.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub base_url: Option<String>,
    #[serde(default = "default_base_url_env")]
    pub base_url_env: Option<String>,
    #[serde(default = "default_upload_path")]
    pub path: String,
    #[serde(default = "default_candidate_name")]
    pub candidate_name: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    // Attempts made by the detached background transfer before it gives up.
    #[serde(default = "default_background_attempts")]
    pub background_attempts: u32,
    // Base delay between background attempts; doubles after each failure.
    #[serde(default = "default_background_retry_delay_ms")]
    pub background_retry_delay_ms: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            base_url_env: default_base_url_env(),
            path: default_upload_path(),
            candidate_name: default_candidate_name(),
            timeout_secs: default_timeout_secs(),
            background_attempts: default_background_attempts(),
            background_retry_delay_ms: default_background_retry_delay_ms(),
        }
    }
}

impl UploaderConfig {
    /// Literal `base_url` wins over the environment indirection.
    pub fn resolve_base_url(&self) -> Result<String> {
        resolve_string_field(self.base_url.as_deref(), self.base_url_env.as_deref()).ok_or_else(
            || {
                Error::msg(format!(
                    "uploader.base_url is not set (and env '{}' is empty)",
                    self.base_url_env.as_deref().unwrap_or("<none>")
                ))
            },
        )
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn background_retry_delay(&self) -> Duration {
        Duration::from_millis(self.background_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_artifact_bytes")]
    pub max_artifact_bytes: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_artifact_bytes: default_max_artifact_bytes(),
        }
    }
}

impl QueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    // "host:port" probed over TCP; derived from the upload URL when unset.
    pub probe_addr: Option<String>,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
}

impl Default for ConnectivityConfig {
    fn default() -> Self {
        Self {
            probe_addr: None,
            probe_interval_secs: default_probe_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub uploader: UploaderConfig,
    pub queue: QueueConfig,
    pub connectivity: ConnectivityConfig,
}

fn resolve_env_ref(env_key: Option<&str>) -> Option<String> {
    env_key
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .and_then(|k| std::env::var(k).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn resolve_string_field(literal: Option<&str>, env_key: Option<&str>) -> Option<String> {
    literal
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| resolve_env_ref(env_key))
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::msg(format!(
            "config extends cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;

    // Single-parent extends: the parent is loaded first, local keys win.
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        let base_path = resolve_ref_path(path, ext);
        out = load_value_inner(&base_path, stack)?;
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
    }

    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

/// Loads `path` when given, otherwise falls back to built-in defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<ConfigDoc> {
    match path {
        Some(p) => load(p),
        None => Ok(ConfigDoc::empty()),
    }
}
