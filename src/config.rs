use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: i64 = 3000;
pub const DEFAULT_MODE: &str = "copy";

/// Accepted values for `whatsapp.mode`.
pub const MODES: [&str; 2] = ["copy", "forward"];

static LIST_SEPARATOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\n|]+").unwrap_or_else(|e| unreachable!("static list separator regex: {e}"))
});

/// Errors that can occur when reading or saving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {source}", path.display())]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file '{}': {source}", path.display())]
    ParseJson { path: PathBuf, source: serde_json::Error },
    #[error("failed to write config file '{}': {source}", path.display())]
    WriteFile { path: PathBuf, source: std::io::Error },
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Validation failed; each entry is a human-readable message.
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Config {
    pub web: WebConfig,
    pub whatsapp: WhatsAppConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebConfig {
    pub bind: String,
    /// Kept wide until `validate` so out-of-range input can be reported.
    pub port: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppConfig {
    /// "copy" or "forward"
    pub mode: String,
    /// Also relay messages sent from the paired account itself.
    pub allow_own: bool,
    /// Log every dropped message and the reason.
    pub debug: bool,
    pub keywords: Vec<String>,
    pub target: ChatRef,
    pub sources: Vec<ChatRef>,
    /// Browser binary handed to the sidecar. Empty means its bundled default.
    pub puppeteer_executable_path: String,
    pub headless: bool,
}

/// A chat picked by id, by name, or both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChatRef {
    pub id: String,
    pub name: String,
}

impl ChatRef {
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.name.is_empty()
    }

    /// Name if known, otherwise id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.id } else { &self.name }
    }
}

impl Default for Config {
    fn default() -> Self {
        normalize(&Value::Null)
    }
}

impl Config {
    pub fn to_value(&self) -> Result<Value, ConfigError> {
        Ok(serde_json::to_value(self)?)
    }
}

fn defaults() -> Value {
    json!({
        "web": { "bind": DEFAULT_BIND, "port": DEFAULT_PORT },
        "whatsapp": {
            "mode": DEFAULT_MODE,
            "allowOwn": false,
            "debug": false,
            "keywords": [],
            "target": { "id": "", "name": "" },
            "sources": [],
            "puppeteerExecutablePath": "",
            "headless": false,
        },
    })
}

/// Parse a boolean flag from an environment string.
///
/// `1/true/yes/on` and `0/false/no/off` are recognised (case-insensitive);
/// anything else, including an unset or empty value, yields `default`.
pub fn parse_bool(value: Option<&str>, default: bool) -> bool {
    let Some(value) = value else {
        return default;
    };
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

/// Split a newline- or pipe-delimited list, trimming and dropping empty items.
pub fn split_list(value: Option<&str>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    LIST_SEPARATOR
        .split(value)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Build the environment layer. `lookup` returns the raw variable value.
pub fn from_env<F>(lookup: F) -> Value
where
    F: Fn(&str) -> Option<String>,
{
    let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

    let bind = var("WEB_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
    let port = var("WEB_PORT")
        .and_then(|p| p.trim().parse::<f64>().ok())
        .filter(|p| p.is_finite() && *p != 0.0)
        .map(|p| p as i64)
        .unwrap_or(DEFAULT_PORT);
    let mode = var("MODE").unwrap_or_else(|| DEFAULT_MODE.to_string());

    let sources: Vec<Value> = split_list(var("SOURCE_CHATS").as_deref())
        .into_iter()
        .map(|name| json!({ "id": "", "name": name }))
        .collect();

    json!({
        "web": { "bind": bind.trim(), "port": port },
        "whatsapp": {
            "mode": mode.trim().to_lowercase(),
            "allowOwn": parse_bool(var("ALLOW_OWN").as_deref(), false),
            "debug": parse_bool(var("DEBUG").as_deref(), false),
            "keywords": split_list(var("KEYWORDS").as_deref()),
            "target": { "id": "", "name": var("TARGET_CHAT").unwrap_or_default().trim() },
            "sources": sources,
            "puppeteerExecutablePath": var("PUPPETEER_EXECUTABLE_PATH").unwrap_or_default().trim(),
            "headless": parse_bool(var("HEADLESS").as_deref(), false),
        },
    })
}

/// Merge `overlay` onto `base`.
///
/// Objects merge key by key (keys missing from `base` are copied over),
/// arrays are replaced wholesale, and scalars take the overlay value unless
/// it is `null`.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match base {
        Value::Array(_) => {
            if overlay.is_array() {
                overlay.clone()
            } else {
                base.clone()
            }
        }
        Value::Object(base_map) => {
            let mut out = base_map.clone();
            if let Value::Object(overlay_map) = overlay {
                for (key, value) in overlay_map {
                    let merged = match base_map.get(key) {
                        Some(existing) => deep_merge(existing, value),
                        None => value.clone(),
                    };
                    out.insert(key.clone(), merged);
                }
            }
            Value::Object(out)
        }
        _ => {
            if overlay.is_null() {
                base.clone()
            } else {
                overlay.clone()
            }
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

fn field<'a>(value: &'a Value, key: &str) -> &'a Value {
    value.get(key).unwrap_or(&Value::Null)
}

fn text_or(value: &Value, default: &str) -> String {
    if truthy(value) { text(value) } else { default.to_string() }
}

fn port_of(value: &Value) -> i64 {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(true) => Some(1.0),
        _ => None,
    };
    parsed
        .filter(|p| p.is_finite() && *p != 0.0)
        .map(|p| p as i64)
        .unwrap_or(DEFAULT_PORT)
}

fn chat_ref(value: &Value) -> ChatRef {
    ChatRef {
        id: text_or(field(value, "id"), "").trim().to_string(),
        name: text_or(field(value, "name"), "").trim().to_string(),
    }
}

/// Merge `input` onto the defaults and coerce it into a [`Config`].
///
/// Strings are trimmed, `mode` is lower-cased, booleans follow truthiness,
/// empty keywords and sources with neither id nor name are dropped. Keyword
/// order and duplicates are preserved. No range checks happen here; see
/// [`validate`].
pub fn normalize(input: &Value) -> Config {
    let merged = deep_merge(&defaults(), input);
    let web = field(&merged, "web");
    let wa = field(&merged, "whatsapp");

    let bind = text_or(field(web, "bind"), DEFAULT_BIND).trim().to_string();
    let bind = if bind.is_empty() { DEFAULT_BIND.to_string() } else { bind };

    let keywords = field(wa, "keywords")
        .as_array()
        .map(|items| {
            items
                .iter()
                .map(|k| text(k).trim().to_string())
                .filter(|k| !k.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let sources = field(wa, "sources")
        .as_array()
        .map(|items| items.iter().map(chat_ref).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    Config {
        web: WebConfig { bind, port: port_of(field(web, "port")) },
        whatsapp: WhatsAppConfig {
            mode: text_or(field(wa, "mode"), DEFAULT_MODE).trim().to_lowercase(),
            allow_own: truthy(field(wa, "allowOwn")),
            debug: truthy(field(wa, "debug")),
            keywords,
            target: chat_ref(field(wa, "target")),
            sources,
            puppeteer_executable_path: text_or(field(wa, "puppeteerExecutablePath"), "")
                .trim()
                .to_string(),
            headless: truthy(field(wa, "headless")),
        },
    }
}

/// Check the fields that can make the bridge unusable. Empty means valid.
pub fn validate(config: &Config) -> Vec<String> {
    let mut errors = Vec::new();
    if !(1..=65535).contains(&config.web.port) {
        errors.push("web.port must be 1..65535".to_string());
    }
    if !MODES.contains(&config.whatsapp.mode.as_str()) {
        errors.push(r#"whatsapp.mode must be "copy" or "forward""#.to_string());
    }
    errors
}

/// Advisory notes for an incomplete but valid config. Never blocking.
pub fn warnings(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.whatsapp.target.is_empty() {
        warnings.push("No target group configured (target).".to_string());
    }
    if config.whatsapp.sources.is_empty() {
        warnings.push("No source groups selected (sources).".to_string());
    }
    if config.whatsapp.keywords.is_empty() {
        warnings.push("No keywords configured.".to_string());
    }
    warnings
}

/// On-disk config file plus the layering rules around it.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the raw file. A missing file is `Ok(None)`.
    pub fn read(&self) -> Result<Option<Value>, ConfigError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::ReadFile { path: self.path.clone(), source: e })?;
        let value = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: self.path.clone(), source: e })?;
        Ok(Some(value))
    }

    /// Resolve the startup config from the process environment and the file.
    pub fn load(&self) -> Config {
        self.load_with(&from_env(|key| std::env::var(key).ok()))
    }

    /// Resolve the startup config from `env` (as built by [`from_env`]) and
    /// the file. The result is normalized but not validated. When no file
    /// exists yet, the result is written out once.
    pub fn load_with(&self, env: &Value) -> Config {
        let disk = match self.read() {
            Ok(disk) => disk,
            Err(e) => {
                warn!("Ignoring config file: {e}");
                None
            }
        };

        let mut merged = deep_merge(env, disk.as_ref().unwrap_or(&Value::Object(Map::new())));
        if let Some(ref disk) = disk {
            defer_empty_to_env(&mut merged, env, disk);
        }

        let config = normalize(&merged);

        if !self.path.exists() {
            match self.write(&config) {
                Ok(()) => info!("Wrote initial config to {}", self.path.display()),
                Err(e) => warn!("Failed to write initial config: {e}"),
            }
        }

        config
    }

    /// Normalize, validate and atomically persist `input`.
    ///
    /// On validation failure nothing is written and the messages are
    /// returned in [`ConfigError::Invalid`].
    pub fn save(&self, input: &Value) -> Result<Config, ConfigError> {
        let config = normalize(input);
        let errors = validate(&config);
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        self.write(&config)?;
        Ok(config)
    }

    fn write(&self, config: &Config) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(config)?;
        let tmp = self.tmp_path();
        std::fs::write(&tmp, content)
            .map_err(|e| ConfigError::WriteFile { path: tmp.clone(), source: e })?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| ConfigError::WriteFile { path: self.path.clone(), source: e })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

/// A file that exists but still has empty keywords, sources or target falls
/// back to whatever the environment provides for those fields.
fn defer_empty_to_env(merged: &mut Value, env: &Value, disk: &Value) {
    for key in ["keywords", "sources"] {
        let pointer = format!("/whatsapp/{key}");
        let disk_empty = disk
            .pointer(&pointer)
            .and_then(Value::as_array)
            .is_some_and(Vec::is_empty);
        let env_list = env.pointer(&pointer).filter(|v| v.as_array().is_some_and(|a| !a.is_empty()));
        if let (true, Some(env_list), Some(slot)) = (disk_empty, env_list, merged.pointer_mut(&pointer)) {
            *slot = env_list.clone();
        }
    }

    let disk_target_empty = disk
        .pointer("/whatsapp/target")
        .filter(|t| t.is_object())
        .is_some_and(|t| !truthy(field(t, "id")) && !truthy(field(t, "name")));
    let env_target = env
        .pointer("/whatsapp/target")
        .filter(|t| truthy(field(t, "id")) || truthy(field(t, "name")));
    if let (true, Some(env_target), Some(slot)) =
        (disk_target_empty, env_target, merged.pointer_mut("/whatsapp/target"))
    {
        *slot = env_target.clone();
    }
}
