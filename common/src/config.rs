use std::{
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::{health, provisioning::DEFAULT_PORTAL_DOMAIN, storage::write_atomically};

pub const KEY_NICKNAME: &str = "nickname";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASSWORD: &str = "wifi_password";
pub const KEY_DESTINATION: &str = "destination";
pub const KEY_PROVISIONED: &str = "provisioned";
pub const KEY_READING_FREQUENCY: &str = "reading_frequency";
pub const KEY_UPLOAD_BATCH_SIZE: &str = "upload_batch_size";

pub const DEFAULT_READING_FREQUENCY_MIN: u32 = 15;
pub const DEFAULT_UPLOAD_BATCH_SIZE: u32 = 5;

/// Written on first boot. Every recognised key is present so later rewrites
/// only ever touch existing lines.
pub const CONFIG_TEMPLATE: &str = r#"# enviro device configuration
# written by the provisioning wizard, edit with care

# name shown for this device
nickname = ""

# wifi network to join for clock sync and uploads
wifi_ssid = ""
wifi_password = ""

# where to send readings, leave blank to keep them on the device
destination = ""

# minutes between readings
reading_frequency = 15

# cached readings to collect before uploading
upload_batch_size = 5

# set by the wizard once setup is complete
provisioned = false
"#;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} not found")]
    NotFound { path: PathBuf },
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt config at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Opaque upload endpoint, e.g. `https://example.com/ingest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination(String);

impl Destination {
    /// Blank input means "no destination".
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub nickname: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub destination: Option<Destination>,
    pub provisioned: bool,
    pub reading_frequency_min: u32,
    pub upload_batch_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            nickname: String::new(),
            wifi_ssid: String::new(),
            wifi_password: String::new(),
            destination: None,
            provisioned: false,
            reading_frequency_min: DEFAULT_READING_FREQUENCY_MIN,
            upload_batch_size: DEFAULT_UPLOAD_BATCH_SIZE,
        }
    }
}

impl Config {
    pub fn has_credentials(&self) -> bool {
        !self.wifi_ssid.is_empty() && !self.wifi_password.is_empty()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provisioned && !self.has_credentials() {
            return Err(ConfigError::Invalid(
                "provisioned device is missing wifi credentials".to_string(),
            ));
        }
        if self.reading_frequency_min == 0 {
            return Err(ConfigError::Invalid(
                "reading_frequency must be at least 1 minute".to_string(),
            ));
        }
        if self.upload_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "upload_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_document(doc: &ConfigDocument) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            nickname: doc.text(KEY_NICKNAME)?.unwrap_or_default(),
            wifi_ssid: doc.text(KEY_WIFI_SSID)?.unwrap_or_default(),
            wifi_password: doc.text(KEY_WIFI_PASSWORD)?.unwrap_or_default(),
            destination: doc
                .text(KEY_DESTINATION)?
                .and_then(|raw| Destination::parse(&raw)),
            provisioned: doc.flag(KEY_PROVISIONED)?.unwrap_or(defaults.provisioned),
            reading_frequency_min: doc
                .number(KEY_READING_FREQUENCY)?
                .unwrap_or(defaults.reading_frequency_min),
            upload_batch_size: doc
                .number(KEY_UPLOAD_BATCH_SIZE)?
                .unwrap_or(defaults.upload_batch_size),
        })
    }

    /// Writes every recognised field into `doc`. Keys missing from the
    /// document are only appended when they differ from the default.
    pub fn apply_to(&self, doc: &mut ConfigDocument) {
        let defaults = Self::default();
        let destination = self
            .destination
            .as_ref()
            .map(|destination| destination.as_str().to_string())
            .unwrap_or_default();
        // Surrounding whitespace is not part of a destination; leave the line alone.
        let destination_unchanged = doc
            .get(KEY_DESTINATION)
            .and_then(Value::as_str)
            .is_some_and(|stored| stored.trim() == destination);

        let fields = [
            (
                KEY_NICKNAME,
                Value::from(self.nickname.clone()),
                self.nickname == defaults.nickname,
            ),
            (
                KEY_WIFI_SSID,
                Value::from(self.wifi_ssid.clone()),
                self.wifi_ssid == defaults.wifi_ssid,
            ),
            (
                KEY_WIFI_PASSWORD,
                Value::from(self.wifi_password.clone()),
                self.wifi_password == defaults.wifi_password,
            ),
            (
                KEY_DESTINATION,
                Value::from(destination),
                self.destination.is_none(),
            ),
            (
                KEY_READING_FREQUENCY,
                Value::from(self.reading_frequency_min),
                self.reading_frequency_min == defaults.reading_frequency_min,
            ),
            (
                KEY_UPLOAD_BATCH_SIZE,
                Value::from(self.upload_batch_size),
                self.upload_batch_size == defaults.upload_batch_size,
            ),
            (
                KEY_PROVISIONED,
                Value::from(self.provisioned),
                self.provisioned == defaults.provisioned,
            ),
        ];

        for (key, value, is_default) in fields {
            if is_default && doc.get(key).is_none() {
                continue;
            }
            if key == KEY_DESTINATION && destination_unchanged {
                continue;
            }
            doc.set(key, value);
        }
    }
}

fn is_recognised_key(key: &str) -> bool {
    matches!(
        key,
        KEY_NICKNAME
            | KEY_WIFI_SSID
            | KEY_WIFI_PASSWORD
            | KEY_DESTINATION
            | KEY_PROVISIONED
            | KEY_READING_FREQUENCY
            | KEY_UPLOAD_BATCH_SIZE
    )
}

#[derive(Debug, Clone, PartialEq)]
enum DocLine {
    Verbatim(String),
    Entry {
        key: String,
        value: Value,
        raw: String,
    },
}

/// Line-oriented `key = value` record. Recognised keys are parsed into JSON
/// literals; every other line is kept verbatim. Only a recognised key with an
/// unreadable value makes the document corrupt.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigDocument {
    lines: Vec<DocLine>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut lines = Vec::new();

        for (index, line) in text.split('\n').enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(DocLine::Verbatim(line.to_string()));
                continue;
            }

            let recognised = trimmed
                .split_once('=')
                .map(|(key, value)| (key.trim(), value))
                .filter(|(key, _)| is_recognised_key(key));
            let Some((key, value)) = recognised else {
                lines.push(DocLine::Verbatim(line.to_string()));
                continue;
            };

            let value = serde_json::from_str::<Value>(value.trim()).map_err(|err| {
                ConfigError::Corrupt {
                    line: index + 1,
                    reason: format!("unreadable value for `{key}`: {err}"),
                }
            })?;

            lines.push(DocLine::Entry {
                key: key.to_string(),
                value,
                raw: line.to_string(),
            });
        }

        Ok(Self { lines })
    }

    /// Last assignment wins.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.lines.iter().rev().find_map(|line| match line {
            DocLine::Entry { key: k, value, .. } if k == key => Some(value),
            _ => None,
        })
    }

    /// Rewrites every line assigning `key`. Lines whose value is unchanged
    /// keep their original text. A missing key is appended at the end.
    pub fn set(&mut self, key: &str, value: Value) {
        let mut found = false;
        for line in &mut self.lines {
            if let DocLine::Entry {
                key: k,
                value: current,
                raw,
            } = line
            {
                if k == key {
                    found = true;
                    if *current != value {
                        *raw = format!("{key} = {value}");
                        *current = value.clone();
                    }
                }
            }
        }

        if found {
            return;
        }

        let entry = DocLine::Entry {
            key: key.to_string(),
            raw: format!("{key} = {value}"),
            value,
        };

        // Keep a trailing newline trailing.
        match self.lines.last() {
            Some(DocLine::Verbatim(last)) if last.is_empty() => {
                let index = self.lines.len() - 1;
                self.lines.insert(index, entry);
            }
            _ => self.lines.push(entry),
        }
    }

    pub fn serialize(&self) -> String {
        self.lines
            .iter()
            .map(|line| match line {
                DocLine::Verbatim(raw) | DocLine::Entry { raw, .. } => raw.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn text(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(_) => Err(ConfigError::Invalid(format!("`{key}` must be a string"))),
        }
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(_) => Err(ConfigError::Invalid(format!(
                "`{key}` must be true or false"
            ))),
        }
    }

    fn number(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|number| u32::try_from(number).ok())
                .map(Some)
                .ok_or_else(|| {
                    ConfigError::Invalid(format!("`{key}` must be a positive integer"))
                }),
        }
    }
}

/// The single persisted device configuration file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Config, ConfigError> {
        let text = self.read_text()?;
        let doc = ConfigDocument::parse(&text)?;
        let config = Config::from_document(&doc)?;
        config.validate()?;
        Ok(config)
    }

    /// Materialises the template when no config exists. Never overwrites.
    /// Returns `true` when a file was written.
    pub fn ensure_template_exists(&self) -> Result<bool, ConfigError> {
        if self.path.exists() {
            return Ok(false);
        }
        write_atomically(&self.path, CONFIG_TEMPLATE.as_bytes())?;
        Ok(true)
    }

    /// Rewrites the recognised keys in place, leaving every other line
    /// untouched, and replaces the file atomically.
    pub fn persist(&self, config: &Config) -> Result<(), ConfigError> {
        let text = match self.read_text() {
            Ok(text) => text,
            Err(ConfigError::NotFound { .. }) => CONFIG_TEMPLATE.to_string(),
            Err(err) => return Err(err),
        };

        let mut doc = ConfigDocument::parse(&text)?;
        config.apply_to(&mut doc);
        write_atomically(&self.path, doc.serialize().as_bytes())?;
        Ok(())
    }

    /// Moves an unreadable config aside so the template can replace it.
    /// Returns the backup path.
    pub fn quarantine(&self) -> Result<PathBuf, ConfigError> {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".corrupt");
        let backup = self.path.with_file_name(name);
        fs::rename(&self.path, &backup)?;
        Ok(backup)
    }

    fn read_text(&self) -> Result<String, ConfigError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ConfigError::NotFound {
                path: self.path.clone(),
            }),
            // Non-UTF-8 content is as good as corrupt.
            Err(err) if err.kind() == ErrorKind::InvalidData => Err(ConfigError::Corrupt {
                line: 0,
                reason: err.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }
}

/// Timing and threshold knobs for one boot cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    pub button_hold_ms: u64,
    pub button_poll_ms: u64,
    pub power_poll_ms: u64,
    pub power_wait_limit_ms: Option<u64>,
    pub wifi_connect_timeout_ms: u64,
    pub min_free_fraction: f64,
    pub clock_epoch_year: i32,
    pub boot_activity_hz: f32,
    pub portal_activity_hz: f32,
    pub portal_domain: String,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            button_hold_ms: health::PROVISIONING_HOLD.as_millis() as u64,
            button_poll_ms: 10,
            power_poll_ms: 250,
            power_wait_limit_ms: None,
            wifi_connect_timeout_ms: 30_000,
            min_free_fraction: health::MIN_FREE_FRACTION,
            clock_epoch_year: health::CLOCK_EPOCH_YEAR,
            boot_activity_hz: 0.5,
            portal_activity_hz: 5.0,
            portal_domain: DEFAULT_PORTAL_DOMAIN.to_string(),
        }
    }
}
