//! Persisted user preferences and API key.
//!
//! Everything lives in one flat JSON object at the platform config folder
//! (`~/.config/FlatGem/settings.json` on Linux). Keys this version does not
//! know are kept on save. A known key holding a value of the wrong type falls
//! back to its own default without affecting the others.

use crate::{
    config::MAX_PROCESSING_DELAY_SECS,
    error::{Error, Result},
};
use directories::ProjectDirs;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

const APP_NAME: &str = "FlatGem";
const SETTINGS_FILE: &str = "settings.json";
const CORRUPT_SUFFIX: &str = ".corrupt";

/// Default pause between files, in seconds.
pub const DEFAULT_PROCESSING_DELAY_SECS: u64 = 10;

/// Values remembered between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preferences {
    /// System prompt text
    pub prompt_text: String,

    /// Last input folder
    pub input_path: String,

    /// Last output folder
    pub output_path: String,

    /// Output extension, empty to keep the input's
    pub output_extension: String,

    /// Pause between files, in seconds
    pub processing_delay: u64,

    /// Last selected model
    pub selected_model_name: String,

    /// Whether the thinking instruction is prepended
    pub thinking_mode: bool,

    /// Whether subfolders are processed
    pub process_subfolders: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            prompt_text: String::new(),
            input_path: String::new(),
            output_path: String::new(),
            output_extension: String::new(),
            processing_delay: DEFAULT_PROCESSING_DELAY_SECS,
            selected_model_name: String::new(),
            thinking_mode: false,
            process_subfolders: false,
        }
    }
}

impl Preferences {
    /// Pause between files, capped at [`MAX_PROCESSING_DELAY_SECS`].
    #[must_use]
    pub const fn processing_delay(&self) -> Duration {
        let secs = if self.processing_delay > MAX_PROCESSING_DELAY_SECS {
            MAX_PROCESSING_DELAY_SECS
        } else {
            self.processing_delay
        };
        Duration::from_secs(secs)
    }

    /// Takes the known keys out of `entries`, leaving the rest untouched.
    fn take_from(entries: &mut Map<String, Value>) -> Self {
        let defaults = Self::default();
        Self {
            prompt_text: take_text(entries, "prompt_text").unwrap_or(defaults.prompt_text),
            input_path: take_text(entries, "input_path").unwrap_or(defaults.input_path),
            output_path: take_text(entries, "output_path").unwrap_or(defaults.output_path),
            output_extension: take_text(entries, "output_extension")
                .unwrap_or(defaults.output_extension),
            processing_delay: take_seconds(entries, "processing_delay")
                .unwrap_or(defaults.processing_delay),
            selected_model_name: take_text(entries, "selected_model_name")
                .unwrap_or(defaults.selected_model_name),
            thinking_mode: take_flag(entries, "thinking_mode").unwrap_or(defaults.thinking_mode),
            process_subfolders: take_flag(entries, "process_subfolders")
                .unwrap_or(defaults.process_subfolders),
        }
    }
}

impl<'de> Deserialize<'de> for Preferences {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut entries = Map::deserialize(deserializer)?;
        Ok(Self::take_from(&mut entries))
    }
}

/// Full contents of the settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Settings {
    /// Stored API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Remembered preferences
    #[serde(flatten)]
    pub preferences: Preferences,

    /// Unrecognized keys, written back unchanged
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Settings {
    /// Builds settings from the raw entries of the settings file.
    #[must_use]
    pub fn from_entries(mut entries: Map<String, Value>) -> Self {
        let api_key = take_text(&mut entries, "api_key").filter(|key| !key.trim().is_empty());
        let preferences = Preferences::take_from(&mut entries);
        Self {
            api_key,
            preferences,
            extra: entries,
        }
    }
}

impl<'de> Deserialize<'de> for Settings {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Map::deserialize(deserializer).map(Self::from_entries)
    }
}

fn ignore_value(key: &str, value: &Value, expected: &str) {
    warn!("Ignoring setting '{}': expected {}, found {}", key, expected, value);
}

fn take_text(entries: &mut Map<String, Value>, key: &str) -> Option<String> {
    match entries.remove(key)? {
        Value::String(text) => Some(text),
        Value::Null => None,
        other => {
            ignore_value(key, &other, "text");
            None
        }
    }
}

fn take_flag(entries: &mut Map<String, Value>, key: &str) -> Option<bool> {
    let value = entries.remove(key)?;
    let flag = match &value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(text) => match text.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    };
    if flag.is_none() && !value.is_null() {
        ignore_value(key, &value, "true or false");
    }
    flag
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn take_seconds(entries: &mut Map<String, Value>, key: &str) -> Option<u64> {
    let value = entries.remove(key)?;
    let from_float = |secs: f64| {
        (secs.is_finite() && secs >= 0.0).then(|| secs.round().min(u64::MAX as f64) as u64)
    };
    let seconds = match &value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().and_then(from_float)),
        Value::String(text) => text.trim().parse::<f64>().ok().and_then(from_float),
        _ => None,
    };
    if seconds.is_none() && !value.is_null() {
        ignore_value(key, &value, "a number of seconds");
    }
    seconds
}

/// State of the settings file on disk.
enum Stored {
    Missing,
    Parsed(Settings),
    Corrupt(serde_json::Error),
    Unreadable(io::Error),
}

/// Reads and writes the settings file.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    /// Opens the store at the platform config folder.
    ///
    /// # Errors
    ///
    /// Returns an error if no home folder can be determined.
    pub fn open() -> Result<Self> {
        let dirs = ProjectDirs::from("", "", APP_NAME)
            .ok_or_else(|| Error::settings("Could not determine the configuration folder"))?;
        let path = dirs.config_dir().join(SETTINGS_FILE);
        debug!(path = %path.display(), "Settings path resolved");
        Ok(Self { path })
    }

    /// Opens the store at an explicit file path.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Location of the settings file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Stored {
        match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text).map_or_else(Stored::Corrupt, Stored::Parsed),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Stored::Missing,
            Err(e) => Stored::Unreadable(e),
        }
    }

    /// Loads everything. A missing, unreadable or corrupt file yields defaults.
    #[must_use]
    pub fn load_all(&self) -> Settings {
        match self.read() {
            Stored::Parsed(settings) => settings,
            Stored::Missing => {
                debug!("No settings file at {}", self.path.display());
                Settings::default()
            }
            Stored::Corrupt(e) => {
                warn!("Ignoring corrupt settings {}: {}", self.path.display(), e);
                Settings::default()
            }
            Stored::Unreadable(e) => {
                warn!("Could not read settings {}: {}", self.path.display(), e);
                Settings::default()
            }
        }
    }

    /// Loads the settings a modification starts from.
    ///
    /// A corrupt file is copied aside before it gets replaced; an unreadable
    /// one is never replaced.
    fn load_for_update(&self) -> Result<Settings> {
        match self.read() {
            Stored::Parsed(settings) => Ok(settings),
            Stored::Missing => Ok(Settings::default()),
            Stored::Corrupt(e) => {
                let kept = self.corrupt_copy_path();
                fs::copy(&self.path, &kept).map_err(|e| Error::io(&kept, e))?;
                warn!(
                    "Settings {} could not be parsed ({}); kept a copy at {}",
                    self.path.display(),
                    e,
                    kept.display()
                );
                Ok(Settings::default())
            }
            Stored::Unreadable(e) => Err(Error::io(&self.path, e)),
        }
    }

    fn corrupt_copy_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| OsString::from(SETTINGS_FILE), ToOwned::to_owned);
        name.push(CORRUPT_SUFFIX);
        self.path.with_file_name(name)
    }

    /// Replaces the settings file.
    ///
    /// # Errors
    ///
    /// Returns an error if the folder or file cannot be written.
    pub fn save_all(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, json).map_err(|e| Error::io(&self.path, e))?;
        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    /// Stores the API key, keeping the other values.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is blank or the file cannot be read or written.
    pub fn save_api_key(&self, api_key: &str) -> Result<()> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(Error::settings("API key is empty"));
        }

        let mut settings = self.load_for_update()?;
        settings.api_key = Some(api_key.to_string());
        self.save_all(&settings)?;
        info!("API key saved");
        Ok(())
    }

    /// Returns the stored API key, if any.
    #[must_use]
    pub fn load_api_key(&self) -> Option<String> {
        self.load_all().api_key
    }

    /// Removes the stored API key.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn clear_api_key(&self) -> Result<()> {
        let mut settings = self.load_for_update()?;
        if settings.api_key.take().is_none() {
            return Ok(());
        }
        self.save_all(&settings)?;
        info!("API key removed");
        Ok(())
    }

    /// Stores the preferences, keeping the key and unknown values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn save_preferences(&self, preferences: &Preferences) -> Result<()> {
        let mut settings = self.load_for_update()?;
        settings.preferences = preferences.clone();
        self.save_all(&settings)
    }

    /// Returns the stored preferences, never the key.
    #[must_use]
    pub fn load_preferences(&self) -> Preferences {
        self.load_all().preferences
    }

    /// Restores default preferences, keeping the key and unknown values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or written.
    pub fn reset_preferences(&self) -> Result<()> {
        let mut settings = self.load_for_update()?;
        settings.preferences = Preferences::default();
        self.save_all(&settings)?;
        info!("Preferences reset to defaults");
        Ok(())
    }
}
