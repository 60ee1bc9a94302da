//! Format-agnostic loading and dumping of hierarchical run configurations.

use serde_json::{Map, Value};
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

/// Placeholder strings that template configs ship with. A config containing
/// one of these has not been filled out by the user yet.
pub const PLACEHOLDER: &str = "[REQUIRED]";
pub const HPC_PLACEHOLDER: &str = "[REQUIRED IF ON HPC]";

/// A parsed configuration file: a mapping of string keys to arbitrary values.
pub type Config = Map<String, Value>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to write config file {0}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("Config file must have a recognized file-ending (json, json5, yaml, yml, toml): {0}")]
    UnknownFormat(PathBuf),
    #[error("Failed to parse JSON")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse JSON5")]
    Json5(#[from] json5::Error),
    #[error("Failed to parse YAML")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Failed to parse TOML")]
    TomlDe(#[from] toml::de::Error),
    #[error("Failed to serialize TOML")]
    TomlSer(#[from] toml::ser::Error),
    #[error("Config file {0} must contain a mapping at the top level")]
    NotAMapping(PathBuf),
    #[error("Key {key:?} is set to the placeholder {placeholder:?}; please fill it in")]
    Placeholder { key: String, placeholder: String },
    #[error("Key {key:?} must hold a value of type {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("Missing required key {0:?}")]
    MissingKey(String),
}

/// The supported config file formats, detected by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Json5,
    Yaml,
    Toml,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ConfigError::UnknownFormat(path.to_path_buf()))?;

        match extension.as_str() {
            "json" => Ok(Self::Json),
            "json5" => Ok(Self::Json5),
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            _ => Err(ConfigError::UnknownFormat(path.to_path_buf())),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Json5 => "json5",
            Self::Yaml => "yaml",
            Self::Toml => "toml",
        }
    }

    pub fn parse(self, text: &str) -> Result<Value, ConfigError> {
        let value = match self {
            Self::Json => serde_json::from_str(text)?,
            Self::Json5 => json5::from_str(text)?,
            Self::Yaml => serde_yaml::from_str(text)?,
            Self::Toml => toml::from_str(text)?,
        };

        Ok(value)
    }

    pub fn render(self, value: &Value) -> Result<String, ConfigError> {
        match self {
            // JSON5 output is rendered as indented JSON, which every JSON5
            // parser accepts; comments only survive in user-edited files.
            Self::Json | Self::Json5 => Ok(serde_json::to_string_pretty(value)?),
            Self::Yaml => Ok(serde_yaml::to_string(value)?),
            Self::Toml => {
                // TOML has no null literal
                let mut cleaned = value.clone();
                drop_nulls(&mut cleaned);
                Ok(toml::to_string_pretty(&cleaned)?)
            }
        }
    }
}

/// Load a config file, detecting the format from the file extension and
/// resolving any `./`-style path strings relative to the config directory.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    load_config_opts(path, true)
}

pub fn load_config_opts(path: &Path, resolve: bool) -> Result<Config, ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let text = fs::read_to_string(path)
        .map_err(|error| ConfigError::Read(path.to_path_buf(), error))?;
    let mut value = format.parse(&text)?;

    debug!(path = %path.display(), %format, "Loaded config file");

    if resolve {
        if let Some(base_dir) = path.parent() {
            resolve_paths(&mut value, base_dir);
        }
    }

    match value {
        Value::Object(mapping) => Ok(mapping),
        _ => Err(ConfigError::NotAMapping(path.to_path_buf())),
    }
}

/// Dump a config to a file, detecting the format from the file extension.
pub fn dump_config(path: &Path, config: &Value) -> Result<(), ConfigError> {
    let format = ConfigFormat::from_path(path)?;
    let text = format.render(config)?;
    fs::write(path, text).map_err(|error| ConfigError::Write(path.to_path_buf(), error))
}

/// Resolve strings that resemble relative paths (`./x`, `../x`) against
/// `base_dir`. Other strings pass through untouched, so this is safe to call
/// on an entire config tree.
pub fn resolve_paths(value: &mut Value, base_dir: &Path) {
    match value {
        Value::String(text) => {
            if let Some(stripped) = text.strip_prefix("./") {
                *text = base_dir.join(stripped).to_string_lossy().into_owned();
            } else if text.starts_with("../") {
                *text = base_dir.join(&*text).to_string_lossy().into_owned();
            }
        }
        Value::Array(items) => {
            for item in items {
                resolve_paths(item, base_dir);
            }
        }
        Value::Object(mapping) => {
            for item in mapping.values_mut() {
                resolve_paths(item, base_dir);
            }
        }
        _ => {}
    }
}

/// Reject configs that still carry template placeholders. `on_hpc` controls
/// whether the HPC-only placeholder is an error or allowed to pass.
pub fn reject_placeholders(config: &Config, on_hpc: bool) -> Result<(), ConfigError> {
    for (key, value) in config {
        check_placeholder(key, value, on_hpc)?;
    }
    Ok(())
}

fn check_placeholder(key: &str, value: &Value, on_hpc: bool) -> Result<(), ConfigError> {
    match value {
        Value::String(text) => {
            if text == PLACEHOLDER || (on_hpc && text == HPC_PLACEHOLDER) {
                return Err(ConfigError::Placeholder {
                    key: key.to_owned(),
                    placeholder: text.clone(),
                });
            }
        }
        Value::Array(items) => {
            for item in items {
                check_placeholder(key, item, on_hpc)?;
            }
        }
        Value::Object(mapping) => {
            for (sub_key, sub_value) in mapping {
                check_placeholder(sub_key, sub_value, on_hpc)?;
            }
        }
        _ => {}
    }

    Ok(())
}

/// Merge `new` into `existing`, recursing into nested mappings so that
/// sibling keys written by different jobs survive side by side.
pub fn merge_values(existing: &mut Value, new: &Value) {
    match (existing, new) {
        (Value::Object(existing_map), Value::Object(new_map)) => {
            for (key, new_value) in new_map {
                match existing_map.get_mut(key) {
                    Some(existing_value) if existing_value.is_object() && new_value.is_object() => {
                        merge_values(existing_value, new_value);
                    }
                    _ => {
                        existing_map.insert(key.clone(), new_value.clone());
                    }
                }
            }
        }
        (existing, new) => *existing = new.clone(),
    }
}

fn drop_nulls(value: &mut Value) {
    match value {
        Value::Object(mapping) => {
            mapping.retain(|_, entry| !entry.is_null());
            for entry in mapping.values_mut() {
                drop_nulls(entry);
            }
        }
        Value::Array(items) => {
            for item in items {
                drop_nulls(item);
            }
        }
        _ => {}
    }
}

/// Typed accessor for a required string key.
pub fn require_str<'a>(config: &'a Config, key: &str) -> Result<&'a str, ConfigError> {
    config
        .get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))?
        .as_str()
        .ok_or(ConfigError::WrongType {
            key: key.to_owned(),
            expected: "string",
        })
}

/// Typed accessor for a required sequence key.
pub fn require_seq<'a>(config: &'a Config, key: &str) -> Result<&'a Vec<Value>, ConfigError> {
    config
        .get(key)
        .ok_or_else(|| ConfigError::MissingKey(key.to_owned()))?
        .as_array()
        .ok_or(ConfigError::WrongType {
            key: key.to_owned(),
            expected: "sequence",
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_detection() {
        for (name, expected) in [
            ("config.json", ConfigFormat::Json),
            ("config.JSON", ConfigFormat::Json),
            ("config.json5", ConfigFormat::Json5),
            ("config.yaml", ConfigFormat::Yaml),
            ("config.yml", ConfigFormat::Yaml),
            ("config.toml", ConfigFormat::Toml),
        ] {
            assert_eq!(ConfigFormat::from_path(Path::new(name)).unwrap(), expected);
        }

        assert!(ConfigFormat::from_path(Path::new("config.ini")).is_err());
        assert!(ConfigFormat::from_path(Path::new("config")).is_err());
    }

    #[test]
    fn round_trip_all_formats() {
        let config = json!({
            "execution_control": {"option": "local", "max_workers": 2},
            "years": [2007, 2008],
            "threshold": 0.25,
            "name": "study"
        });

        for format in [
            ConfigFormat::Json,
            ConfigFormat::Json5,
            ConfigFormat::Yaml,
            ConfigFormat::Toml,
        ] {
            let text = format.render(&config).unwrap();
            let reparsed = format.parse(&text).unwrap();
            assert_eq!(reparsed, config, "round trip failed for {format}");
        }
    }

    #[test]
    fn json5_comments_are_accepted() {
        let text = "{\n  // run locally\n  option: \"local\",\n}";
        let value = ConfigFormat::Json5.parse(text).unwrap();
        assert_eq!(value["option"], "local");
    }

    #[test]
    fn placeholders_are_rejected() {
        let config = json!({
            "execution_control": {"allocation": "[REQUIRED IF ON HPC]"},
            "project_points": "[REQUIRED]"
        });
        let Value::Object(config) = config else {
            unreachable!()
        };

        let err = reject_placeholders(&config, false).unwrap_err();
        assert!(err.to_string().contains("project_points"));

        let mut filled = config.clone();
        filled.insert("project_points".into(), json!([0, 1]));
        assert!(reject_placeholders(&filled, false).is_ok());

        let err = reject_placeholders(&filled, true).unwrap_err();
        assert!(err.to_string().contains("allocation"));
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let mut value = json!({
            "project_points": "./points.csv",
            "notes": "plain strings pass through",
            "nested": {"fp": "../other/points.csv"}
        });
        resolve_paths(&mut value, Path::new("/projects/run"));
        assert_eq!(value["project_points"], "/projects/run/points.csv");
        assert_eq!(value["nested"]["fp"], "/projects/run/../other/points.csv");
        assert_eq!(value["notes"], "plain strings pass through");
    }

    #[test]
    fn merge_is_recursive_and_preserves_siblings() {
        let mut existing = json!({"step": {"job_a": {"job_status": "successful"}}});
        let new = json!({"step": {"job_b": {"job_status": "failed"}}});
        merge_values(&mut existing, &new);

        assert_eq!(existing["step"]["job_a"]["job_status"], "successful");
        assert_eq!(existing["step"]["job_b"]["job_status"], "failed");
    }
}
