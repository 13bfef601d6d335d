//! Application settings.
//!
//! Read from an INI file (`setting.ini` by default) with environment
//! overrides of the form `COMFYBATCH__<SECTION>__<KEY>`. A missing default
//! file is fine; a missing file named explicitly is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use comfybatch_core::error::CoreError;
use comfybatch_core::ini::{IniDocument, IniLoader};

pub const DEFAULT_SETTINGS_FILE: &str = "setting.ini";
pub const ENV_PREFIX: &str = "COMFYBATCH";

pub const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_OLLAMA_MODEL: &str = "llama3";

#[derive(Debug, Clone, PartialEq)]
pub struct ComfyUISettings {
    pub url: String,
    /// Per-request timeout, also the upper bound on waiting for one item.
    pub timeout: Duration,
    pub retry_count: u32,
    pub poll_interval: Duration,
    /// Follow execution over WebSocket in addition to polling history.
    pub websocket: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSettings {
    pub dir: PathBuf,
    /// Write `report.json` at the end of a run.
    pub report: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OllamaSettings {
    pub enable: bool,
    pub url: String,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub comfyui: ComfyUISettings,
    pub output: OutputSettings,
    pub log_level: String,
    pub ollama: OllamaSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            comfyui: ComfyUISettings {
                url: DEFAULT_COMFYUI_URL.to_string(),
                timeout: Duration::from_secs(2700),
                retry_count: 3,
                poll_interval: Duration::from_secs(5),
                websocket: true,
            },
            output: OutputSettings {
                dir: PathBuf::from("image"),
                report: true,
            },
            log_level: "info".to_string(),
            ollama: OllamaSettings {
                enable: false,
                url: DEFAULT_OLLAMA_URL.to_string(),
                model: DEFAULT_OLLAMA_MODEL.to_string(),
                timeout: Duration::from_secs(10),
            },
        }
    }
}

impl Settings {
    /// Load settings from `path` (or [`DEFAULT_SETTINGS_FILE`]) plus the
    /// environment.
    ///
    /// | Key                       | Default                  |
    /// |---------------------------|--------------------------|
    /// | `comfyui.url`             | `http://127.0.0.1:8188`  |
    /// | `comfyui.timeout`         | `2700` (seconds)         |
    /// | `comfyui.retry_count`     | `3`                      |
    /// | `comfyui.poll_interval`   | `5` (seconds)            |
    /// | `comfyui.websocket`       | `true`                   |
    /// | `output.dir`              | `image`                  |
    /// | `output.report`           | `true`                   |
    /// | `application.log_level`   | `info`                   |
    /// | `ollama.enable`           | `false`                  |
    /// | `ollama.url`              | `http://localhost:11434` |
    /// | `ollama.model`            | `llama3`                 |
    /// | `ollama.timeout`          | `10` (seconds)           |
    ///
    /// `api.base_url` and `application.default_save_path` are accepted as
    /// older spellings of `comfyui.url` and `output.dir`.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let loader = match path {
            Some(path) => {
                if !path.is_file() {
                    return Err(CoreError::NotFound {
                        entity: "settings file",
                        id: path.display().to_string(),
                    });
                }
                IniLoader::new().file(path, true)
            }
            None => IniLoader::new().file(Path::new(DEFAULT_SETTINGS_FILE), false),
        };
        let doc = loader.env(ENV_PREFIX).load()?;
        Self::from_ini(&doc)
    }

    pub fn from_ini(doc: &IniDocument) -> Result<Self, CoreError> {
        let defaults = Self::default();

        let url = doc
            .first_of(&[("comfyui", "url"), ("api", "base_url")])
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or(defaults.comfyui.url);
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(CoreError::Config(format!(
                "[comfyui] url = '{url}' must start with http:// or https://"
            )));
        }

        let comfyui = ComfyUISettings {
            url,
            timeout: seconds(doc, "comfyui", "timeout", defaults.comfyui.timeout)?,
            retry_count: doc.parse_or("comfyui", "retry_count", defaults.comfyui.retry_count)?,
            poll_interval: seconds(
                doc,
                "comfyui",
                "poll_interval",
                defaults.comfyui.poll_interval,
            )?,
            websocket: doc.flag_or("comfyui", "websocket", defaults.comfyui.websocket)?,
        };

        let output = OutputSettings {
            dir: doc
                .first_of(&[("output", "dir"), ("application", "default_save_path")])
                .map(PathBuf::from)
                .unwrap_or(defaults.output.dir),
            report: doc.flag_or("output", "report", defaults.output.report)?,
        };

        let log_level = doc
            .first_of(&[("application", "log_level")])
            .map(str::to_lowercase)
            .unwrap_or(defaults.log_level);

        let ollama = OllamaSettings {
            enable: doc.flag_or("ollama", "enable", defaults.ollama.enable)?,
            url: doc
                .first_of(&[("ollama", "url")])
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.ollama.url),
            model: doc
                .first_of(&[("ollama", "model")])
                .map(str::to_string)
                .unwrap_or(defaults.ollama.model),
            timeout: seconds(doc, "ollama", "timeout", defaults.ollama.timeout)?,
        };

        Ok(Self {
            comfyui,
            output,
            log_level,
            ollama,
        })
    }
}

/// A positive whole number of seconds.
fn seconds(
    doc: &IniDocument,
    section: &str,
    key: &str,
    default: Duration,
) -> Result<Duration, CoreError> {
    let secs: u64 = doc.parse_or(section, key, default.as_secs())?;
    if secs == 0 {
        return Err(CoreError::Config(format!(
            "[{section}] {key} must be at least 1 second"
        )));
    }
    Ok(Duration::from_secs(secs))
}
