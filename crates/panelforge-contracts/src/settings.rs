use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::modes::ProcessingMode;

pub const API_KEY_ENV: &str = "PANELFORGE_API_KEY";

pub const GEMINI_DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";
pub const GEMINI_DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const OPENAI_DEFAULT_BASE: &str = "https://api.openai.com";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-image-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiFormat {
    #[default]
    Gemini,
    OpenAi,
}

impl ApiFormat {
    pub fn name(self) -> &'static str {
        match self {
            ApiFormat::Gemini => "gemini",
            ApiFormat::OpenAi => "openai",
        }
    }

    pub fn default_base(self) -> &'static str {
        match self {
            ApiFormat::Gemini => GEMINI_DEFAULT_BASE,
            ApiFormat::OpenAi => OPENAI_DEFAULT_BASE,
        }
    }

    pub fn default_model(self) -> &'static str {
        match self {
            ApiFormat::Gemini => GEMINI_DEFAULT_MODEL,
            ApiFormat::OpenAi => OPENAI_DEFAULT_MODEL,
        }
    }
}

impl fmt::Display for ApiFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ApiFormat {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => Ok(ApiFormat::Gemini),
            "openai" | "openai-compatible" => Ok(ApiFormat::OpenAi),
            other => anyhow::bail!("unknown api format '{other}' (expected gemini or openai)"),
        }
    }
}

/// Which OpenAI-compatible endpoint carries the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenAiTransport {
    Edits,
    Chat,
}

impl OpenAiTransport {
    /// Image-native models go through `/images/edits`; everything else through chat.
    pub fn for_model(model: &str) -> Self {
        let lowered = model.trim().to_ascii_lowercase();
        if lowered.starts_with("gpt-image") || lowered.starts_with("dall-e") {
            OpenAiTransport::Edits
        } else {
            OpenAiTransport::Chat
        }
    }
}

impl FromStr for OpenAiTransport {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "edits" | "edit" => Ok(OpenAiTransport::Edits),
            "chat" => Ok(OpenAiTransport::Chat),
            other => anyhow::bail!("unknown openai transport '{other}' (expected edits or chat)"),
        }
    }
}

/// Resolved provider parameters with per-format defaults applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub format: ApiFormat,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub openai_transport: OpenAiTransport,
    pub request_timeout: Duration,
}

impl ProviderConfig {
    pub fn has_credential(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    /// Notification channel for this provider.
    pub fn channel(&self) -> String {
        format!("ai-{}", self.format.name())
    }
}

fn default_request_delay_ms() -> u64 {
    1000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_request_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api_format: ApiFormat,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub openai_transport: Option<OpenAiTransport>,
    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub output_root: Option<PathBuf>,
    #[serde(default)]
    pub pending_tasks: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_format: ApiFormat::default(),
            api_base: None,
            api_key: None,
            model: None,
            openai_transport: None,
            request_delay_ms: default_request_delay_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            request_timeout_secs: default_request_timeout_secs(),
            output_root: None,
            pending_tasks: Vec::new(),
        }
    }
}

impl Settings {
    pub fn provider_config(&self) -> ProviderConfig {
        let format = self.api_format;
        let model = non_empty(self.model.as_deref())
            .unwrap_or(format.default_model())
            .to_string();
        ProviderConfig {
            format,
            base_url: non_empty(self.api_base.as_deref())
                .unwrap_or(format.default_base())
                .trim_end_matches('/')
                .to_string(),
            api_key: non_empty(self.api_key.as_deref())
                .map(str::to_string)
                .or_else(|| {
                    std::env::var(API_KEY_ENV)
                        .ok()
                        .filter(|value| !value.trim().is_empty())
                }),
            openai_transport: self
                .openai_transport
                .unwrap_or_else(|| OpenAiTransport::for_model(&model)),
            model,
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    /// Pending tasks decoded from their `"<id>:<ModeName>"` form; malformed entries are skipped.
    pub fn pending(&self) -> BTreeMap<u64, ProcessingMode> {
        self.pending_tasks
            .iter()
            .filter_map(|raw| {
                let parsed = parse_pending_entry(raw);
                if parsed.is_none() {
                    log::warn!("ignoring malformed pending task entry '{raw}'");
                }
                parsed
            })
            .collect()
    }

    fn set_pending(&mut self, pending: &BTreeMap<u64, ProcessingMode>) {
        self.pending_tasks = pending
            .iter()
            .map(|(id, mode)| format_pending_entry(*id, *mode))
            .collect();
    }
}

pub fn format_pending_entry(id: u64, mode: ProcessingMode) -> String {
    format!("{id}:{}", mode.name())
}

pub fn parse_pending_entry(raw: &str) -> Option<(u64, ProcessingMode)> {
    let (id, mode) = raw.trim().split_once(':')?;
    let id = id.trim().parse::<u64>().ok()?;
    let mode = mode.parse::<ProcessingMode>().ok()?;
    Some((id, mode))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

/// `settings.json` persisted under the home directory.
///
/// Clones share one lock, so read-modify-write updates from the coordinator and its worker
/// thread never interleave.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Settings> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Settings::default())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", self.path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("settings file {} is not valid JSON", self.path.display()))
    }

    pub fn save(&self, settings: &Settings) -> anyhow::Result<()> {
        let _guard = self.guard()?;
        self.write(settings)
    }

    pub fn update(&self, apply: impl FnOnce(&mut Settings)) -> anyhow::Result<Settings> {
        let _guard = self.guard()?;
        let mut settings = self.load()?;
        apply(&mut settings);
        self.write(&settings)?;
        Ok(settings)
    }

    pub fn pending(&self) -> anyhow::Result<BTreeMap<u64, ProcessingMode>> {
        Ok(self.load()?.pending())
    }

    pub fn add_pending(&self, id: u64, mode: ProcessingMode) -> anyhow::Result<()> {
        self.update(|settings| {
            let mut pending = settings.pending();
            pending.insert(id, mode);
            settings.set_pending(&pending);
        })?;
        Ok(())
    }

    /// Returns the mode that was pending for `id`, if any.
    pub fn remove_pending(&self, id: u64) -> anyhow::Result<Option<ProcessingMode>> {
        let mut removed = None;
        self.update(|settings| {
            let mut pending = settings.pending();
            removed = pending.remove(&id);
            settings.set_pending(&pending);
        })?;
        Ok(removed)
    }

    fn guard(&self) -> anyhow::Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow::anyhow!("settings lock poisoned"))
    }

    fn write(&self, settings: &Settings) -> anyhow::Result<()> {
        crate::write_json_atomic(&self.path, &serde_json::to_value(settings)?)
    }
}
