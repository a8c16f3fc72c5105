pub mod gallery;
pub mod journal;
pub mod library;
pub mod modes;
pub mod settings;

use std::path::Path;

use chrono::{SecondsFormat, Utc};

pub use gallery::{DerivedFrom, GalleryLocation, GalleryReference};
pub use journal::{Journal, NotificationKind, NotificationRecord, PageProgress};
pub use library::LibraryIndex;
pub use modes::{ProcessingMode, Stage, StageInput};
pub use settings::{ApiFormat, OpenAiTransport, ProviderConfig, Settings, SettingsStore};

pub(crate) fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Pretty-printed JSON written to a sibling temp file, then renamed over `path`.
pub(crate) fn write_json_atomic(path: &Path, value: &serde_json::Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state.json");
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
    std::fs::write(&temp_path, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}
