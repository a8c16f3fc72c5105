use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::modes::Stage;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GalleryLocation {
    Directory { path: PathBuf },
    Archive { path: PathBuf },
}

impl GalleryLocation {
    /// Zip/cbz files are archives, anything else is treated as a page directory.
    pub fn detect(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_archive = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "zip" | "cbz"))
                .unwrap_or(false);
        if is_archive {
            GalleryLocation::Archive { path }
        } else {
            GalleryLocation::Directory { path }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            GalleryLocation::Directory { path } | GalleryLocation::Archive { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFrom {
    pub source_id: u64,
    pub stage: Stage,
}

/// Handle to a page collection plus its descriptive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GalleryReference {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub page_count: usize,
    pub location: GalleryLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<DerivedFrom>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<String>,
}

impl GalleryReference {
    pub fn new(id: u64, title: impl Into<String>, location: GalleryLocation) -> Self {
        Self {
            id,
            title: title.into(),
            tags: Vec::new(),
            page_count: 0,
            location,
            derived_from: None,
            registered_at: None,
        }
    }

    /// Metadata clone for a stage output living in `dir`.
    pub fn derive_for_stage(&self, stage: Stage, dir: &Path, page_count: usize) -> Self {
        Self {
            id: stage.derived_id(self.id),
            title: format!("{} {}", stage.suffix(), self.title),
            tags: self.tags.clone(),
            page_count,
            location: GalleryLocation::Directory {
                path: dir.to_path_buf(),
            },
            derived_from: Some(DerivedFrom {
                source_id: self.id,
                stage,
            }),
            registered_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_distinguishes_archives_from_directories() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let archive = temp.path().join("book.CBZ");
        std::fs::write(&archive, b"PK")?;

        assert!(matches!(
            GalleryLocation::detect(&archive),
            GalleryLocation::Archive { .. }
        ));
        assert!(matches!(
            GalleryLocation::detect(temp.path()),
            GalleryLocation::Directory { .. }
        ));
        Ok(())
    }

    #[test]
    fn derived_gallery_clones_metadata_with_stage_suffix() {
        let mut source = GalleryReference::new(
            12,
            "Moon Harbor",
            GalleryLocation::Directory {
                path: PathBuf::from("/library/moon"),
            },
        );
        source.tags = vec!["drama".to_string()];

        let derived = source.derive_for_stage(Stage::ColorOnly, Path::new("/out/color"), 3);
        assert_eq!(derived.id, 121);
        assert_eq!(derived.title, "[AI-Color] Moon Harbor");
        assert_eq!(derived.tags, vec!["drama".to_string()]);
        assert_eq!(derived.page_count, 3);
        assert_eq!(derived.location.path(), Path::new("/out/color"));
        assert_eq!(
            derived.derived_from,
            Some(DerivedFrom {
                source_id: 12,
                stage: Stage::ColorOnly
            })
        );
    }

    #[test]
    fn location_serializes_with_kind_tag() -> anyhow::Result<()> {
        let location = GalleryLocation::Archive {
            path: PathBuf::from("/a.zip"),
        };
        let value = serde_json::to_value(&location)?;
        assert_eq!(value["kind"], serde_json::json!("archive"));
        assert_eq!(value["path"], serde_json::json!("/a.zip"));
        Ok(())
    }
}
