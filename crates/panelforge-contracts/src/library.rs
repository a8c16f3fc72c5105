use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::gallery::GalleryReference;
use crate::modes::Stage;
use crate::now_utc_iso;

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    #[serde(default)]
    galleries: BTreeMap<u64, GalleryReference>,
}

/// File-backed gallery index (`library.json`).
///
/// Every call re-reads the file, so separate handles (the CLI and the coordinator's worker)
/// always see each other's registrations.
#[derive(Debug, Clone)]
pub struct LibraryIndex {
    path: PathBuf,
}

impl LibraryIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: u64) -> anyhow::Result<Option<GalleryReference>> {
        Ok(self.load()?.galleries.remove(&id))
    }

    pub fn list(&self) -> anyhow::Result<Vec<GalleryReference>> {
        Ok(self.load()?.galleries.into_values().collect())
    }

    pub fn upsert(&self, mut gallery: GalleryReference) -> anyhow::Result<GalleryReference> {
        let mut file = self.load()?;
        if gallery.registered_at.is_none() {
            gallery.registered_at = Some(now_utc_iso());
        }
        file.galleries.insert(gallery.id, gallery.clone());
        self.store(&file)?;
        Ok(gallery)
    }

    /// Registers a stage output under its derived id.
    ///
    /// Returns the stored entry and whether it was newly created; an existing entry with the
    /// same derived id short-circuits creation.
    pub fn register_stage_output(
        &self,
        source: &GalleryReference,
        stage: Stage,
        dir: &Path,
        page_count: usize,
    ) -> anyhow::Result<(GalleryReference, bool)> {
        let derived_id = stage.derived_id(source.id);
        let mut file = self.load()?;
        if let Some(existing) = file.galleries.get(&derived_id) {
            return Ok((existing.clone(), false));
        }
        let mut derived = source.derive_for_stage(stage, dir, page_count);
        derived.registered_at = Some(now_utc_iso());
        file.galleries.insert(derived_id, derived.clone());
        self.store(&file)?;
        log::info!(
            "registered {} output of gallery {} as {}",
            stage,
            source.id,
            derived_id
        );
        Ok((derived, true))
    }

    fn load(&self) -> anyhow::Result<LibraryFile> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LibraryFile::default())
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", self.path.display()))
            }
        };
        serde_json::from_str(&raw)
            .with_context(|| format!("library index {} is not valid JSON", self.path.display()))
    }

    fn store(&self, file: &LibraryFile) -> anyhow::Result<()> {
        crate::write_json_atomic(&self.path, &serde_json::to_value(file)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gallery::GalleryLocation;

    fn source_gallery() -> GalleryReference {
        GalleryReference::new(
            5,
            "Night Market",
            GalleryLocation::Directory {
                path: PathBuf::from("/library/night"),
            },
        )
    }

    #[test]
    fn upsert_then_get_round_trips_through_disk() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let library = LibraryIndex::new(temp.path().join("library.json"));

        library.upsert(source_gallery())?;
        let reloaded = LibraryIndex::new(library.path()).get(5)?;

        let gallery = reloaded.ok_or_else(|| anyhow::anyhow!("missing gallery"))?;
        assert_eq!(gallery.title, "Night Market");
        assert!(gallery.registered_at.is_some());
        Ok(())
    }

    #[test]
    fn registering_same_stage_twice_does_not_duplicate() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let library = LibraryIndex::new(temp.path().join("library.json"));
        let source = source_gallery();

        let (first, created_first) =
            library.register_stage_output(&source, Stage::ColorOnly, temp.path(), 4)?;
        let (second, created_second) =
            library.register_stage_output(&source, Stage::ColorOnly, temp.path(), 4)?;

        assert!(created_first);
        assert!(!created_second);
        assert_eq!(first.id, 51);
        assert_eq!(second.id, first.id);
        assert_eq!(library.list()?.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_file_is_an_empty_library() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let library = LibraryIndex::new(temp.path().join("absent/library.json"));
        assert!(library.list()?.is_empty());
        assert!(library.get(1)?.is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_reported() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("library.json");
        std::fs::write(&path, "{not json")?;
        assert!(LibraryIndex::new(path).list().is_err());
        Ok(())
    }
}
