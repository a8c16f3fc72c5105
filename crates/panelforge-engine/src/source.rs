//! Read-only page collections: a folder of loose images or a zip/cbz archive.
//!
//! Both backings list pages in lexicographic name order. That order is what the resume marker
//! indexes into, so it must not change between runs.

use std::fs::{self, File};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use panelforge_contracts::GalleryLocation;
use zip::ZipArchive;

pub const PAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

/// True for non-hidden file names with an accepted image extension (case-insensitive).
pub fn is_page_name(name: &str) -> bool {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    if base.is_empty() || base.starts_with('.') {
        return false;
    }
    Path::new(base)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let lowered = ext.to_ascii_lowercase();
            PAGE_EXTENSIONS.contains(&lowered.as_str())
        })
        .unwrap_or(false)
}

pub trait ImageSource {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn name(&self, index: usize) -> Option<&str>;

    /// Decoded page, or `None` when the bytes are missing or not a readable image.
    fn decode(&mut self, index: usize) -> Option<DynamicImage>;

    /// Streams the page's original bytes into `sink`, returning the byte count.
    fn copy_raw(&mut self, index: usize, sink: &mut dyn Write) -> Result<u64>;
}

pub fn open_source(location: &GalleryLocation) -> Result<Box<dyn ImageSource>> {
    match location {
        GalleryLocation::Directory { path } => Ok(Box::new(FolderSource::open(path)?)),
        GalleryLocation::Archive { path } => Ok(Box::new(ArchiveSource::open(path)?)),
    }
}

pub struct FolderSource {
    root: PathBuf,
    names: Vec<String>,
}

impl FolderSource {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let entries =
            fs::read_dir(&root).with_context(|| format!("failed listing {}", root.display()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed listing {}", root.display()))?;
            if !entry.file_type().map(|kind| kind.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                log::warn!("skipping non UTF-8 file name in {}", root.display());
                continue;
            };
            if is_page_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(Self { root, names })
    }

    fn page_path(&self, index: usize) -> Option<PathBuf> {
        self.names.get(index).map(|name| self.root.join(name))
    }
}

impl ImageSource for FolderSource {
    fn len(&self) -> usize {
        self.names.len()
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    fn decode(&mut self, index: usize) -> Option<DynamicImage> {
        let path = self.page_path(index)?;
        match image::open(&path) {
            Ok(image) => Some(image),
            Err(err) => {
                log::debug!("failed decoding {}: {err}", path.display());
                None
            }
        }
    }

    fn copy_raw(&mut self, index: usize, sink: &mut dyn Write) -> Result<u64> {
        let Some(path) = self.page_path(index) else {
            bail!("page index {index} out of range ({} pages)", self.names.len());
        };
        let mut file =
            File::open(&path).with_context(|| format!("failed opening {}", path.display()))?;
        io::copy(&mut file, sink).with_context(|| format!("failed copying {}", path.display()))
    }
}

struct ArchiveEntry {
    name: String,
    zip_index: usize,
}

/// Zip-backed source. The archive is staged into an anonymous temp file, which the OS removes
/// once this value is dropped.
pub struct ArchiveSource {
    archive: ZipArchive<File>,
    entries: Vec<ArchiveEntry>,
}

impl ArchiveSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).with_context(|| format!("failed opening {}", path.display()))?;
        Self::from_reader(file)
            .with_context(|| format!("failed reading archive {}", path.display()))
    }

    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut staged = tempfile::tempfile().context("failed creating archive staging file")?;
        io::copy(&mut reader, &mut staged).context("failed staging archive")?;
        staged.rewind()?;

        let mut archive = ZipArchive::new(staged).context("not a readable zip archive")?;
        let mut entries = Vec::new();
        for zip_index in 0..archive.len() {
            let entry = archive.by_index(zip_index)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().to_string();
            if is_page_name(&name) {
                entries.push(ArchiveEntry { name, zip_index });
            }
        }
        entries.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(Self { archive, entries })
    }
}

impl ImageSource for ArchiveSource {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn name(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(|entry| entry.name.as_str())
    }

    fn decode(&mut self, index: usize) -> Option<DynamicImage> {
        let mut bytes = Vec::new();
        if let Err(err) = self.copy_raw(index, &mut bytes) {
            log::debug!("failed reading archive page {index}: {err:#}");
            return None;
        }
        match image::load_from_memory(&bytes) {
            Ok(image) => Some(image),
            Err(err) => {
                log::debug!("failed decoding archive page {index}: {err}");
                None
            }
        }
    }

    fn copy_raw(&mut self, index: usize, sink: &mut dyn Write) -> Result<u64> {
        let Some(entry) = self.entries.get(index) else {
            bail!("page index {index} out of range ({} pages)", self.entries.len());
        };
        let mut file = self
            .archive
            .by_index(entry.zip_index)
            .with_context(|| format!("failed opening archive entry {}", entry.name))?;
        io::copy(&mut file, sink).with_context(|| format!("failed copying {}", entry.name))
    }
}
