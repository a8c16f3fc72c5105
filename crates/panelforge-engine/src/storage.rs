use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat};

use crate::source::is_page_name;

pub const RESUME_MARKER_FILE: &str = ".ai_progress";

const TITLE_MAX_CHARS: usize = 120;
const FALLBACK_EXTENSION: &str = "jpg";
const MIN_INDEX_WIDTH: usize = 4;

/// Directory-name-safe version of a gallery title.
pub fn sanitize_title(title: &str) -> String {
    let mut cleaned = String::with_capacity(title.len());
    for ch in title.chars() {
        if ch.is_control() {
            continue;
        }
        if matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            cleaned.push('_');
        } else {
            cleaned.push(ch);
        }
    }
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|ch: char| ch == '.' || ch.is_whitespace());
    let truncated: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    let truncated = truncated.trim_end().to_string();
    if truncated.is_empty() {
        "untitled".to_string()
    } else {
        truncated
    }
}

/// Name of the target directory for a stage applied to a gallery title.
pub fn stage_directory_name(suffix: &str, title: &str) -> String {
    format!("{suffix} {}", sanitize_title(title))
}

/// Storage-safe page file name, or `image_<index>.<ext>` when nothing usable remains.
pub fn sanitize_page_name(raw: &str, index: usize) -> String {
    let mut cleaned = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_control() {
            continue;
        }
        if matches!(ch, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') {
            cleaned.push('_');
        } else {
            cleaned.push(ch);
        }
    }
    let (stem, ext) = match cleaned.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext.trim().to_ascii_lowercase()),
        None => (cleaned.as_str(), String::new()),
    };
    let stem = stem.trim().trim_start_matches('.').trim_start();
    let ext = if is_page_name(&format!("page.{ext}")) {
        ext
    } else {
        FALLBACK_EXTENSION.to_string()
    };
    if stem.is_empty() {
        return format!("image_{index}.{ext}");
    }
    format!("{stem}.{ext}")
}

/// Names the copies of a source's pages so that sorting the copies reproduces source order.
///
/// Every name starts with the zero-padded source index, which also keeps two pages whose
/// sanitized names coincide apart.
#[derive(Debug, Clone, Copy)]
pub struct PageNamer {
    width: usize,
}

impl PageNamer {
    pub fn for_pages(total: usize) -> Self {
        let digits = total.saturating_sub(1).to_string().len();
        Self {
            width: digits.max(MIN_INDEX_WIDTH),
        }
    }

    pub fn assign(&self, raw: &str, index: usize) -> String {
        format!(
            "{index:0width$}_{}",
            sanitize_page_name(raw, index),
            width = self.width
        )
    }
}

/// Sorted page files of a stage directory; hidden files (the marker, temp writes) excluded.
pub fn list_pages(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut pages = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_page_name(name) {
            pages.push(entry.path());
        }
    }
    pages.sort_by(|left, right| left.file_name().cmp(&right.file_name()));
    Ok(pages)
}

/// A name from an earlier run is corrupt if it kept raw control characters.
fn is_corrupt_name(name: &str) -> bool {
    name.chars().any(char::is_control)
}

fn fuzzy_key(name: &str) -> String {
    name.chars()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Finds a reusable directory for `expected_name` under `root`, or creates it.
pub fn resolve_target_dir(root: &Path, expected_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(root)?;
    let exact = root.join(expected_name);
    if exact.is_dir() {
        return Ok(exact);
    }

    let wanted = fuzzy_key(expected_name);
    let mut candidates = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if fuzzy_key(&name) != wanted {
            continue;
        }
        if is_corrupt_name(&name) {
            log::warn!("ignoring corrupt stage directory name {name:?}");
            continue;
        }
        candidates.push(entry.path());
    }
    candidates.sort();
    if let Some(found) = candidates.into_iter().next() {
        log::debug!("reusing stage directory {}", found.display());
        return Ok(found);
    }

    fs::create_dir_all(&exact)?;
    Ok(exact)
}

/// Hidden file holding the index of the next unprocessed page.
#[derive(Debug, Clone)]
pub struct ResumeMarker {
    path: PathBuf,
}

impl ResumeMarker {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(RESUME_MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when absent or unparsable.
    pub fn read(&self) -> Option<usize> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match raw.trim().parse::<usize>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("unparsable resume marker {}: {raw:?}", self.path.display());
                None
            }
        }
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn write(&self, next_index: usize) -> io::Result<()> {
        let temp = self.path.with_file_name(format!("{RESUME_MARKER_FILE}.tmp"));
        fs::write(&temp, next_index.to_string())?;
        fs::rename(&temp, &self.path)
    }

    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Encodes `image` in the format implied by `path`'s extension and replaces the file.
pub fn write_page(path: &Path, image: &DynamicImage) -> io::Result<()> {
    let format = ImageFormat::from_path(path).unwrap_or(ImageFormat::Jpeg);
    let encodable = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        ImageFormat::WebP => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => image.clone(),
    };
    let mut bytes = Cursor::new(Vec::new());
    encodable
        .write_to(&mut bytes, format)
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("page");
    let temp = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&temp, bytes.into_inner())?;
    fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use image::{Rgb, RgbImage};

    use super::*;

    #[test]
    fn titles_are_sanitized_for_directory_names() {
        assert_eq!(sanitize_title("Moon: Harbor / Vol.1"), "Moon_ Harbor _ Vol.1");
        assert_eq!(sanitize_title("a\u{0007}b   c"), "ab c");
        assert_eq!(sanitize_title("  ...  "), "untitled");
        assert_eq!(sanitize_title(&"x".repeat(300)).chars().count(), 120);
        assert_eq!(
            stage_directory_name("[AI-Color]", "Moon"),
            "[AI-Color] Moon"
        );
    }

    #[test]
    fn page_names_fall_back_when_nothing_usable_remains() {
        assert_eq!(sanitize_page_name("001.JPG", 0), "001.jpg");
        assert_eq!(sanitize_page_name("ch1/002.png", 1), "ch1_002.png");
        assert_eq!(sanitize_page_name("p\u{0001}\u{0002}3.webp", 2), "p3.webp");
        assert_eq!(sanitize_page_name("\u{0001}\u{0002}.png", 4), "image_4.png");
        assert_eq!(sanitize_page_name("", 5), "image_5.jpg");
        assert_eq!(sanitize_page_name("page.gif", 6), "page.jpg");
    }

    #[test]
    fn namer_prefixes_the_source_index() {
        let namer = PageNamer::for_pages(3);
        assert_eq!(namer.assign("a\u{0001}.png", 0), "0000_a.png");
        assert_eq!(namer.assign("a.png", 1), "0001_a.png");
        assert_eq!(namer.assign("", 2), "0002_image_2.jpg");

        let wide = PageNamer::for_pages(12_000);
        assert_eq!(wide.assign("x.png", 7), "00007_x.png");
    }

    #[test]
    fn namer_keeps_nested_entries_in_source_order() {
        let namer = PageNamer::for_pages(4);
        let source = ["ch1/001.png", "ch1/002.png", "ch10/001.png", "ch2/001.png"];
        let names: Vec<String> = source
            .iter()
            .enumerate()
            .map(|(index, raw)| namer.assign(raw, index))
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(sorted, names);
        assert_eq!(names[2], "0002_ch10_001.png");
    }

    #[test]
    fn resolve_reuses_exact_and_fuzzy_matches() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path();

        let created = resolve_target_dir(root, "[AI-Color] Moon")?;
        assert_eq!(created, root.join("[AI-Color] Moon"));
        assert_eq!(resolve_target_dir(root, "[AI-Color] Moon")?, created);

        fs::create_dir(root.join("[ai-color]   sun"))?;
        assert_eq!(
            resolve_target_dir(root, "[AI-Color] Sun")?,
            root.join("[ai-color]   sun")
        );
        Ok(())
    }

    #[test]
    fn resolve_skips_directories_with_control_characters() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path();
        let corrupt = root.join("[AI-Color] Star\u{0007}");
        fs::create_dir(&corrupt)?;

        let resolved = resolve_target_dir(root, "[AI-Color] Star")?;
        assert_eq!(resolved, root.join("[AI-Color] Star"));
        assert_ne!(resolved, corrupt);
        Ok(())
    }

    #[test]
    fn marker_defaults_and_round_trips() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let marker = ResumeMarker::in_dir(temp.path());
        assert_eq!(marker.read(), None);

        marker.write(3)?;
        assert_eq!(fs::read_to_string(marker.path())?, "3");
        assert_eq!(marker.read(), Some(3));

        fs::write(marker.path(), "three")?;
        assert_eq!(marker.read(), None);

        marker.clear()?;
        assert!(!marker.exists());
        marker.clear()?;
        Ok(())
    }

    #[test]
    fn list_pages_ignores_marker_and_temp_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        fs::write(temp.path().join("b.jpg"), b"x")?;
        fs::write(temp.path().join("a.png"), b"x")?;
        fs::write(temp.path().join(RESUME_MARKER_FILE), b"0")?;
        fs::write(temp.path().join(".a.png.tmp"), b"x")?;

        let names: Vec<String> = list_pages(temp.path())?
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a.png".to_string(), "b.jpg".to_string()]);
        Ok(())
    }

    #[test]
    fn write_page_keeps_format_of_extension() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let mut image = RgbImage::new(3, 2);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([200, 10, 10]);
        }
        let image = DynamicImage::ImageRgb8(image);

        for name in ["p.png", "p.jpg", "p.webp"] {
            let path = temp.path().join(name);
            fs::write(&path, b"original")?;
            write_page(&path, &image)?;
            let written = fs::read(&path)?;
            let expected = ImageFormat::from_path(&path)?;
            assert_eq!(image::guess_format(&written)?, expected);
            assert_eq!(image::load_from_memory(&written)?.width(), 3);
        }
        assert_eq!(list_pages(temp.path())?.len(), 3);
        Ok(())
    }
}
