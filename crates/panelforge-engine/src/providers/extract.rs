//! Best-effort recovery of an image from a model's prose reply.
//!
//! Models routed through chat endpoints sometimes answer with markdown, a link, or a bare
//! base64 blob instead of binary image data. Response shapes drift between providers, so this is
//! a fallback path only; the patterns below will need tuning as providers change.

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageReference {
    /// Remote image that still has to be fetched.
    Url(String),
    /// Base64 payload (data URL prefix already stripped).
    Inline(String),
}

static MARKDOWN_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?(?:\s+"[^"]*")?\s*\)"#)
        .expect("markdown image regex should compile")
});

static URL_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)https?://[^\s)\]"'<>]+"#).expect("url regex should compile")
});

const IMAGE_URL_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "gif"];

static DATA_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"data:image/[A-Za-z0-9.+-]+;base64,([A-Za-z0-9+/]+={0,2})")
        .expect("data url regex should compile")
});

/// PNG, JPEG, WebP (RIFF) and GIF magic bytes as they appear once base64-encoded.
static RAW_BASE64_IMAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:iVBORw0KGgo|/9j/|UklGR|R0lGOD)[A-Za-z0-9+/]{32,}={0,2}")
        .expect("base64 image regex should compile")
});

/// Tries, in order: a markdown image link, a bare image URL, then an inline base64 blob.
pub fn extract_image_reference(text: &str) -> Option<ImageReference> {
    if let Some(target) = MARKDOWN_IMAGE
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|target| target.as_str().trim())
    {
        if let Some(reference) = reference_from_target(target) {
            return Some(reference);
        }
    }

    if let Some(url) = URL_TOKEN
        .find_iter(text)
        .find_map(|token| image_url(token.as_str()))
    {
        return Some(ImageReference::Url(url.to_string()));
    }

    if let Some(payload) = DATA_URL.captures(text).and_then(|captures| captures.get(1)) {
        return Some(ImageReference::Inline(payload.as_str().to_string()));
    }

    RAW_BASE64_IMAGE
        .find_iter(text)
        .find(|blob| is_whitespace_delimited(text, blob.start(), blob.end()))
        .map(|blob| ImageReference::Inline(blob.as_str().to_string()))
}

/// Classifies a URL-like string found in a structured response field.
pub fn reference_from_target(target: &str) -> Option<ImageReference> {
    let target = target.trim();
    if let Some(rest) = target.strip_prefix("data:") {
        let (meta, payload) = rest.split_once(',')?;
        if !meta.starts_with("image/") || payload.trim().is_empty() {
            return None;
        }
        return Some(ImageReference::Inline(payload.trim().to_string()));
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        return Some(ImageReference::Url(target.to_string()));
    }
    None
}

/// The token minus trailing sentence punctuation, if its path ends in an image file name.
fn image_url(token: &str) -> Option<&str> {
    let url = token.trim_end_matches(['.', ',', ';', ':', '!', '?']);
    let without_scheme = url.split_once("://")?.1;
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .and_then(|rest| rest.split_once('/'))
        .map(|(_host, path)| path)?;
    let file_name = path.rsplit('/').next()?;
    let (stem, extension) = file_name.rsplit_once('.')?;
    let known = IMAGE_URL_EXTENSIONS
        .iter()
        .any(|known| known.eq_ignore_ascii_case(extension));
    (known && !stem.is_empty()).then_some(url)
}

/// A blob glued to other non-whitespace text is more likely prose or a token than an image.
fn is_whitespace_delimited(text: &str, start: usize, end: usize) -> bool {
    let before_ok = text[..start]
        .chars()
        .next_back()
        .map(|ch| ch.is_whitespace() || matches!(ch, '"' | '\'' | '`' | '(' | ':'))
        .unwrap_or(true);
    let after_ok = text[end..]
        .chars()
        .next()
        .map(|ch| ch.is_whitespace() || matches!(ch, '"' | '\'' | '`' | ')' | '.' | ','))
        .unwrap_or(true);
    before_ok && after_ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::tests::sample_png_base64;

    #[test]
    fn markdown_link_wins_over_other_patterns() {
        let text = "Here you go: ![colored page](https://cdn.example/out/42.png \"page\") \
                    and also https://cdn.example/other.jpg";
        assert_eq!(
            extract_image_reference(text),
            Some(ImageReference::Url("https://cdn.example/out/42.png".to_string()))
        );
    }

    #[test]
    fn markdown_data_url_is_inline() {
        let payload = sample_png_base64(3);
        let text = format!("![result](data:image/png;base64,{payload})");
        assert_eq!(
            extract_image_reference(&text),
            Some(ImageReference::Inline(payload))
        );
    }

    #[test]
    fn bare_image_url_is_found_case_insensitively() {
        let text = "The translated page is at https://files.example/a/b/page.JPEG?sig=abc ok";
        assert_eq!(
            extract_image_reference(text),
            Some(ImageReference::Url(
                "https://files.example/a/b/page.JPEG?sig=abc".to_string()
            ))
        );
    }

    #[test]
    fn links_without_image_extension_are_ignored() {
        assert_eq!(
            extract_image_reference("See https://example.com/docs for details."),
            None
        );
    }

    #[test]
    fn image_extension_must_end_the_url_path() {
        assert_eq!(
            extract_image_reference("Rendered page: https://cdn.png-renders.example.com/out/42"),
            None
        );
        assert_eq!(
            extract_image_reference("Mirror at https://img.jpg.example/gallery/index.html today"),
            None
        );
        assert_eq!(extract_image_reference("Host only: https://cdn.png"), None);
    }

    #[test]
    fn first_image_url_is_taken_without_trailing_punctuation() {
        let text = "Docs: https://example.com/help. Result: https://cdn.example/p/7.webp#frag.";
        assert_eq!(
            extract_image_reference(text),
            Some(ImageReference::Url(
                "https://cdn.example/p/7.webp#frag".to_string()
            ))
        );
    }

    #[test]
    fn raw_base64_blob_with_magic_prefix_is_found() {
        let payload = sample_png_base64(5);
        assert!(payload.starts_with("iVBORw0KGgo"));
        let text = format!("Sure! Here is the image:\n{payload}\nEnjoy.");
        assert_eq!(
            extract_image_reference(&text),
            Some(ImageReference::Inline(payload))
        );
    }

    #[test]
    fn base64_embedded_in_a_word_is_ignored() {
        let payload = sample_png_base64(5);
        let text = format!("token=abc{payload}xyz");
        assert_eq!(extract_image_reference(&text), None);
    }

    #[test]
    fn plain_prose_yields_nothing() {
        assert_eq!(
            extract_image_reference("I'm sorry, I can't help with that request."),
            None
        );
    }

    #[test]
    fn structured_targets_are_classified() {
        assert_eq!(
            reference_from_target("data:image/webp;base64,UklGRabc"),
            Some(ImageReference::Inline("UklGRabc".to_string()))
        );
        assert_eq!(
            reference_from_target(" https://x.example/img "),
            Some(ImageReference::Url("https://x.example/img".to_string()))
        );
        assert_eq!(reference_from_target("data:text/plain;base64,aGk="), None);
        assert_eq!(reference_from_target("ftp://x"), None);
    }
}
