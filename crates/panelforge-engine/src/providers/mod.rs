pub mod extract;
pub mod gemini;
pub mod openai;

use std::io::Cursor;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{DynamicImage, ImageFormat};
use panelforge_contracts::{ApiFormat, ProviderConfig};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::failure::TransformFailure;
pub use extract::{extract_image_reference, ImageReference};
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// Anything that can turn one page into its transformed version.
///
/// The pipeline only depends on this seam; tests substitute scripted implementations.
pub trait PageTransformer: Send + Sync {
    fn transform(
        &self,
        image: &DynamicImage,
        instruction: &str,
    ) -> Result<DynamicImage, TransformFailure>;
}

/// One wire-format dialect.
pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn transform(
        &self,
        image: &DynamicImage,
        instruction: &str,
        api_key: &str,
    ) -> Result<DynamicImage, TransformFailure>;
}

/// Provider selected by configuration, with the credential check in front of it.
pub struct AiTransformClient {
    api_key: Option<String>,
    provider: Box<dyn ImageProvider>,
}

impl AiTransformClient {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let http = build_http_client(config.request_timeout)?;
        let provider: Box<dyn ImageProvider> = match config.format {
            ApiFormat::Gemini => Box::new(GeminiProvider::new(config, http)),
            ApiFormat::OpenAi => Box::new(OpenAiProvider::new(config, http)),
        };
        Ok(Self {
            api_key: config
                .api_key
                .as_deref()
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            provider,
        })
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }
}

impl PageTransformer for AiTransformClient {
    fn transform(
        &self,
        image: &DynamicImage,
        instruction: &str,
    ) -> Result<DynamicImage, TransformFailure> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(TransformFailure::MissingCredential);
        };
        self.provider.transform(image, instruction, api_key)
    }
}

pub fn build_http_client(timeout: Duration) -> anyhow::Result<HttpClient> {
    Ok(HttpClient::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(20))
        .build()?)
}

/// Strips a trailing API version segment so endpoint paths can add their own.
pub(crate) fn api_root(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    for suffix in ["/v1beta", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

pub(crate) fn send(
    request: reqwest::blocking::RequestBuilder,
) -> Result<HttpResponse, TransformFailure> {
    request
        .send()
        .map_err(|err| TransformFailure::from_reqwest(&err))
}

/// Reads the body, classifies non-success statuses, and parses JSON.
pub(crate) fn response_json(
    provider: &str,
    response: HttpResponse,
) -> Result<Value, TransformFailure> {
    let status = response.status();
    let body = response
        .text()
        .map_err(|err| TransformFailure::from_reqwest(&err))?;
    if !status.is_success() {
        let message = provider_error_message(&body);
        log::debug!("{provider} returned {}: {message}", status.as_u16());
        return Err(TransformFailure::from_status(status.as_u16(), message));
    }
    serde_json::from_str(&body).map_err(|err| {
        TransformFailure::UnparseableResponse(format!(
            "{provider} returned invalid JSON ({err}): {}",
            truncate_text(&body, 200)
        ))
    })
}

/// Prefers the provider's `error.message` over the raw body.
pub(crate) fn provider_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<Value>(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });
    truncate_text(message.as_deref().unwrap_or(body), 512)
}

pub(crate) fn encode_image(
    image: &DynamicImage,
    format: ImageFormat,
) -> Result<Vec<u8>, TransformFailure> {
    let encodable = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8()),
        _ => image.clone(),
    };
    let mut bytes = Cursor::new(Vec::new());
    encodable
        .write_to(&mut bytes, format)
        .map_err(|err| TransformFailure::ImageDecodeFailure(format!("page encode failed: {err}")))?;
    Ok(bytes.into_inner())
}

pub(crate) fn encode_image_base64(
    image: &DynamicImage,
    format: ImageFormat,
) -> Result<String, TransformFailure> {
    Ok(BASE64.encode(encode_image(image, format)?))
}

pub(crate) fn decode_image_bytes(bytes: &[u8]) -> Result<DynamicImage, TransformFailure> {
    image::load_from_memory(bytes)
        .map_err(|err| TransformFailure::ImageDecodeFailure(err.to_string()))
}

pub(crate) fn decode_base64_image(data: &str) -> Result<DynamicImage, TransformFailure> {
    let compact: String = data.chars().filter(|ch| !ch.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|err| TransformFailure::ImageDecodeFailure(format!("invalid base64: {err}")))?;
    decode_image_bytes(&bytes)
}

/// Turns an extracted reference into pixels, fetching remote URLs with `http`.
pub(crate) fn resolve_image_reference(
    http: &HttpClient,
    reference: ImageReference,
) -> Result<DynamicImage, TransformFailure> {
    match reference {
        ImageReference::Inline(data) => decode_base64_image(&data),
        ImageReference::Url(url) => download_image(http, &url),
    }
}

pub(crate) fn download_image(
    http: &HttpClient,
    url: &str,
) -> Result<DynamicImage, TransformFailure> {
    log::debug!("fetching generated image {url}");
    let response = send(http.get(url))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(TransformFailure::from_status(
            status.as_u16(),
            format!("image download failed: {}", truncate_text(&body, 256)),
        ));
    }
    let bytes = response
        .bytes()
        .map_err(|err| TransformFailure::from_reqwest(&err))?;
    decode_image_bytes(&bytes)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{Rgb, RgbImage};
    use panelforge_contracts::Settings;

    use super::*;

    pub(crate) fn sample_image(shade: u8) -> DynamicImage {
        let mut image = RgbImage::new(2, 2);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([shade, shade, 0]);
        }
        DynamicImage::ImageRgb8(image)
    }

    pub(crate) fn sample_png_base64(shade: u8) -> String {
        encode_image_base64(&sample_image(shade), ImageFormat::Png).unwrap_or_default()
    }

    #[test]
    fn missing_credential_fails_before_any_request() -> anyhow::Result<()> {
        let mut config = Settings::default().provider_config();
        config.base_url = "http://127.0.0.1:1".to_string();
        config.api_key = Some("   ".to_string());
        let client = AiTransformClient::new(&config)?;
        assert_eq!(client.provider_name(), "gemini");
        assert!(matches!(
            client.transform(&sample_image(1), "colorize"),
            Err(TransformFailure::MissingCredential)
        ));
        Ok(())
    }

    #[test]
    fn unreachable_endpoint_is_not_retryable() -> anyhow::Result<()> {
        let settings = Settings {
            api_format: panelforge_contracts::ApiFormat::OpenAi,
            api_base: Some("http://127.0.0.1:1".to_string()),
            api_key: Some("sk-test".to_string()),
            ..Settings::default()
        };
        let http = HttpClient::builder().no_proxy().build()?;
        let provider = OpenAiProvider::new(&settings.provider_config(), http);
        let failure = provider
            .transform(&sample_image(1), "colorize", "sk-test")
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected a failure"))?;
        assert!(
            matches!(failure, TransformFailure::NetworkUnreachable(_)),
            "unexpected failure: {failure:?}"
        );
        assert!(!failure.is_retryable());
        Ok(())
    }

    #[test]
    fn api_root_drops_version_segments() {
        assert_eq!(api_root("https://host/"), "https://host");
        assert_eq!(api_root("https://host/v1"), "https://host");
        assert_eq!(api_root("https://host/v1beta/"), "https://host");
        assert_eq!(api_root("https://host/proxy"), "https://host/proxy");
    }

    #[test]
    fn error_message_prefers_provider_json() {
        assert_eq!(
            provider_error_message(r#"{"error":{"message":"API key not valid"}}"#),
            "API key not valid"
        );
        assert_eq!(provider_error_message("plain body"), "plain body");
    }

    #[test]
    fn base64_images_decode_and_garbage_is_a_decode_failure() -> anyhow::Result<()> {
        let decoded = decode_base64_image(&sample_png_base64(9))
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;
        assert_eq!(decoded.to_rgb8().get_pixel(0, 0), &Rgb([9, 9, 0]));

        assert!(matches!(
            decode_base64_image("!!!"),
            Err(TransformFailure::ImageDecodeFailure(_))
        ));
        assert!(matches!(
            decode_image_bytes(b"definitely not an image"),
            Err(TransformFailure::ImageDecodeFailure(_))
        ));
        Ok(())
    }
}
