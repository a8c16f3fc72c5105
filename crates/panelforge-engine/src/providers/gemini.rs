use image::{DynamicImage, ImageFormat};
use panelforge_contracts::ProviderConfig;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::{
    api_root, decode_base64_image, encode_image_base64, extract_image_reference,
    resolve_image_reference, response_json, send, truncate_text, ImageProvider,
};
use crate::failure::TransformFailure;

const BLOCKING_FINISH_REASONS: [&str; 5] = [
    "SAFETY",
    "PROHIBITED_CONTENT",
    "IMAGE_SAFETY",
    "BLOCKLIST",
    "SPII",
];

pub struct GeminiProvider {
    api_root: String,
    model: String,
    http: HttpClient,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig, http: HttpClient) -> Self {
        Self {
            api_root: api_root(&config.base_url),
            model: config.model.trim().to_string(),
            http,
        }
    }

    fn endpoint(&self) -> String {
        let model = self.model.strip_prefix("models/").unwrap_or(&self.model);
        format!("{}/v1beta/models/{model}:generateContent", self.api_root)
    }

    fn build_payload(instruction: &str, image_base64: String) -> Value {
        json!({
            "contents": [{
                "parts": [
                    { "text": instruction },
                    { "inlineData": { "mimeType": "image/jpeg", "data": image_base64 } },
                ]
            }],
            "generationConfig": {
                "responseModalities": ["IMAGE"],
            },
        })
    }

    fn image_from_response(&self, payload: &Value) -> Result<DynamicImage, TransformFailure> {
        match Self::parse_response(payload)? {
            GeminiOutput::InlineImage(data) => decode_base64_image(&data),
            GeminiOutput::Text(text) => match extract_image_reference(&text) {
                Some(reference) => resolve_image_reference(&self.http, reference),
                None => Err(TransformFailure::UnparseableResponse(format!(
                    "Gemini replied with text only: {}",
                    truncate_text(&text, 200)
                ))),
            },
        }
    }

    fn parse_response(payload: &Value) -> Result<GeminiOutput, TransformFailure> {
        if let Some(reason) = payload
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
        {
            return Err(TransformFailure::EmptyOrBlockedResult(format!(
                "blocked by safety filter ({reason})"
            )));
        }

        let Some(candidate) = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
        else {
            return Err(TransformFailure::EmptyOrBlockedResult(
                "Gemini returned no candidates".to_string(),
            ));
        };

        let parts = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut texts = Vec::new();
        for part in &parts {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
            if let Some(data) = inline
                .and_then(|inline| inline.get("data"))
                .and_then(Value::as_str)
                .filter(|data| !data.is_empty())
            {
                return Ok(GeminiOutput::InlineImage(data.to_string()));
            }
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                texts.push(text.to_string());
            }
        }

        if texts.is_empty() {
            let finish_reason = candidate
                .get("finishReason")
                .and_then(Value::as_str)
                .unwrap_or("UNKNOWN");
            if BLOCKING_FINISH_REASONS.contains(&finish_reason) {
                return Err(TransformFailure::EmptyOrBlockedResult(format!(
                    "blocked by safety filter ({finish_reason})"
                )));
            }
            return Err(TransformFailure::EmptyOrBlockedResult(format!(
                "Gemini returned an empty result ({finish_reason})"
            )));
        }
        Ok(GeminiOutput::Text(texts.join("\n")))
    }
}

#[derive(Debug, PartialEq)]
enum GeminiOutput {
    InlineImage(String),
    Text(String),
}

impl ImageProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn transform(
        &self,
        image: &DynamicImage,
        instruction: &str,
        api_key: &str,
    ) -> Result<DynamicImage, TransformFailure> {
        let image_base64 = encode_image_base64(image, ImageFormat::Jpeg)?;
        let payload = Self::build_payload(instruction, image_base64);
        let endpoint = self.endpoint();
        log::debug!("POST {endpoint} (model {})", self.model);
        let response = send(
            self.http
                .post(&endpoint)
                .query(&[("key", api_key)])
                .json(&payload),
        )?;
        let response_payload = response_json("Gemini", response)?;
        self.image_from_response(&response_payload)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use panelforge_contracts::{ApiFormat, OpenAiTransport};

    use super::*;
    use crate::providers::tests::{sample_image, sample_png_base64};

    fn provider(base_url: &str, model: &str) -> GeminiProvider {
        let config = ProviderConfig {
            format: ApiFormat::Gemini,
            base_url: base_url.to_string(),
            api_key: Some("key".to_string()),
            model: model.to_string(),
            openai_transport: OpenAiTransport::Chat,
            request_timeout: Duration::from_secs(5),
        };
        GeminiProvider::new(&config, HttpClient::new())
    }

    #[test]
    fn endpoint_uses_versioned_generate_content_path() {
        assert_eq!(
            provider("https://generativelanguage.googleapis.com", "gemini-x").endpoint(),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-x:generateContent"
        );
        assert_eq!(
            provider("https://proxy.example/v1beta/", "models/gemini-x").endpoint(),
            "https://proxy.example/v1beta/models/gemini-x:generateContent"
        );
    }

    #[test]
    fn payload_carries_instruction_image_and_image_modality() {
        let payload = GeminiProvider::build_payload("colorize", "AAAA".to_string());
        assert_eq!(payload["contents"][0]["parts"][0]["text"], json!("colorize"));
        assert_eq!(
            payload["contents"][0]["parts"][1]["inlineData"]["mimeType"],
            json!("image/jpeg")
        );
        assert_eq!(
            payload["contents"][0]["parts"][1]["inlineData"]["data"],
            json!("AAAA")
        );
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["IMAGE"])
        );
    }

    #[test]
    fn inline_image_is_taken_from_any_part_of_first_candidate() -> anyhow::Result<()> {
        let data = sample_png_base64(4);
        let payload = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "Here is the colorized page." },
                    { "inlineData": { "mimeType": "image/png", "data": data } },
                ]}
            }]
        });
        let image = provider("https://g", "m")
            .image_from_response(&payload)
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;
        assert_eq!(image.width(), sample_image(4).width());
        Ok(())
    }

    #[test]
    fn prompt_feedback_block_is_reported() {
        let payload = json!({ "promptFeedback": { "blockReason": "OTHER" } });
        assert_eq!(
            GeminiProvider::parse_response(&payload),
            Err(TransformFailure::EmptyOrBlockedResult(
                "blocked by safety filter (OTHER)".to_string()
            ))
        );
    }

    #[test]
    fn empty_candidates_and_safety_finish_are_empty_results() {
        assert!(matches!(
            GeminiProvider::parse_response(&json!({ "candidates": [] })),
            Err(TransformFailure::EmptyOrBlockedResult(_))
        ));
        let blocked = json!({ "candidates": [{ "finishReason": "IMAGE_SAFETY" }] });
        assert_eq!(
            GeminiProvider::parse_response(&blocked),
            Err(TransformFailure::EmptyOrBlockedResult(
                "blocked by safety filter (IMAGE_SAFETY)".to_string()
            ))
        );
    }

    #[test]
    fn text_only_reply_falls_back_to_extraction() -> anyhow::Result<()> {
        let data = sample_png_base64(8);
        let payload = json!({
            "candidates": [{
                "content": { "parts": [{ "text": format!("Done:\n{data}\n") }] }
            }]
        });
        let image = provider("https://g", "m")
            .image_from_response(&payload)
            .map_err(|failure| anyhow::anyhow!("{failure}"))?;
        assert_eq!(image.to_rgb8().get_pixel(0, 0)[0], 8);

        let prose = json!({
            "candidates": [{ "content": { "parts": [{ "text": "I cannot do that." }] } }]
        });
        assert!(matches!(
            provider("https://g", "m").image_from_response(&prose),
            Err(TransformFailure::UnparseableResponse(_))
        ));
        Ok(())
    }
}
