use image::{DynamicImage, ImageFormat};
use panelforge_contracts::{OpenAiTransport, ProviderConfig};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

use super::extract::reference_from_target;
use super::{
    api_root, decode_base64_image, download_image, encode_image, encode_image_base64,
    extract_image_reference, resolve_image_reference, response_json, send, truncate_text,
    ImageProvider, ImageReference,
};
use crate::failure::TransformFailure;

/// OpenAI-compatible endpoints: `/v1/images/edits` for image models, `/v1/chat/completions`
/// for multimodal chat models served behind the same API shape.
pub struct OpenAiProvider {
    api_root: String,
    model: String,
    transport: OpenAiTransport,
    http: HttpClient,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig, http: HttpClient) -> Self {
        Self {
            api_root: api_root(&config.base_url),
            model: config.model.trim().to_string(),
            transport: config.openai_transport,
            http,
        }
    }

    pub fn transport(&self) -> OpenAiTransport {
        self.transport
    }

    fn edits_endpoint(&self) -> String {
        format!("{}/v1/images/edits", self.api_root)
    }

    fn chat_endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.api_root)
    }

    fn transform_via_edits(
        &self,
        image: &DynamicImage,
        instruction: &str,
        api_key: &str,
    ) -> Result<DynamicImage, TransformFailure> {
        let bytes = encode_image(image, ImageFormat::Png)?;
        let part = MultipartPart::bytes(bytes)
            .file_name("page.png")
            .mime_str("image/png")
            .map_err(|err| TransformFailure::TransportInterrupted(err.to_string()))?;
        let mut form = MultipartForm::new()
            .text("model", self.model.clone())
            .text("prompt", instruction.to_string())
            .text("n", "1")
            .part("image", part);
        // gpt-image models always answer with b64_json and reject the field.
        if self.model.to_ascii_lowercase().starts_with("dall-e") {
            form = form.text("response_format", "b64_json");
        }

        let endpoint = self.edits_endpoint();
        log::debug!("POST {endpoint} (model {})", self.model);
        let response = send(self.http.post(&endpoint).bearer_auth(api_key).multipart(form))?;
        let payload = response_json("OpenAI edits", response)?;
        match edits_image_reference(&payload)? {
            ImageReference::Inline(data) => decode_base64_image(&data),
            ImageReference::Url(url) => download_image(&self.http, &url),
        }
    }

    fn transform_via_chat(
        &self,
        image: &DynamicImage,
        instruction: &str,
        api_key: &str,
    ) -> Result<DynamicImage, TransformFailure> {
        let payload = build_chat_payload(
            &self.model,
            instruction,
            &encode_image_base64(image, ImageFormat::Jpeg)?,
        );
        let endpoint = self.chat_endpoint();
        log::debug!("POST {endpoint} (model {})", self.model);
        let response = send(self.http.post(&endpoint).bearer_auth(api_key).json(&payload))?;
        let response_payload = response_json("OpenAI chat", response)?;
        resolve_image_reference(&self.http, chat_image_reference(&response_payload)?)
    }
}

impl ImageProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn transform(
        &self,
        image: &DynamicImage,
        instruction: &str,
        api_key: &str,
    ) -> Result<DynamicImage, TransformFailure> {
        match self.transport {
            OpenAiTransport::Edits => self.transform_via_edits(image, instruction, api_key),
            OpenAiTransport::Chat => self.transform_via_chat(image, instruction, api_key),
        }
    }
}

fn build_chat_payload(model: &str, instruction: &str, jpeg_base64: &str) -> Value {
    json!({
        "model": model,
        "messages": [{
            "role": "user",
            "content": [
                { "type": "text", "text": instruction },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:image/jpeg;base64,{jpeg_base64}") },
                },
            ],
        }],
    })
}

fn edits_image_reference(payload: &Value) -> Result<ImageReference, TransformFailure> {
    let Some(item) = payload
        .get("data")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        return Err(TransformFailure::EmptyOrBlockedResult(
            "OpenAI edits returned no images".to_string(),
        ));
    };
    if let Some(data) = item
        .get("b64_json")
        .and_then(Value::as_str)
        .filter(|data| !data.is_empty())
    {
        return Ok(ImageReference::Inline(data.to_string()));
    }
    if let Some(url) = item
        .get("url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
    {
        return Ok(ImageReference::Url(url.to_string()));
    }
    Err(TransformFailure::UnparseableResponse(
        "OpenAI edits image item had neither b64_json nor url".to_string(),
    ))
}

/// Looks at structured image fields first, then falls back to scanning the text content.
fn chat_image_reference(payload: &Value) -> Result<ImageReference, TransformFailure> {
    let Some(choice) = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
    else {
        return Err(TransformFailure::EmptyOrBlockedResult(
            "OpenAI chat returned no choices".to_string(),
        ));
    };
    let message = choice.get("message").cloned().unwrap_or(Value::Null);

    if let Some(images) = message.get("images").and_then(Value::as_array) {
        for image in images {
            let target = image
                .pointer("/image_url/url")
                .or_else(|| image.get("url"))
                .and_then(Value::as_str);
            if let Some(reference) = target.and_then(reference_from_target) {
                return Ok(reference);
            }
        }
    }

    let mut texts = Vec::new();
    match message.get("content") {
        Some(Value::String(text)) => texts.push(text.clone()),
        Some(Value::Array(parts)) => {
            for part in parts {
                let target = part
                    .pointer("/image_url/url")
                    .or_else(|| part.pointer("/image_url"))
                    .and_then(Value::as_str);
                if let Some(reference) = target.and_then(reference_from_target) {
                    return Ok(reference);
                }
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
            }
        }
        _ => {}
    }

    let text = texts.join("\n");
    if text.trim().is_empty() {
        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Err(TransformFailure::EmptyOrBlockedResult(format!(
            "OpenAI chat returned an empty message ({finish_reason})"
        )));
    }
    extract_image_reference(&text).ok_or_else(|| {
        TransformFailure::UnparseableResponse(format!(
            "OpenAI chat replied with text only: {}",
            truncate_text(&text, 200)
        ))
    })
}
