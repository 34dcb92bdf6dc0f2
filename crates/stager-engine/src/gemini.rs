use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::model::{
    ContentPart, GenerationRequest, GenerationResponse, GenerativeModel, InlineImage, ModelError,
};
use crate::util::{error_chain_text, truncate_text};

/// `generateContent` over blocking reqwest, one credential per call.
pub struct GeminiTransport {
    api_base: String,
    http: HttpClient,
}

impl GeminiTransport {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            http: HttpClient::new(),
        }
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn build_payload(request: &GenerationRequest) -> Value {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({ "text": text }),
                ContentPart::Image { mime_type, data } => json!({
                    "inlineData": {
                        "mimeType": mime_type,
                        "data": BASE64.encode(data),
                    }
                }),
            })
            .collect::<Vec<Value>>();

        let mut payload = Map::new();
        payload.insert(
            "contents".to_string(),
            json!([{ "role": "user", "parts": parts }]),
        );
        if let Some(instruction) = request
            .system_instruction
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            payload.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": instruction }] }),
            );
        }
        payload.insert(
            "safetySettings".to_string(),
            Value::Array(
                request
                    .safety
                    .iter()
                    .map(|setting| {
                        json!({
                            "category": setting.category,
                            "threshold": setting.threshold,
                        })
                    })
                    .collect(),
            ),
        );
        payload.insert(
            "generationConfig".to_string(),
            json!({ "responseModalities": ["TEXT", "IMAGE"] }),
        );
        Value::Object(payload)
    }

    fn parse_response(payload: &Value) -> Result<GenerationResponse, ModelError> {
        let candidates = payload
            .get("candidates")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut images = Vec::new();
        let mut texts = Vec::new();

        for candidate in candidates {
            let parts = candidate
                .get("content")
                .and_then(Value::as_object)
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for part in parts {
                if let Some(text) = part
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                {
                    texts.push(text.to_string());
                }
                let inline = part
                    .get("inlineData")
                    .or_else(|| part.get("inline_data"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let data = inline
                    .get("data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if data.is_empty() {
                    continue;
                }
                let bytes = BASE64.decode(data.as_bytes()).map_err(|err| {
                    ModelError::transient(format!("Gemini image base64 decode failed: {err}"))
                })?;
                let mime_type = inline
                    .get("mimeType")
                    .or_else(|| inline.get("mime_type"))
                    .and_then(Value::as_str)
                    .unwrap_or("image/png")
                    .to_string();
                images.push(InlineImage {
                    mime_type,
                    data: bytes,
                });
            }
        }

        if images.is_empty() && texts.is_empty() {
            if let Some(reason) = payload
                .get("promptFeedback")
                .and_then(|feedback| feedback.get("blockReason"))
                .and_then(Value::as_str)
            {
                texts.push(format!("blocked: {reason}"));
            }
        }

        Ok(GenerationResponse {
            images,
            text: if texts.is_empty() {
                None
            } else {
                Some(texts.join("\n"))
            },
        })
    }
}

impl GenerativeModel for GeminiTransport {
    fn name(&self) -> &str {
        "gemini"
    }

    fn generate(
        &self,
        credential: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ModelError> {
        let endpoint = self.endpoint_for_model(&request.model);
        let payload = Self::build_payload(request);
        debug!(endpoint = %endpoint, parts = request.parts.len(), "gemini request");

        let response = self
            .http
            .post(&endpoint)
            .query(&[("key", credential)])
            .timeout(request.timeout)
            .json(&payload)
            .send()
            .map_err(|err| {
                let err = anyhow::Error::new(err.without_url())
                    .context(format!("Gemini request failed ({endpoint})"));
                ModelError::from_message(error_chain_text(&err, 512))
            })?;

        let status = response.status();
        let body = response.text().map_err(|err| {
            ModelError::transient(format!(
                "Gemini response body read failed: {}",
                err.without_url()
            ))
        })?;
        if !status.is_success() {
            let code = status.as_u16();
            return Err(ModelError::from_status(
                code,
                format!("Gemini request failed ({code}): {}", truncate_text(&body, 512)),
            ));
        }
        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            ModelError::transient(format!("Gemini returned invalid JSON payload: {err}"))
        })?;
        Self::parse_response(&parsed)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::Engine as _;
    use serde_json::json;

    use super::{GeminiTransport, BASE64};
    use crate::model::{ContentPart, GenerationRequest};

    #[test]
    fn endpoint_prefixes_models_path_once() {
        let transport = GeminiTransport::new("https://example.test/v1beta/");
        assert_eq!(
            transport.endpoint_for_model("gemini-2.5-flash-image"),
            "https://example.test/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
        assert_eq!(
            transport.endpoint_for_model("models/gemini-2.5-flash-image"),
            "https://example.test/v1beta/models/gemini-2.5-flash-image:generateContent"
        );
    }

    #[test]
    fn payload_carries_parts_safety_and_instruction() {
        let request = GenerationRequest::new(
            "gemini-2.5-flash-image",
            vec![
                ContentPart::Image {
                    mime_type: "image/jpeg".to_string(),
                    data: vec![0xff, 0xd8],
                },
                ContentPart::text("remove every piece of furniture"),
            ],
            Duration::from_secs(60),
        )
        .with_system_instruction("You are an interior photographer.");
        let payload = GeminiTransport::build_payload(&request);

        let parts = &payload["contents"][0]["parts"];
        assert_eq!(parts[0]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[0]["inlineData"]["data"], BASE64.encode([0xff, 0xd8]));
        assert_eq!(parts[1]["text"], "remove every piece of furniture");
        assert_eq!(
            payload["systemInstruction"]["parts"][0]["text"],
            "You are an interior photographer."
        );
        assert_eq!(payload["safetySettings"].as_array().map(Vec::len), Some(4));
        assert_eq!(payload["safetySettings"][0]["threshold"], "BLOCK_NONE");
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["TEXT", "IMAGE"])
        );
    }

    #[test]
    fn blank_system_instruction_is_omitted() {
        let request =
            GenerationRequest::new("gemini-2.5-flash-image", Vec::new(), Duration::from_secs(5))
                .with_system_instruction("   ");
        let payload = GeminiTransport::build_payload(&request);
        assert!(payload.get("systemInstruction").is_none());
        assert_eq!(
            payload["generationConfig"]["responseModalities"],
            json!(["TEXT", "IMAGE"])
        );
    }

    #[test]
    fn parse_response_collects_images_and_text() -> anyhow::Result<()> {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "Here is the staged room."},
                    {"inlineData": {"mimeType": "image/png", "data": BASE64.encode([1u8, 2, 3])}},
                    {"inline_data": {"mime_type": "image/jpeg", "data": BASE64.encode([4u8])}}
                ]}
            }]
        });
        let response = GeminiTransport::parse_response(&payload)?;
        assert_eq!(response.images.len(), 2);
        assert_eq!(response.images[0].data, vec![1, 2, 3]);
        assert_eq!(response.images[1].extension(), "jpg");
        assert_eq!(response.text.as_deref(), Some("Here is the staged room."));
        Ok(())
    }

    #[test]
    fn parse_response_reports_block_reason_as_text() -> anyhow::Result<()> {
        let payload = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let response = GeminiTransport::parse_response(&payload)?;
        assert!(response.images.is_empty());
        assert_eq!(response.text.as_deref(), Some("blocked: SAFETY"));
        Ok(())
    }

    #[test]
    fn parse_response_rejects_corrupt_base64() {
        let payload = json!({
            "candidates": [{"content": {"parts": [{"inlineData": {"data": "***"}}]}}]
        });
        assert!(GeminiTransport::parse_response(&payload).is_err());
    }
}
