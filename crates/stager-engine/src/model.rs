use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};

use crate::util::{extension_for_mime, mime_for_path};

/// Substrings that mark a provider error as quota or rate-limit related.
pub const QUOTA_MARKERS: [&str; 5] = [
    "429",
    "403",
    "Quota",
    "limit",
    "Resource has been exhausted",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    Image { mime_type: String, data: Vec<u8> },
}

impl ContentPart {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn image_from_path(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        // Uploads keep whatever name they arrived with, so trust the bytes first.
        let mime_type = image::guess_format(&data)
            .ok()
            .map(|format| format.to_mime_type())
            .or_else(|| mime_for_path(path))
            .unwrap_or("image/png");
        Ok(Self::Image {
            mime_type: mime_type.to_string(),
            data,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetySetting {
    pub category: &'static str,
    pub threshold: &'static str,
}

/// Interior photos trip the default filters on things like beds and
/// bathrooms, so every category is relaxed to `BLOCK_NONE`.
pub fn relaxed_safety_settings() -> Vec<SafetySetting> {
    [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ]
    .into_iter()
    .map(|category| SafetySetting {
        category,
        threshold: "BLOCK_NONE",
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub model: String,
    pub parts: Vec<ContentPart>,
    pub timeout: Duration,
    pub safety: Vec<SafetySetting>,
    pub system_instruction: Option<String>,
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, parts: Vec<ContentPart>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            parts,
            timeout,
            safety: relaxed_safety_settings(),
            system_instruction: None,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Request summary for receipts. Image bytes are reduced to their size.
    pub fn manifest(&self) -> Value {
        let parts = self
            .parts
            .iter()
            .map(|part| match part {
                ContentPart::Text(text) => json!({ "text": text }),
                ContentPart::Image { mime_type, data } => json!({
                    "image": { "mime_type": mime_type, "bytes": data.len() }
                }),
            })
            .collect::<Vec<Value>>();
        json!({
            "model": self.model,
            "parts": parts,
            "timeout_s": self.timeout.as_secs_f64(),
            "system_instruction": self.system_instruction,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl InlineImage {
    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResponse {
    pub images: Vec<InlineImage>,
    pub text: Option<String>,
}

impl GenerationResponse {
    pub fn first_image(&self) -> Option<&InlineImage> {
        self.images.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    /// Credential-specific rejection; rotate away from it.
    Quota,
    /// Anything else; retry on any credential.
    Transient,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn quota(message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::Quota,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ModelErrorKind::Transient,
            message: message.into(),
        }
    }

    /// Classifies a raw provider error surface by its text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: classify_error_message(&message),
            message,
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if matches!(status, 403 | 429) {
            return Self::quota(message);
        }
        Self::from_message(message)
    }

    pub fn is_quota(&self) -> bool {
        self.kind == ModelErrorKind::Quota
    }
}

pub fn classify_error_message(message: &str) -> ModelErrorKind {
    if QUOTA_MARKERS.iter().any(|marker| message.contains(marker)) {
        ModelErrorKind::Quota
    } else {
        ModelErrorKind::Transient
    }
}

/// Text-plus-images in, images-plus-text out. Implementations map their
/// provider's failures into [`ModelError`] once, at this boundary.
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        credential: &str,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ModelError>;
}
