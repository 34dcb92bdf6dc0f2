use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stages::Stage;

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// What one stage invocation consumed and produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReceipt {
    pub stage: Stage,
    pub model: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub attempts: u64,
    #[serde(default)]
    pub warnings: Vec<String>,
}

pub fn build_receipt(
    receipt: &StageReceipt,
    request: &Map<String, Value>,
    receipt_path: &Path,
) -> Value {
    let mut root = Map::new();
    root.insert(
        "schema_version".to_string(),
        Value::Number(RECEIPT_SCHEMA_VERSION.into()),
    );
    root.insert(
        "receipt".to_string(),
        serde_json::to_value(receipt).unwrap_or(Value::Null),
    );
    root.insert(
        "request".to_string(),
        sanitize_payload(&Value::Object(request.clone())),
    );
    root.insert(
        "receipt_path".to_string(),
        Value::String(receipt_path.to_string_lossy().to_string()),
    );
    Value::Object(root)
}

pub fn write_receipt(path: &Path, payload: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(payload)?)?;
    Ok(())
}

/// Replaces inline image bytes and credentials with a placeholder.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::Bool(_) | Value::Number(_) | Value::String(_) => value.clone(),
        Value::Array(rows) => Value::Array(rows.iter().map(sanitize_payload).collect()),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, row) in map {
                let lowered = key.to_ascii_lowercase();
                if matches!(
                    lowered.as_str(),
                    "image" | "image_bytes" | "data" | "base64" | "key" | "api_key"
                ) {
                    out.insert(key.clone(), Value::String("<omitted>".to_string()));
                    continue;
                }
                out.insert(key.clone(), sanitize_payload(row));
            }
            Value::Object(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};

    use crate::stages::Stage;

    use super::{build_receipt, write_receipt, StageReceipt, RECEIPT_SCHEMA_VERSION};

    fn receipt() -> StageReceipt {
        StageReceipt {
            stage: Stage::Furnish,
            model: Some("gemini-2.5-flash-image".to_string()),
            started_at: "2026-10-16T00:00:00+00:00".to_string(),
            finished_at: "2026-10-16T00:00:09+00:00".to_string(),
            inputs: vec!["empty-1.png".to_string(), "style.png".to_string()],
            outputs: vec!["furnished-1.png".to_string()],
            failures: vec!["variant 2: generation unavailable".to_string()],
            attempts: 3,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn receipt_roundtrip_and_sanitizes_inline_images() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let receipt_path = temp.path().join("receipt-furnish.json");

        let mut request = Map::new();
        request.insert("variants".to_string(), json!(2));
        request.insert(
            "parts".to_string(),
            json!([
                {"text": "stage it"},
                {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
            ]),
        );

        let payload = build_receipt(&receipt(), &request, &receipt_path);
        write_receipt(&receipt_path, &payload)?;

        let raw = std::fs::read_to_string(&receipt_path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        assert_eq!(parsed["schema_version"], json!(RECEIPT_SCHEMA_VERSION));
        assert_eq!(parsed["receipt"]["stage"], json!("furnish"));
        assert_eq!(parsed["receipt"]["attempts"], json!(3));
        assert_eq!(parsed["request"]["variants"], json!(2));
        assert_eq!(
            parsed["request"]["parts"][1]["inlineData"]["data"],
            json!("<omitted>")
        );
        assert_eq!(parsed["request"]["parts"][0]["text"], json!("stage it"));

        let decoded: StageReceipt = serde_json::from_value(parsed["receipt"].clone())?;
        assert_eq!(decoded, receipt());
        Ok(())
    }
}
