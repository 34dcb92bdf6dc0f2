use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stages::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTally {
    pub stage: Stage,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<StageTally>,
    pub outputs: Vec<String>,
}

impl RunSummary {
    pub fn total_artifacts(&self) -> u64 {
        self.stages.iter().map(|tally| tally.succeeded).sum()
    }
}

pub fn write_summary(
    path: &Path,
    summary: &RunSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = Map::new();
    payload.insert("run_id".to_string(), Value::String(summary.run_id.clone()));
    payload.insert(
        "started_at".to_string(),
        Value::String(summary.started_at.clone()),
    );
    payload.insert(
        "finished_at".to_string(),
        Value::String(summary.finished_at.clone()),
    );
    payload.insert("stages".to_string(), serde_json::to_value(&summary.stages)?);
    payload.insert(
        "total_artifacts".to_string(),
        Value::Number(summary.total_artifacts().into()),
    );
    payload.insert(
        "outputs".to_string(),
        Value::Array(summary.outputs.iter().cloned().map(Value::String).collect()),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
