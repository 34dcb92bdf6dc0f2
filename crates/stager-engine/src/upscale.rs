use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::UpscalerConfig;
use crate::keys::{thread_sleeper, Sleeper};
use crate::util::{extension_for_mime, truncate_text};

pub const UPSCALER_PATH: &str = "/v1/ai/image-upscaler";

/// Fixed fidelity-first parameter set sent with every upscale request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpscaleParams {
    pub scale_factor: String,
    pub optimized_for: String,
    pub creativity: i32,
    pub hdr: i32,
    pub resemblance: i32,
    pub fractality: i32,
    pub engine: String,
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            scale_factor: "2x".to_string(),
            optimized_for: "standard".to_string(),
            creativity: -2,
            hdr: 0,
            resemblance: 5,
            fractality: -2,
            engine: "automatic".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Created,
    InProgress,
    Completed,
    Failed,
    Other(String),
}

impl TaskStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "CREATED" => Self::Created,
            "IN_PROGRESS" => Self::InProgress,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub task_id: Option<String>,
    pub status: TaskStatus,
    pub generated: Vec<String>,
}

impl TaskSnapshot {
    /// Reads the `data` envelope of a submit or poll response.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let Some(data) = payload.get("data").and_then(Value::as_object) else {
            bail!(
                "upscaler response missing data: {}",
                truncate_text(&payload.to_string(), 512)
            );
        };
        let task_id = data
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);
        let status = TaskStatus::parse(data.get("status").and_then(Value::as_str).unwrap_or(""));
        let generated = data
            .get("generated")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::trim)
                    .filter(|url| url.starts_with("http"))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            task_id,
            status,
            generated,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaledImage {
    pub source_url: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl UpscaledImage {
    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

/// Client for the asynchronous image upscaling service.
pub struct Upscaler {
    api_base: String,
    api_key: String,
    poll_interval: Duration,
    request_timeout: Duration,
    params: UpscaleParams,
    http: HttpClient,
    sleeper: Sleeper,
}

impl Upscaler {
    pub fn new(config: &UpscalerConfig) -> Result<Self> {
        let Some(api_key) = config.api_key.clone() else {
            bail!("FREEPIK_API_KEY is not set; upscaling is unavailable");
        };
        Ok(Self {
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            api_key,
            poll_interval: config.poll_interval,
            request_timeout: config.request_timeout,
            params: UpscaleParams::default(),
            http: HttpClient::new(),
            sleeper: thread_sleeper(),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Submits `image`, follows the task until it settles or `until` passes,
    /// then downloads every generated result.
    pub fn upscale(&self, image: &Path, until: Instant) -> Result<Vec<UpscaledImage>> {
        let bytes =
            fs::read(image).with_context(|| format!("failed reading {}", image.display()))?;
        let submitted = self.submit(&BASE64.encode(bytes))?;
        info!(
            task_id = submitted.task_id.as_deref().unwrap_or("-"),
            status = ?submitted.status,
            "upscale submitted"
        );

        let settled = match submitted.status {
            TaskStatus::Completed if !submitted.generated.is_empty() => submitted,
            TaskStatus::Failed => bail!("upscale task failed at submission"),
            _ => {
                let Some(task_id) = submitted.task_id.clone() else {
                    bail!("upscaler returned neither results nor a task id");
                };
                poll_until(
                    || self.fetch_task(&task_id),
                    self.poll_interval,
                    until,
                    &self.sleeper,
                )?
            }
        };
        if settled.generated.is_empty() {
            bail!("upscale task completed without results");
        }
        settled
            .generated
            .iter()
            .map(|url| self.download(url))
            .collect()
    }

    fn submit(&self, image_b64: &str) -> Result<TaskSnapshot> {
        let endpoint = format!("{}{}", self.api_base, UPSCALER_PATH);
        let mut body = serde_json::to_value(&self.params)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("image".to_string(), Value::String(image_b64.to_string()));
        }
        let response = self
            .http
            .post(&endpoint)
            .header("x-freepik-api-key", &self.api_key)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .with_context(|| format!("upscaler request failed ({endpoint})"))?;
        TaskSnapshot::from_payload(&response_json_or_error("upscaler", response)?)
    }

    fn fetch_task(&self, task_id: &str) -> Result<TaskSnapshot> {
        let endpoint = format!("{}{}/{}", self.api_base, UPSCALER_PATH, task_id);
        let response = self
            .http
            .get(&endpoint)
            .header("x-freepik-api-key", &self.api_key)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("upscaler poll failed ({endpoint})"))?;
        TaskSnapshot::from_payload(&response_json_or_error("upscaler poll", response)?)
    }

    fn download(&self, url: &str) -> Result<UpscaledImage> {
        let response = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .with_context(|| format!("failed downloading upscaled image ({url})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("upscaled image download failed ({}) for {url}", status.as_u16());
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        let data = response
            .bytes()
            .with_context(|| format!("failed reading upscaled image body ({url})"))?
            .to_vec();
        debug!(url, bytes = data.len(), "upscaled image downloaded");
        Ok(UpscaledImage {
            source_url: url.to_string(),
            mime_type,
            data,
        })
    }
}

/// Polls `fetch` every `interval` until the task is terminal. A task still
/// running once `until` passes is an error.
pub fn poll_until<F>(
    mut fetch: F,
    interval: Duration,
    until: Instant,
    sleeper: &Sleeper,
) -> Result<TaskSnapshot>
where
    F: FnMut() -> Result<TaskSnapshot>,
{
    let mut polls = 0usize;
    loop {
        let snapshot = fetch()?;
        polls += 1;
        match snapshot.status {
            TaskStatus::Completed => return Ok(snapshot),
            TaskStatus::Failed => bail!(
                "upscale task {} failed",
                snapshot.task_id.as_deref().unwrap_or("-")
            ),
            _ => {}
        }
        if Instant::now() >= until {
            bail!("upscale polling stopped at the run deadline after {polls} polls");
        }
        (sleeper)(interval);
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}
