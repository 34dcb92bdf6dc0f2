use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::util::non_empty;

pub const DEFAULT_KEY_PREFIX: &str = "GEMINI_API_KEY";
pub const DEFAULT_IMAGE_MODEL: &str = "gemini-2.5-flash-image";
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_UPSCALER_API_BASE: &str = "https://api.freepik.com";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 32;

/// Worker limits for each fan-out stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyLimits {
    pub furnish: usize,
    pub detail: usize,
    pub upscale: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            furnish: 5,
            detail: 10,
            upscale: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpscalerConfig {
    pub api_base: String,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    pub output_dir: PathBuf,
    pub public_base_url: String,
    pub key_prefix: String,
    pub key_cooldown: Duration,
    pub gemini_api_base: String,
    pub image_model: String,
    pub request_timeout: Duration,
    /// Wall-clock budget for a whole staging run, checked at stage entry.
    pub run_deadline: Duration,
    /// Largest HTTP request body accepted, base64 images included.
    pub max_upload_bytes: usize,
    pub limits: ConcurrencyLimits,
    pub upscaler: UpscalerConfig,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| non_empty(lookup(key));
        let secs = |key: &str, default: u64, min: u64, max: u64| {
            Duration::from_secs(parse_clamped(get(key), default, min, max))
        };
        let defaults = ConcurrencyLimits::default();
        let limit = |key: &str, default: usize| parse_clamped(get(key), default, 1, 64);

        Self {
            output_dir: get("STAGER_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("outputs")),
            public_base_url: get("STAGER_PUBLIC_BASE_URL")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "/outputs".to_string()),
            key_prefix: get("STAGER_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            key_cooldown: secs("STAGER_KEY_COOLDOWN_SECS", 60, 0, 3600),
            gemini_api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_GEMINI_API_BASE.to_string()),
            image_model: get("STAGER_IMAGE_MODEL")
                .unwrap_or_else(|| DEFAULT_IMAGE_MODEL.to_string()),
            request_timeout: secs("STAGER_REQUEST_TIMEOUT_SECS", 120, 15, 600),
            run_deadline: secs("STAGER_RUN_DEADLINE_SECS", 600, 30, 3600),
            max_upload_bytes: megabytes(parse_clamped(
                get("STAGER_MAX_UPLOAD_MB"),
                DEFAULT_MAX_UPLOAD_MB,
                1,
                512,
            )),
            limits: ConcurrencyLimits {
                furnish: limit("STAGER_FURNISH_CONCURRENCY", defaults.furnish),
                detail: limit("STAGER_DETAIL_CONCURRENCY", defaults.detail),
                upscale: limit("STAGER_UPSCALE_CONCURRENCY", defaults.upscale),
            },
            upscaler: UpscalerConfig {
                api_base: get("FREEPIK_API_BASE")
                    .map(|value| value.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| DEFAULT_UPSCALER_API_BASE.to_string()),
                api_key: get("FREEPIK_API_KEY"),
                poll_interval: secs("STAGER_UPSCALE_POLL_SECS", 2, 1, 30),
                request_timeout: secs("STAGER_UPSCALE_TIMEOUT_SECS", 120, 15, 600),
            },
        }
    }
}

pub fn megabytes(value: usize) -> usize {
    value.saturating_mul(1024 * 1024)
}

fn parse_clamped<T>(raw: Option<String>, default: T, min: T, max: T) -> T
where
    T: std::str::FromStr + Ord + Copy,
{
    raw.and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
        .clamp(min, max)
}
