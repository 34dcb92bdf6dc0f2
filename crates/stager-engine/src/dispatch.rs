use std::sync::Arc;
use std::time::Duration;

use rand::seq::IndexedRandom;
use tracing::{debug, warn};

use crate::keys::{key_fingerprint, thread_sleeper, KeyPool, Sleeper};
use crate::model::{GenerationRequest, GenerationResponse, GenerativeModel, ModelErrorKind};

/// Attempts allowed beyond one pass over the pool.
pub const RETRY_HEADROOM: usize = 5;

/// Chooses the credential for the next attempt from the available subset.
pub type KeyPicker = Arc<dyn Fn(&[String]) -> Option<String> + Send + Sync>;

pub fn random_picker() -> KeyPicker {
    Arc::new(|keys: &[String]| keys.choose(&mut rand::rng()).cloned())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub quota_base: Duration,
    pub quota_step: Duration,
    pub transient: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            quota_base: Duration::from_secs(2),
            quota_step: Duration::from_secs(1),
            transient: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Linear in the attempt index, shared by every credential.
    pub fn after_quota(&self, attempt: usize) -> Duration {
        let step = u32::try_from(attempt).unwrap_or(u32::MAX);
        self.quota_base
            .saturating_add(self.quota_step.saturating_mul(step))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("generation unavailable after {attempts} attempts: {last_error}")]
    Exhausted { attempts: usize, last_error: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempts: usize,
    pub quota_errors: usize,
    pub transient_errors: usize,
    /// Fingerprint of the credential that produced the response.
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: GenerationResponse,
    pub report: DispatchReport,
}

/// Runs one generation against the model, rotating credentials on failure.
///
/// One dispatcher is shared by every stage and request in the process, so a
/// quota hit observed by one caller immediately steers all others away from
/// that credential.
pub struct FailoverDispatcher {
    pool: Arc<KeyPool>,
    model: Arc<dyn GenerativeModel>,
    backoff: BackoffPolicy,
    sleeper: Sleeper,
    picker: KeyPicker,
}

impl FailoverDispatcher {
    pub fn new(pool: Arc<KeyPool>, model: Arc<dyn GenerativeModel>) -> Self {
        Self {
            pool,
            model,
            backoff: BackoffPolicy::default(),
            sleeper: thread_sleeper(),
            picker: random_picker(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_picker(mut self, picker: KeyPicker) -> Self {
        self.picker = picker;
        self
    }

    pub fn pool(&self) -> &Arc<KeyPool> {
        &self.pool
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn retry_budget(&self) -> usize {
        self.pool.len() + RETRY_HEADROOM
    }

    pub fn dispatch(&self, request: &GenerationRequest) -> Result<Dispatched, DispatchError> {
        let budget = self.retry_budget();
        let mut report = DispatchReport::default();
        let mut last_error = "no attempt made".to_string();

        for attempt in 0..budget {
            let available = self.pool.available();
            let Some(credential) = (self.picker)(available.as_slice()) else {
                last_error = "no credential available".to_string();
                continue;
            };
            report.attempts += 1;
            let fingerprint = key_fingerprint(&credential);
            debug!(attempt, budget, key = %fingerprint, model = %request.model, "dispatch attempt");

            let err = match self.model.generate(&credential, request) {
                Ok(response) => {
                    report.credential = fingerprint;
                    return Ok(Dispatched { response, report });
                }
                Err(err) => err,
            };
            last_error = err.message.clone();
            let is_last = attempt + 1 == budget;

            match err.kind {
                ModelErrorKind::Quota => {
                    report.quota_errors += 1;
                    self.pool.disable(&credential);
                    let delay = self.backoff.after_quota(attempt);
                    warn!(
                        attempt,
                        key = %fingerprint,
                        delay_s = delay.as_secs_f64(),
                        error = %err,
                        "quota error; rotating credential"
                    );
                    if !is_last {
                        (self.sleeper)(delay);
                    }
                }
                ModelErrorKind::Transient => {
                    report.transient_errors += 1;
                    warn!(attempt, key = %fingerprint, error = %err, "transient model error");
                    if !is_last {
                        (self.sleeper)(self.backoff.transient);
                    }
                }
            }
        }

        warn!(attempts = report.attempts, error = %last_error, "dispatch exhausted");
        Err(DispatchError::Exhausted {
            attempts: report.attempts,
            last_error,
        })
    }
}
