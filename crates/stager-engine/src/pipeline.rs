use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use stager_contracts::events::EventWriter;
use stager_contracts::runs::receipts::{build_receipt, write_receipt, StageReceipt};
use stager_contracts::runs::summary::{write_summary, RunSummary, StageTally};
use stager_contracts::stages::Stage;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::canvas::{self, CanvasOutcome, StandardizeOptions};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchError, FailoverDispatcher};
use crate::fanout::fan_out;
use crate::gemini::GeminiTransport;
use crate::keys::{KeyPool, KeyPoolStatus};
use crate::model::{ContentPart, GenerationRequest, InlineImage};
use crate::prompts;
use crate::upscale::Upscaler;
use crate::util::{error_chain_text, map_object, now_utc_iso, truncate_text};

pub const MAX_FURNISH_VARIANTS: usize = 8;
pub const MAX_DETAIL_SHOTS: usize = 12;
pub const MAX_UPSCALE_IMAGES: usize = 16;

/// Wall-clock budget for one run. Only consulted when a stage starts; work
/// already dispatched is never interrupted.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn start(budget: Duration) -> Self {
        Self {
            started: Instant::now(),
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn expires_at(&self) -> Instant {
        self.started.checked_add(self.budget).unwrap_or(self.started)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.started.elapsed() >= self.budget
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("{stage} was not started: the run exceeded its {budget_s}s time budget")]
    DeadlineExceeded { stage: Stage, budget_s: u64 },
    /// The message stays generic; item details live in `failures` and logs.
    #[error("{stage} could not produce any image; the image service may be busy, please try again")]
    AllFailed { stage: Stage, failures: Vec<String> },
    #[error("invalid input for {stage}: {message}")]
    Input { stage: Stage, message: String },
}

impl StageError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::DeadlineExceeded { stage, .. }
            | Self::AllFailed { stage, .. }
            | Self::Input { stage, .. } => *stage,
        }
    }
}

/// One staging run: its id, record directory, event log and deadline.
#[derive(Debug, Clone)]
pub struct RunContext {
    run_id: String,
    run_dir: PathBuf,
    started_at: String,
    events: EventWriter,
    deadline: Deadline,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub stage: Stage,
    pub file_name: String,
    pub path: PathBuf,
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Canvas normalization failed and the raw model output was kept.
    pub degraded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageOutput {
    pub stage: Stage,
    pub artifacts: Vec<Artifact>,
    pub failures: Vec<String>,
    pub warnings: Vec<String>,
    pub attempts: usize,
    pub receipt: PathBuf,
}

impl StageOutput {
    pub fn urls(&self) -> Vec<String> {
        self.artifacts.iter().map(|artifact| artifact.url.clone()).collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.artifacts
            .iter()
            .map(|artifact| artifact.path.clone())
            .collect()
    }

    pub fn primary(&self) -> Option<&Path> {
        self.artifacts.first().map(|artifact| artifact.path.as_path())
    }

    fn tally(&self) -> StageTally {
        StageTally {
            stage: self.stage,
            succeeded: self.artifacts.len() as u64,
            failed: self.failures.len() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagingRequest {
    pub room: PathBuf,
    pub style: PathBuf,
    pub variants: usize,
    pub details: usize,
    pub moodboard: bool,
    pub upscale: bool,
}

impl StagingRequest {
    pub fn new(room: impl Into<PathBuf>, style: impl Into<PathBuf>) -> Self {
        Self {
            room: room.into(),
            style: style.into(),
            variants: 1,
            details: 0,
            moodboard: true,
            upscale: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StagingRun {
    pub run_id: String,
    pub run_dir: PathBuf,
    pub empty_room: StageOutput,
    pub furnished: StageOutput,
    pub details: Option<StageOutput>,
    pub moodboard: Option<StageOutput>,
    pub upscaled: Option<StageOutput>,
    /// Later stages that failed without failing the run.
    pub notes: Vec<String>,
    pub summary: PathBuf,
}

impl StagingRun {
    pub fn stages(&self) -> Vec<&StageOutput> {
        let mut stages = vec![&self.empty_room, &self.furnished];
        stages.extend(self.details.iter());
        stages.extend(self.moodboard.iter());
        stages.extend(self.upscaled.iter());
        stages
    }

    pub fn urls(&self) -> Vec<String> {
        self.stages()
            .into_iter()
            .flat_map(StageOutput::urls)
            .collect()
    }
}

/// Per-stage tallies, output URLs and notes collected over one run.
#[derive(Debug, Default)]
struct RunRecord {
    tallies: Vec<StageTally>,
    outputs: Vec<String>,
    notes: Vec<String>,
}

impl RunRecord {
    fn record(&mut self, output: &StageOutput) {
        self.tallies.push(output.tally());
        self.outputs.extend(output.urls());
    }

    fn record_failure(&mut self, err: &StageError) {
        if let StageError::AllFailed { stage, failures } = err {
            self.tallies.push(StageTally {
                stage: *stage,
                succeeded: 0,
                failed: failures.len() as u64,
            });
        }
    }

    fn required(&mut self, result: Result<StageOutput, StageError>) -> Result<StageOutput> {
        match result {
            Ok(output) => {
                self.record(&output);
                Ok(output)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err.into())
            }
        }
    }

    fn optional(
        &mut self,
        run: &RunContext,
        result: Result<StageOutput, StageError>,
    ) -> Option<StageOutput> {
        match result {
            Ok(output) => {
                self.record(&output);
                Some(output)
            }
            Err(err) => {
                warn!(
                    run_id = %run.run_id,
                    stage = %err.stage(),
                    error = %err,
                    "optional stage failed"
                );
                self.record_failure(&err);
                self.notes.push(err.to_string());
                None
            }
        }
    }
}

#[derive(Debug, Default)]
struct ItemOutcome {
    artifacts: Vec<Artifact>,
    attempts: usize,
    warnings: Vec<String>,
}

#[derive(Debug)]
struct ItemFailure {
    message: String,
    attempts: usize,
}

impl From<String> for ItemFailure {
    fn from(message: String) -> Self {
        Self {
            message,
            attempts: 0,
        }
    }
}

impl From<anyhow::Error> for ItemFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::from(error_chain_text(&err, 512))
    }
}

impl From<DispatchError> for ItemFailure {
    fn from(err: DispatchError) -> Self {
        let attempts = match &err {
            DispatchError::Exhausted { attempts, .. } => *attempts,
        };
        Self {
            message: err.to_string(),
            attempts,
        }
    }
}

struct StageClock {
    started_at: String,
    inputs: Vec<String>,
}

/// Stage orchestration over a shared dispatcher. One instance serves every
/// run in the process; per-run state lives in [`RunContext`].
pub struct StagingPipeline {
    config: EngineConfig,
    dispatcher: Arc<FailoverDispatcher>,
    upscaler: Option<Upscaler>,
}

impl StagingPipeline {
    pub fn new(config: EngineConfig, dispatcher: Arc<FailoverDispatcher>) -> Self {
        Self {
            config,
            dispatcher,
            upscaler: None,
        }
    }

    pub fn with_upscaler(mut self, upscaler: Upscaler) -> Self {
        self.upscaler = Some(upscaler);
        self
    }

    /// Wires the Gemini transport, the environment key pool and, when a key
    /// is configured, the upscaler. Fails when no model credential exists.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let pool = Arc::new(KeyPool::from_env(&config.key_prefix, config.key_cooldown)?);
        let transport = Arc::new(GeminiTransport::new(config.gemini_api_base.clone()));
        let dispatcher = Arc::new(FailoverDispatcher::new(pool, transport));
        let upscaler = match Upscaler::new(&config.upscaler) {
            Ok(upscaler) => Some(upscaler),
            Err(err) => {
                info!(reason = %err, "upscaler disabled");
                None
            }
        };
        Ok(Self {
            config,
            dispatcher,
            upscaler,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<FailoverDispatcher> {
        &self.dispatcher
    }

    pub fn has_upscaler(&self) -> bool {
        self.upscaler.is_some()
    }

    pub fn key_status(&self) -> KeyPoolStatus {
        self.dispatcher.pool().status()
    }

    pub fn start_run(&self) -> Result<RunContext> {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.config.output_dir.join("runs").join(&run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed creating run directory {}", run_dir.display()))?;
        let events = EventWriter::new(run_dir.join("events.jsonl"), run_id.clone());
        events.emit(
            "run_started",
            map_object(json!({
                "model": self.config.image_model,
                "deadline_s": self.config.run_deadline.as_secs(),
            })),
        )?;
        info!(run_id = %run_id, dir = %run_dir.display(), "run started");
        Ok(RunContext {
            run_id,
            run_dir,
            started_at: now_utc_iso(),
            events,
            deadline: Deadline::start(self.config.run_deadline),
        })
    }

    pub fn public_url(&self, file_name: &str) -> String {
        format!(
            "{}/{}",
            self.config.public_base_url.trim_end_matches('/'),
            file_name
        )
    }

    /// Resolves a bare file name inside the output directory.
    pub fn resolve_output(&self, file_name: &str) -> Option<PathBuf> {
        let trimmed = file_name.trim();
        let is_bare = !trimmed.is_empty()
            && !trimmed.contains(['/', '\\'])
            && trimmed != "."
            && trimmed != "..";
        if !is_bare {
            return None;
        }
        let path = self.config.output_dir.join(trimmed);
        path.is_file().then_some(path)
    }

    /// Writes uploaded image bytes into the output directory.
    pub fn store_upload(&self, bytes: &[u8]) -> Result<PathBuf> {
        self.store_image("upload", bytes)
    }

    /// Standardizes a copy of `room`, generates an empty version of it and
    /// fits the result back onto the standardized canvas.
    pub fn empty_room(&self, run: &RunContext, room: &Path) -> Result<StageOutput, StageError> {
        let stage = Stage::EmptyRoom;
        let clock = self.begin(run, stage, &[room])?;
        let bytes = fs::read(room).map_err(|err| {
            self.reject(run, stage, format!("cannot read {}: {err}", room.display()))
        })?;
        let copied = self
            .store_image("input", &bytes)
            .map_err(|err| self.reject(run, stage, error_chain_text(&err, 256)))?;

        let mut warnings = Vec::new();
        let standardized = canvas::standardize(&copied, StandardizeOptions::default());
        if let CanvasOutcome::Degraded { reason, .. } = &standardized {
            warnings.push(format!("input kept as uploaded: {reason}"));
        }
        drop_superseded(&copied, &standardized);
        let reference = standardized.path().to_path_buf();
        let source = self.load_part(run, stage, &reference)?;

        let results = fan_out(1, vec![source], |_, source| -> Result<ItemOutcome, ItemFailure> {
            let parts = vec![source, ContentPart::text(prompts::empty_room())];
            let (image, attempts) = self.generate_image(parts)?;
            let raw = self.save_generated(stage, &image)?;
            let mut warnings = Vec::new();
            let fitted = canvas::fit_to_reference_canvas(&raw, &reference);
            let artifact = self.settle(stage, &raw, fitted, &mut warnings);
            Ok(ItemOutcome {
                artifacts: vec![artifact],
                attempts,
                warnings,
            })
        });
        self.finish_stage(run, stage, clock, 1, results, warnings)
    }

    /// Generates `variants` furnished versions of `empty_room` in the style
    /// of `style`, each fitted to the empty room's exact canvas.
    pub fn furnish(
        &self,
        run: &RunContext,
        empty_room: &Path,
        style: &Path,
        variants: usize,
    ) -> Result<StageOutput, StageError> {
        let stage = Stage::Furnish;
        let clock = self.begin(run, stage, &[empty_room, style])?;
        if !(1..=MAX_FURNISH_VARIANTS).contains(&variants) {
            return Err(self.reject(
                run,
                stage,
                format!("variants must be between 1 and {MAX_FURNISH_VARIANTS}, got {variants}"),
            ));
        }
        let room_part = self.load_part(run, stage, empty_room)?;
        let style_part = self.load_part(run, stage, style)?;

        let limit = self.config.limits.furnish;
        let results = fan_out(
            limit,
            (0..variants).collect(),
            |_, variant| -> Result<ItemOutcome, ItemFailure> {
                let parts = vec![
                    room_part.clone(),
                    style_part.clone(),
                    ContentPart::text(prompts::furnish(variant, variants)),
                ];
                let (image, attempts) = self.generate_image(parts)?;
                let raw = self.save_generated(stage, &image)?;
                let mut warnings = Vec::new();
                let fitted = canvas::fit_to_reference_canvas(&raw, empty_room);
                let artifact = self.settle(stage, &raw, fitted, &mut warnings);
                Ok(ItemOutcome {
                    artifacts: vec![artifact],
                    attempts,
                    warnings,
                })
            },
        );
        self.finish_stage(run, stage, clock, limit, results, Vec::new())
    }

    pub fn detail_shots(
        &self,
        run: &RunContext,
        furnished: &Path,
        count: usize,
    ) -> Result<StageOutput, StageError> {
        let stage = Stage::DetailShots;
        let clock = self.begin(run, stage, &[furnished])?;
        if !(1..=MAX_DETAIL_SHOTS).contains(&count) {
            return Err(self.reject(
                run,
                stage,
                format!("count must be between 1 and {MAX_DETAIL_SHOTS}, got {count}"),
            ));
        }
        let room_part = self.load_part(run, stage, furnished)?;

        let limit = self.config.limits.detail;
        let results = fan_out(
            limit,
            (0..count).collect(),
            |_, index| -> Result<ItemOutcome, ItemFailure> {
                let parts = vec![room_part.clone(), ContentPart::text(prompts::detail_shot(index))];
                let (image, attempts) = self.generate_image(parts)?;
                let raw = self.save_generated(stage, &image)?;
                let mut warnings = Vec::new();
                let normalized = canvas::standardize(&raw, StandardizeOptions::default());
                let artifact = self.settle(stage, &raw, normalized, &mut warnings);
                Ok(ItemOutcome {
                    artifacts: vec![artifact],
                    attempts,
                    warnings,
                })
            },
        );
        self.finish_stage(run, stage, clock, limit, results, Vec::new())
    }

    pub fn moodboard(
        &self,
        run: &RunContext,
        style: &Path,
        furnished: Option<&Path>,
    ) -> Result<StageOutput, StageError> {
        let stage = Stage::Moodboard;
        let inputs = std::iter::once(style).chain(furnished).collect::<Vec<_>>();
        let clock = self.begin(run, stage, &inputs)?;
        let mut parts = vec![self.load_part(run, stage, style)?];
        if let Some(furnished) = furnished {
            parts.push(self.load_part(run, stage, furnished)?);
        }
        parts.push(ContentPart::text(prompts::moodboard(furnished.is_some())));

        let results = fan_out(1, vec![parts], |_, parts| -> Result<ItemOutcome, ItemFailure> {
            let (image, attempts) = self.generate_image(parts)?;
            let raw = self.save_generated(stage, &image)?;
            let mut warnings = Vec::new();
            let options = StandardizeOptions {
                force_landscape: true,
                keep_ratio: false,
            };
            let normalized = canvas::standardize(&raw, options);
            let artifact = self.settle(stage, &raw, normalized, &mut warnings);
            Ok(ItemOutcome {
                artifacts: vec![artifact],
                attempts,
                warnings,
            })
        });
        self.finish_stage(run, stage, clock, 1, results, Vec::new())
    }

    pub fn upscale(&self, run: &RunContext, images: &[PathBuf]) -> Result<StageOutput, StageError> {
        let stage = Stage::Upscale;
        let inputs = images.iter().map(PathBuf::as_path).collect::<Vec<_>>();
        let clock = self.begin(run, stage, &inputs)?;
        let Some(upscaler) = self.upscaler.as_ref() else {
            return Err(self.reject(run, stage, "upscaler is not configured".to_string()));
        };
        if images.is_empty() || images.len() > MAX_UPSCALE_IMAGES {
            return Err(self.reject(
                run,
                stage,
                format!(
                    "between 1 and {MAX_UPSCALE_IMAGES} images are required, got {}",
                    images.len()
                ),
            ));
        }
        if let Some(missing) = images.iter().find(|path| !path.is_file()) {
            return Err(self.reject(run, stage, format!("{} does not exist", missing.display())));
        }

        let limit = self.config.limits.upscale;
        let until = run.deadline.expires_at();
        let results = fan_out(
            limit,
            images.to_vec(),
            |_, image| -> Result<ItemOutcome, ItemFailure> {
                let upscaled = upscaler.upscale(&image, until)?;
                let mut artifacts = Vec::new();
                for result in upscaled {
                    let path = self.output_path(stage.file_prefix(), result.extension());
                    fs::write(&path, &result.data)
                        .with_context(|| format!("failed writing {}", path.display()))?;
                    artifacts.push(self.artifact(stage, &path, None, false));
                }
                Ok(ItemOutcome {
                    artifacts,
                    attempts: 1,
                    warnings: Vec::new(),
                })
            },
        );
        self.finish_stage(run, stage, clock, limit, results, Vec::new())
    }

    /// Chains every stage. Empty room and furnish failures end the run;
    /// later stages only add notes when they fail. `summary.json` is written
    /// either way.
    pub fn run_all(&self, request: &StagingRequest) -> Result<StagingRun> {
        let run = self.start_run()?;
        let mut record = RunRecord::default();
        let required = self.required_stages(&run, request, &mut record);
        let (empty_room, furnished, hero) = match required {
            Ok(required) => required,
            Err(err) => {
                let error = error_chain_text(&err, 512);
                if let Err(summary_err) = close_run(&run, &record, Some(&error)) {
                    warn!(run_id = %run.run_id, error = %summary_err, "failed writing summary");
                }
                return Err(err);
            }
        };

        let details = if request.details > 0 {
            record.optional(&run, self.detail_shots(&run, &hero, request.details))
        } else {
            None
        };
        let moodboard = if request.moodboard {
            record.optional(&run, self.moodboard(&run, &request.style, Some(&hero)))
        } else {
            None
        };
        let upscaled = if request.upscale {
            record.optional(&run, self.upscale(&run, &furnished.paths()))
        } else {
            None
        };

        let summary = close_run(&run, &record, None)?;
        Ok(StagingRun {
            run_id: run.run_id.clone(),
            run_dir: run.run_dir.clone(),
            empty_room,
            furnished,
            details,
            moodboard,
            upscaled,
            notes: record.notes,
            summary,
        })
    }

    fn required_stages(
        &self,
        run: &RunContext,
        request: &StagingRequest,
        record: &mut RunRecord,
    ) -> Result<(StageOutput, StageOutput, PathBuf)> {
        let empty_room = record.required(self.empty_room(run, &request.room))?;
        let empty_path = empty_room
            .primary()
            .map(Path::to_path_buf)
            .context("empty room stage returned no artifact")?;
        let furnished =
            record.required(self.furnish(run, &empty_path, &request.style, request.variants))?;
        let hero = furnished
            .primary()
            .map(Path::to_path_buf)
            .context("furnish stage returned no artifact")?;
        Ok((empty_room, furnished, hero))
    }

    fn begin(
        &self,
        run: &RunContext,
        stage: Stage,
        inputs: &[&Path],
    ) -> Result<StageClock, StageError> {
        if run.deadline.is_expired() {
            let budget_s = run.deadline.budget().as_secs();
            warn!(run_id = %run.run_id, stage = %stage, budget_s, "stage skipped past deadline");
            emit(run, "stage_failed", Some(stage), json!({ "reason": "deadline" }));
            return Err(StageError::DeadlineExceeded { stage, budget_s });
        }
        let inputs = inputs
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect::<Vec<_>>();
        emit(run, "stage_started", Some(stage), json!({ "inputs": inputs }));
        debug!(run_id = %run.run_id, stage = %stage, "stage started");
        Ok(StageClock {
            started_at: now_utc_iso(),
            inputs,
        })
    }

    fn reject(&self, run: &RunContext, stage: Stage, message: String) -> StageError {
        emit(
            run,
            "stage_failed",
            Some(stage),
            json!({ "reason": "input", "error": message }),
        );
        StageError::Input { stage, message }
    }

    fn load_part(
        &self,
        run: &RunContext,
        stage: Stage,
        path: &Path,
    ) -> Result<ContentPart, StageError> {
        ContentPart::image_from_path(path)
            .map_err(|err| self.reject(run, stage, error_chain_text(&err, 256)))
    }

    fn generate_image(&self, parts: Vec<ContentPart>) -> Result<(InlineImage, usize), ItemFailure> {
        let request = GenerationRequest::new(
            self.config.image_model.clone(),
            parts,
            self.config.request_timeout,
        )
        .with_system_instruction(prompts::SYSTEM_INSTRUCTION);
        let dispatched = self.dispatcher.dispatch(&request)?;
        let attempts = dispatched.report.attempts;
        let response = dispatched.response;
        if let Some(image) = response.first_image() {
            return Ok((image.clone(), attempts));
        }
        let message = match response.text.as_deref() {
            Some(text) => format!("model returned no image: {}", truncate_text(text, 200)),
            None => "model returned no image".to_string(),
        };
        Err(ItemFailure { message, attempts })
    }

    fn save_generated(&self, stage: Stage, image: &InlineImage) -> Result<PathBuf> {
        let path = self.output_path(stage.file_prefix(), image.extension());
        fs::write(&path, &image.data)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(path)
    }

    fn store_image(&self, prefix: &str, bytes: &[u8]) -> Result<PathBuf> {
        let format = image::guess_format(bytes).context("not a supported image format")?;
        let extension = format.extensions_str().first().copied().unwrap_or("png");
        let path = self.output_path(prefix, extension);
        fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
        Ok(path)
    }

    fn output_path(&self, prefix: &str, extension: &str) -> PathBuf {
        if let Err(err) = fs::create_dir_all(&self.config.output_dir) {
            warn!(
                dir = %self.config.output_dir.display(),
                error = %err,
                "failed creating output dir"
            );
        }
        self.config.output_dir.join(artifact_file_name(prefix, extension))
    }

    /// Turns a normalization outcome into an artifact. A raw file that was
    /// superseded by a PNG sibling is removed.
    fn settle(
        &self,
        stage: Stage,
        raw: &Path,
        outcome: CanvasOutcome,
        warnings: &mut Vec<String>,
    ) -> Artifact {
        if let CanvasOutcome::Degraded { reason, .. } = &outcome {
            warnings.push(format!("{} kept as generated: {reason}", raw.display()));
        }
        drop_superseded(raw, &outcome);
        let dims = outcome.report().map(|report| (report.width, report.height));
        self.artifact(stage, outcome.path(), dims, outcome.is_degraded())
    }

    fn artifact(
        &self,
        stage: Stage,
        path: &Path,
        dims: Option<(u32, u32)>,
        degraded: bool,
    ) -> Artifact {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        let dims = dims.or_else(|| image::image_dimensions(path).ok());
        Artifact {
            stage,
            url: self.public_url(&file_name),
            file_name,
            path: path.to_path_buf(),
            width: dims.map(|(width, _)| width),
            height: dims.map(|(_, height)| height),
            degraded,
        }
    }

    fn finish_stage(
        &self,
        run: &RunContext,
        stage: Stage,
        clock: StageClock,
        limit: usize,
        results: Vec<Result<ItemOutcome, ItemFailure>>,
        mut warnings: Vec<String>,
    ) -> Result<StageOutput, StageError> {
        let jobs = results.len();
        let mut artifacts = Vec::new();
        let mut failures = Vec::new();
        let mut attempts = 0;
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(outcome) => {
                    attempts += outcome.attempts;
                    warnings.extend(outcome.warnings);
                    for artifact in outcome.artifacts {
                        emit(
                            run,
                            "artifact_created",
                            Some(stage),
                            json!({
                                "file": artifact.file_name,
                                "url": artifact.url,
                                "width": artifact.width,
                                "height": artifact.height,
                                "degraded": artifact.degraded,
                            }),
                        );
                        artifacts.push(artifact);
                    }
                }
                Err(failure) => {
                    attempts += failure.attempts;
                    warn!(
                        run_id = %run.run_id,
                        stage = %stage,
                        item = idx,
                        error = %failure.message,
                        "stage item failed"
                    );
                    failures.push(format!("item {idx}: {}", failure.message));
                }
            }
        }

        let receipt_path = run
            .run_dir
            .join(format!("receipt-{}-{}.json", stage.as_str(), short_id()));
        let model = match stage {
            Stage::Upscale => "upscaler".to_string(),
            _ => self.config.image_model.clone(),
        };
        let receipt = StageReceipt {
            stage,
            model: Some(model),
            started_at: clock.started_at,
            finished_at: now_utc_iso(),
            inputs: clock.inputs,
            outputs: artifacts.iter().map(|artifact| artifact.file_name.clone()).collect(),
            failures: failures.clone(),
            attempts: attempts as u64,
            warnings: warnings.clone(),
        };
        let request = map_object(json!({
            "stage": stage.as_str(),
            "jobs": jobs,
            "limit": limit,
        }));
        let payload = build_receipt(&receipt, &request, &receipt_path);
        if let Err(err) = write_receipt(&receipt_path, &payload) {
            warn!(path = %receipt_path.display(), error = %err, "failed writing receipt");
        }

        if artifacts.is_empty() {
            emit(
                run,
                "stage_failed",
                Some(stage),
                json!({
                    "reason": "all_failed",
                    "failures": failures,
                    "receipt": receipt_path,
                }),
            );
            return Err(StageError::AllFailed { stage, failures });
        }
        emit(
            run,
            "stage_finished",
            Some(stage),
            json!({
                "artifacts": artifacts.len(),
                "failures": failures.len(),
                "attempts": attempts,
                "receipt": receipt_path,
            }),
        );
        info!(
            run_id = %run.run_id,
            stage = %stage,
            artifacts = artifacts.len(),
            failures = failures.len(),
            attempts,
            "stage finished"
        );
        Ok(StageOutput {
            stage,
            artifacts,
            failures,
            warnings,
            attempts,
            receipt: receipt_path,
        })
    }
}

/// `<prefix>-<utc timestamp>-<8 hex chars>.<extension>`
pub fn artifact_file_name(prefix: &str, extension: &str) -> String {
    format!(
        "{prefix}-{}-{}.{extension}",
        Utc::now().format("%Y%m%dT%H%M%S"),
        short_id()
    )
}

fn short_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

/// Writes `summary.json` and the closing `run_finished` event.
fn close_run(run: &RunContext, record: &RunRecord, error: Option<&str>) -> Result<PathBuf> {
    let path = run.run_dir.join("summary.json");
    let summary = RunSummary {
        run_id: run.run_id.clone(),
        started_at: run.started_at.clone(),
        finished_at: now_utc_iso(),
        stages: record.tallies.clone(),
        outputs: record.outputs.clone(),
    };
    let mut extra = map_object(json!({ "notes": record.notes }));
    if let Some(error) = error {
        extra.insert("error".to_string(), json!(error));
    }
    write_summary(&path, &summary, Some(&extra))?;
    emit(
        run,
        "run_finished",
        None,
        json!({
            "status": if error.is_some() { "failed" } else { "completed" },
            "artifacts": summary.total_artifacts(),
            "notes": record.notes.len(),
            "error": error,
            "summary": path,
        }),
    );
    info!(
        run_id = %run.run_id,
        artifacts = summary.total_artifacts(),
        failed = error.is_some(),
        elapsed_s = run.deadline.elapsed().as_secs_f64(),
        "run finished"
    );
    Ok(path)
}

/// Removes `raw` once a normalized copy has been written elsewhere.
fn drop_superseded(raw: &Path, outcome: &CanvasOutcome) {
    if let CanvasOutcome::Normalized(report) = outcome {
        if report.path != raw {
            if let Err(err) = fs::remove_file(raw) {
                debug!(path = %raw.display(), error = %err, "superseded file not removed");
            }
        }
    }
}

fn emit(run: &RunContext, event_type: &str, stage: Option<Stage>, payload: Value) {
    let payload = map_object(payload);
    let result = match stage {
        Some(stage) => run.events.emit_stage(event_type, stage, payload),
        None => run.events.emit(event_type, payload),
    };
    if let Err(err) = result {
        warn!(run_id = %run.run_id, event = event_type, error = %err, "failed writing event");
    }
}
