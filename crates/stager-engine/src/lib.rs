pub mod canvas;
pub mod config;
pub mod dispatch;
pub mod fanout;
pub mod gemini;
pub mod keys;
pub mod model;
pub mod pipeline;
pub mod prompts;
pub mod upscale;

mod util;

pub use config::EngineConfig;
pub use dispatch::{DispatchError, FailoverDispatcher};
pub use keys::{KeyPool, KeyPoolError};
pub use pipeline::{
    RunContext, StageError, StageOutput, StagingPipeline, StagingRequest, StagingRun,
};
