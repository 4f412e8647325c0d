mod config;
mod engine;
mod environment;
mod report;
mod runner;
mod stream;

pub use config::{
    BenchmarkConfig, EngineConfig, DEFAULT_CONCURRENCY_LEVELS, DEFAULT_MAX_TOKENS, DEFAULT_MODEL,
    DEFAULT_PROMPT, DEFAULT_PROMPT_TOKENS,
};
pub use engine::{GenerationEngine, GenerationStream, HttpEngine, PartialOutput, SamplingParams};
pub use environment::{detect_environment, EnvironmentInfo};
pub use report::{BenchmarkReport, FailureRecord, LevelSummary, RequestRecord, RequestStats};
pub use runner::{run_benchmark, run_level, run_request, LevelRun};
