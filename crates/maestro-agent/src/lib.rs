pub mod context;
pub mod executor;
pub mod retry;
pub mod runner;

pub use context::{
    CompactionConfig, CompactionReport, Compactor, DigestSummarizer, RunContext, Summarizer,
};
pub use executor::{CapabilityExecutor, StepRequest, StepResponse};
pub use retry::{compute_backoff, RetryPolicy};
pub use runner::{LeafOutcome, LeafRunner};
