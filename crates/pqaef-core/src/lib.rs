//! Pipeline execution engine for the PQAEF evaluation harness.
//!
//! A job is an ordered list of stages plus a map of named providers. The engine:
//!
//! - Resolves stage and provider kinds through registries
//! - Builds fresh provider handles for each stage and releases them when it ends
//! - Groups requests by effective generation parameters
//! - Fans network requests out under a concurrency cap, keeping input order
//! - Keeps per-item failures as tagged values instead of aborting the batch
//!
//! # Quick Start
//!
//! ```no_run
//! use pqaef_core::{Dataset, JobSpec, Pipeline};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let job = JobSpec::load(std::path::Path::new("job.yaml"))?;
//! let data = Dataset::new();
//! let outcome = Pipeline::with_builtins().run(&job, data).await?;
//! println!("{} records, {} item failures", outcome.dataset.len(), outcome.report.item_failures);
//! # Ok(())
//! # }
//! ```
//!
//! # Built-in kinds
//!
//! | Kind | Registry | Description |
//! |------|----------|-------------|
//! | `echo` | provider | In-process, returns the prompt (optional prefix) |
//! | `openai` | provider | OpenAI-compatible chat completions |
//! | `http` | provider | Generic JSON POST endpoint |
//! | `generate` | stage | Template a prompt per record and call the `llm` slot |
//! | `fingerprint` | stage | SHA-256 of a record field's canonical JSON |

pub mod cancel;
pub mod canonical;
pub mod config;
pub mod devices;
pub mod dispatcher;
pub mod errors;
pub mod grouper;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod providers;
pub mod registry;
pub mod stage;
pub mod stages;

pub use cancel::CancelToken;
pub use config::{JobSpec, ProviderDescriptor, Settings, StageDescriptor};
pub use devices::{DeviceLease, DevicePool};
pub use dispatcher::{dispatch, DispatchOptions};
pub use errors::{ErrorCategory, ItemError, ItemErrorKind, PipelineError, PipelineResult};
pub use grouper::{group, Grouping, RequestGroup};
pub use model::{Completion, Dataset, ItemResult, ParamMap, Payload, Record};
pub use pipeline::{Pipeline, RunOutcome, RunReport, StageReport};
pub use progress::{ProgressEvent, ProgressSink};
pub use providers::{
    Backend, LocalBackend, ProviderContext, ProviderEnv, ProviderHandle, ProviderStats, Transport,
};
pub use registry::{ProviderRegistry, StageRegistry};
pub use stage::{ProviderSet, Stage, StageContext, StageState};
