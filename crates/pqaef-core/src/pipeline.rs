//! Pipeline orchestrator: resolves a [`JobSpec`] into stages and providers and runs
//! them strictly in order.
//!
//! Per stage: fresh provider handles, build, run, finalize, then release every handle
//! and reclaim the device pool, on every exit path. Only one stage's providers are
//! ever live.

use crate::cancel::CancelToken;
use crate::config::{JobSpec, StageDescriptor};
use crate::devices::DevicePool;
use crate::errors::{ErrorCategory, PipelineError, PipelineResult};
use crate::model::Dataset;
use crate::progress::ProgressSink;
use crate::providers::{ProviderEnv, ProviderHandle};
use crate::registry::{ProviderRegistry, StageRegistry};
use crate::stage::{ProviderSet, StageContext, StageState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    pub index: usize,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: StageState,
    pub records_in: usize,
    pub records_out: usize,
    /// Failed items reported by this stage's providers.
    pub item_failures: usize,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageReport {
    fn new(index: usize, desc: &StageDescriptor, records_in: usize) -> Self {
        Self {
            index,
            kind: desc.kind.clone(),
            name: desc.name.clone(),
            state: StageState::Uninitialized,
            records_in,
            records_out: 0,
            item_failures: 0,
            duration_ms: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub stages: Vec<StageReport>,
    pub records_in: usize,
    pub records_out: usize,
    pub item_failures: usize,
    pub duration_ms: u64,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub dataset: Dataset,
    pub report: RunReport,
}

pub struct Pipeline {
    providers: ProviderRegistry,
    stages: StageRegistry,
    cancel: CancelToken,
    progress: Option<ProgressSink>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("providers", &self.providers)
            .field("stages", &self.stages)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl Pipeline {
    pub fn new(providers: ProviderRegistry, stages: StageRegistry) -> Self {
        Self {
            providers,
            stages,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    pub fn with_builtins() -> Self {
        Self::new(ProviderRegistry::with_builtins(), StageRegistry::with_builtins())
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn provider_registry(&self) -> &ProviderRegistry {
        &self.providers
    }

    pub fn stage_registry(&self) -> &StageRegistry {
        &self.stages
    }

    /// Check the whole job against the registries without constructing anything.
    pub fn validate(&self, job: &JobSpec) -> PipelineResult<()> {
        job.check()?;

        for (name, p) in &job.providers {
            if !self.providers.contains(&p.kind) {
                return Err(PipelineError::config(format!(
                    "provider '{}': unknown provider kind '{}' (registered: {})",
                    name,
                    p.kind,
                    self.providers.kinds().join(", ")
                )));
            }
        }

        for (index, stage) in job.stages.iter().enumerate() {
            if !self.stages.contains(&stage.kind) {
                return Err(PipelineError::config(format!(
                    "stage #{}: unknown stage kind '{}' (registered: {})",
                    index,
                    stage.kind,
                    self.stages.kinds().join(", ")
                )));
            }
            for slot in self.stages.required_slots(&stage.kind) {
                if !stage.providers.contains_key(slot) {
                    return Err(PipelineError::config(format!(
                        "stage #{} ({}): required provider slot '{}' is not bound",
                        index,
                        stage.label(),
                        slot
                    )));
                }
            }
        }
        Ok(())
    }

    fn env_for(&self, job: &JobSpec) -> ProviderEnv {
        ProviderEnv {
            devices: DevicePool::new(job.visible_devices()),
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
            default_concurrency: job.settings.concurrency,
            default_timeout: job.settings.timeout_secs.map(Duration::from_secs),
            drain_timeout: job.settings.drain_timeout_secs.map(Duration::from_secs),
        }
    }

    pub async fn run(&self, job: &JobSpec, data: Dataset) -> PipelineResult<RunOutcome> {
        let (result, report) = self.run_reported(job, data).await;
        result.map(|dataset| RunOutcome { dataset, report })
    }

    /// Like [`Pipeline::run`], but the report is returned on failure too.
    pub async fn run_reported(
        &self,
        job: &JobSpec,
        data: Dataset,
    ) -> (PipelineResult<Dataset>, RunReport) {
        let started = Instant::now();
        let mut report = RunReport {
            records_in: data.len(),
            ..RunReport::default()
        };

        let result = match self.validate(job) {
            Ok(()) => self.run_stages(job, data, &mut report).await,
            Err(e) => Err(e),
        };

        report.duration_ms = started.elapsed().as_millis() as u64;
        report.item_failures = report.stages.iter().map(|s| s.item_failures).sum();
        match &result {
            Ok(out) => {
                report.succeeded = true;
                report.records_out = out.len();
                info!(
                    stages = report.stages.len(),
                    records = out.len(),
                    item_failures = report.item_failures,
                    duration_ms = report.duration_ms,
                    "pipeline finished"
                );
            }
            Err(e) => {
                report.error_category = Some(e.category());
                report.error = Some(e.to_string());
                error!(category = %e.category(), error = %e, "pipeline aborted");
            }
        }
        (result, report)
    }

    async fn run_stages(
        &self,
        job: &JobSpec,
        mut data: Dataset,
        report: &mut RunReport,
    ) -> PipelineResult<Dataset> {
        let env = self.env_for(job);
        info!(
            stages = job.stages.len(),
            providers = job.providers.len(),
            records = data.len(),
            visible_devices = ?env.devices.visible(),
            "pipeline starting"
        );

        for (index, desc) in job.stages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled.in_stage(index, &desc.kind));
            }
            let (result, stage_report) = self.run_stage(index, desc, job, data, &env).await;
            report.stages.push(stage_report);
            data = result.map_err(|e| e.in_stage(index, &desc.kind))?;
        }
        Ok(data)
    }

    async fn run_stage(
        &self,
        index: usize,
        desc: &StageDescriptor,
        job: &JobSpec,
        data: Dataset,
        env: &ProviderEnv,
    ) -> (PipelineResult<Dataset>, StageReport) {
        let started = Instant::now();
        let mut report = StageReport::new(index, desc, data.len());
        let mut handles: Vec<Arc<ProviderHandle>> = Vec::new();
        info!(stage = index, kind = %desc.kind, label = desc.label(), records = data.len(), "stage starting");

        let mut result = self
            .drive_stage(index, desc, job, data, env, &mut handles, &mut report)
            .await;

        report.item_failures += handles.iter().map(|h| h.stats().failures).sum::<usize>();
        for handle in handles.drain(..) {
            if let Err(e) = handle.release() {
                warn!(stage = index, provider = %handle.name(), error = %e, "provider release failed");
                if result.is_ok() {
                    report.state = StageState::Failed;
                    result = Err(e);
                }
            }
        }
        let reclaimed = env.devices.reclaim();
        if !reclaimed.stale.is_empty() {
            warn!(stage = index, stale = reclaimed.stale.len(), "stale device leases reclaimed");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(out) => {
                report.records_out = out.len();
                info!(
                    stage = index,
                    kind = %desc.kind,
                    records = out.len(),
                    item_failures = report.item_failures,
                    duration_ms = report.duration_ms,
                    "stage completed"
                );
            }
            Err(e) => {
                report.error = Some(e.to_string());
                warn!(stage = index, kind = %desc.kind, state = %report.state, error = %e, "stage failed");
            }
        }
        (result, report)
    }

    /// Steps 1-4 of a stage. Every handle created is pushed into `handles` before it
    /// can be used, so the caller can release it whatever happens here.
    #[allow(clippy::too_many_arguments)]
    async fn drive_stage(
        &self,
        index: usize,
        desc: &StageDescriptor,
        job: &JobSpec,
        data: Dataset,
        env: &ProviderEnv,
        handles: &mut Vec<Arc<ProviderHandle>>,
        report: &mut StageReport,
    ) -> PipelineResult<Dataset> {
        let factory = self
            .stages
            .get(&desc.kind)
            .ok_or_else(|| PipelineError::config(format!("unknown stage kind '{}'", desc.kind)))
            .inspect_err(|_| report.state = StageState::Failed)?;

        // One handle per provider name, even if it fills several slots.
        let mut by_name: BTreeMap<&str, Arc<ProviderHandle>> = BTreeMap::new();
        let mut set = ProviderSet::new();
        for (slot, name) in &desc.providers {
            let handle = match by_name.get(name.as_str()) {
                Some(h) => Arc::clone(h),
                None => {
                    let pdesc = job
                        .providers
                        .get(name)
                        .ok_or_else(|| {
                            PipelineError::config(format!(
                                "slot '{}' references unknown provider '{}'",
                                slot, name
                            ))
                        })
                        .inspect_err(|_| report.state = StageState::Failed)?;
                    let handle = ProviderHandle::initialize(name, pdesc, &self.providers, env)
                        .inspect_err(|_| report.state = StageState::Failed)?;
                    let handle = Arc::new(handle);
                    handles.push(Arc::clone(&handle));
                    by_name.insert(name.as_str(), Arc::clone(&handle));
                    handle
                }
            };
            set.insert(slot.clone(), handle);
        }
        drop(by_name);

        let ctx = StageContext {
            index,
            kind: desc.kind.clone(),
            params: desc.params.clone(),
            providers: set,
            cancel: self.cancel.clone(),
        };
        let mut stage = factory(ctx).inspect_err(|_| report.state = StageState::Failed)?;
        report.state = StageState::Resolved;
        debug!(stage = index, providers = handles.len(), "stage resolved");

        report.state = StageState::Running;
        let out = stage.run(data).await;
        report.item_failures = stage.item_failures();
        let out = match out {
            Ok(out) => out,
            Err(e) => {
                report.state = StageState::Failed;
                return Err(e);
            }
        };
        report.state = StageState::Completed;

        stage.finalize()?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderDescriptor;
    use serde_json::json;

    #[test]
    fn validate_names_the_unknown_kind() {
        let mut job = JobSpec::default();
        job.stages.push(StageDescriptor::new("fingerprint"));
        job.stages.push(StageDescriptor::new("summarize"));
        let err = Pipeline::with_builtins().validate(&job).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("stage #1"));
        assert!(msg.contains("unknown stage kind 'summarize'"));
    }

    #[test]
    fn validate_requires_bound_slots() {
        let mut job = JobSpec::default();
        job.stages
            .push(StageDescriptor::new("generate").with_param("template", json!("{q}")));
        let err = Pipeline::with_builtins().validate(&job).unwrap_err();
        assert!(err.to_string().contains("slot 'llm' is not bound"));
    }

    #[test]
    fn validate_rejects_unknown_provider_kind() {
        let mut job = JobSpec::default();
        job.providers
            .insert("m".into(), ProviderDescriptor::new("vllm"));
        let err = Pipeline::with_builtins().validate(&job).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
        assert!(err.to_string().contains("unknown provider kind 'vllm'"));
    }

    #[tokio::test]
    async fn report_is_filled_on_success() {
        let mut job = JobSpec::default();
        job.providers.insert(
            "local".into(),
            ProviderDescriptor::new("echo").with_config("prefix", json!("> ")),
        );
        job.stages.push(
            StageDescriptor::new("generate")
                .with_param("template", json!("{q}"))
                .with_provider("llm", "local"),
        );
        job.stages.push(StageDescriptor::new("fingerprint"));

        let data = Dataset::from_records([json!({"q": "a"}).as_object().cloned().unwrap()]);
        let outcome = Pipeline::with_builtins().run(&job, data).await.unwrap();

        assert_eq!(outcome.dataset.get(0).unwrap()["generated"], json!("> a"));
        assert!(outcome.dataset.get(0).unwrap().contains_key("hash"));
        let report = outcome.report;
        assert!(report.succeeded);
        assert_eq!(report.stages.len(), 2);
        assert!(report
            .stages
            .iter()
            .all(|s| s.state == StageState::Completed && s.records_out == 1));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_stage() {
        let mut job = JobSpec::default();
        job.stages.push(StageDescriptor::new("fingerprint"));
        let pipeline = Pipeline::with_builtins();
        pipeline.cancel_token().cancel();

        let (result, report) = pipeline.run_reported(&job, Dataset::new()).await;
        let err = result.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Cancelled);
        assert_eq!(err.stage(), Some((0, "fingerprint")));
        assert!(report.stages.is_empty());
        assert_eq!(report.error_category, Some(ErrorCategory::Cancelled));
    }
}
