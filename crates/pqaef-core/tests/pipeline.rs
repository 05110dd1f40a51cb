//! Integration tests for the orchestrator: provider lifecycle, stage ordering,
//! failure propagation and the in-process + network scenario.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pqaef_core::model::payload;
use pqaef_core::providers::echo;
use pqaef_core::{
    Backend, Completion, Dataset, ErrorCategory, ItemError, ItemResult, JobSpec, LocalBackend,
    ParamMap, Pipeline, PipelineError, PipelineResult, ProgressEvent, ProviderContext,
    ProviderDescriptor, ProviderRegistry, Stage, StageContext, StageDescriptor, StageRegistry,
    StageState, Transport,
};
use serde_json::{json, Value};

#[derive(Default)]
struct Counters {
    inits: AtomicUsize,
    releases: AtomicUsize,
    finalizes: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Counters {
    fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
}

/// In-process backend: doubles the integer prompt.
struct Doubler {
    counters: Arc<Counters>,
}

impl LocalBackend for Doubler {
    fn generate(&mut self, prompts: &[String], _params: &ParamMap) -> Vec<ItemResult> {
        prompts
            .iter()
            .map(|p| match p.parse::<i64>() {
                Ok(n) => Ok(Completion::new("doubler", (n * 2).to_string())),
                Err(e) => Err(ItemError::malformed(e.to_string())),
            })
            .collect()
    }
}

impl Drop for Doubler {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Network double: answers `processed:{prompt}`, fails on `fail_on`, tracks peak
/// concurrency.
struct Remote {
    counters: Arc<Counters>,
    fail_on: String,
}

#[async_trait]
impl Transport for Remote {
    async fn send(&self, prompt: String, _params: ParamMap) -> ItemResult {
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if prompt == self.fail_on {
            return Err(ItemError::transport("server_error", "status 500: boom"));
        }
        Ok(Completion::new("remote", format!("processed:{}", prompt)))
    }
}

impl Drop for Remote {
    fn drop(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Writes `2 * value` back into `value` through the `compute` slot.
struct DoubleStage {
    ctx: StageContext,
}

#[async_trait]
impl Stage for DoubleStage {
    async fn run(&mut self, mut data: Dataset) -> PipelineResult<Dataset> {
        let compute = self.ctx.providers.require("compute")?;
        let payloads: Vec<_> = data
            .iter()
            .map(|r| payload(r["value"].to_string(), &ParamMap::new()))
            .collect();
        let results = compute.invoke(payloads).await?;
        for (i, result) in results.into_iter().enumerate() {
            let text = result.map_err(|e| PipelineError::execution(anyhow::anyhow!(e)))?.text;
            let n: i64 = text.parse().map_err(PipelineError::execution)?;
            if let Some(rec) = data.record_mut(i) {
                rec.insert("value".into(), json!(n));
            }
        }
        Ok(data)
    }
}

/// Counts finalize calls; fails `run` when `explode` is set.
struct ProbeStage {
    counters: Arc<Counters>,
    explode: bool,
}

#[async_trait]
impl Stage for ProbeStage {
    async fn run(&mut self, data: Dataset) -> PipelineResult<Dataset> {
        if self.explode {
            return Err(PipelineError::execution(anyhow::anyhow!("probe exploded")));
        }
        Ok(data)
    }

    fn finalize(&mut self) -> PipelineResult<()> {
        self.counters.finalizes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn pipeline(counters: &Arc<Counters>) -> Pipeline {
    let mut providers = ProviderRegistry::with_builtins();
    let c = counters.clone();
    providers.register("doubler", move |_ctx: &ProviderContext<'_>| {
        c.inits.fetch_add(1, Ordering::SeqCst);
        Ok(Backend::InProcess(Box::new(Doubler { counters: c.clone() })))
    });
    let c = counters.clone();
    providers.register("remote", move |ctx: &ProviderContext<'_>| {
        c.inits.fetch_add(1, Ordering::SeqCst);
        let fail_on = ctx.descriptor.config_str("fail_on").unwrap_or_default().to_string();
        Ok(Backend::Network(Arc::new(Remote {
            counters: c.clone(),
            fail_on,
        })))
    });
    providers.register("broken", |ctx: &ProviderContext<'_>| {
        Err(PipelineError::resource(ctx.name, "no accelerator memory"))
    });

    let mut stages = StageRegistry::with_builtins();
    stages.register("double", &["compute"], |ctx| Ok(Box::new(DoubleStage { ctx })));
    let c = counters.clone();
    stages.register("probe", &[], move |_ctx| {
        Ok(Box::new(ProbeStage {
            counters: c.clone(),
            explode: false,
        }))
    });
    let c = counters.clone();
    stages.register("explode", &[], move |_ctx| {
        Ok(Box::new(ProbeStage {
            counters: c.clone(),
            explode: true,
        }))
    });

    Pipeline::new(providers, stages)
}

fn records(n: i64) -> Dataset {
    (0..n)
        .map(|i| json!({"id": i, "value": i}).as_object().cloned().unwrap())
        .collect()
}

fn scenario_job() -> JobSpec {
    let mut job = JobSpec::default();
    job.providers
        .insert("cpu".into(), ProviderDescriptor::new("doubler"));
    job.providers.insert(
        "api".into(),
        ProviderDescriptor::new("remote")
            .with_config("fail_on", json!("14"))
            .with_concurrency(3),
    );
    job.stages
        .push(StageDescriptor::new("double").with_provider("compute", "cpu"));
    job.stages.push(
        StageDescriptor::new("generate")
            .with_param("template", json!("{value}"))
            .with_provider("llm", "api"),
    );
    job
}

#[tokio::test]
async fn test_two_stage_scenario_isolates_record_seven() {
    let counters = Arc::new(Counters::default());
    let outcome = pipeline(&counters)
        .run(&scenario_job(), records(10))
        .await
        .expect("run should succeed");

    let data = outcome.dataset;
    assert_eq!(data.len(), 10);
    for (i, rec) in data.iter().enumerate() {
        assert_eq!(rec["id"], json!(i));
        assert_eq!(rec["value"], json!(i * 2));
        if i == 7 {
            assert_eq!(rec["error"]["kind"], json!("transport"));
            assert_eq!(rec["error"]["code"], json!("server_error"));
            assert!(rec.get("generated").is_none());
        } else {
            assert_eq!(rec["generated"], json!(format!("processed:{}", i * 2)));
            assert!(rec.get("error").is_none());
        }
    }

    let report = outcome.report;
    assert!(report.succeeded);
    assert_eq!(report.item_failures, 1);
    assert_eq!(report.stages[0].item_failures, 0);
    assert_eq!(report.stages[1].item_failures, 1);
    assert!(counters.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(counters.inits(), 2);
    assert_eq!(counters.releases(), 2);
}

#[tokio::test]
async fn test_concurrency_bound_under_burst() {
    let counters = Arc::new(Counters::default());
    let mut job = JobSpec::default();
    job.providers.insert(
        "api".into(),
        ProviderDescriptor::new("remote").with_concurrency(4),
    );
    job.stages.push(
        StageDescriptor::new("generate")
            .with_param("template", json!("{value}"))
            .with_provider("llm", "api"),
    );

    let outcome = pipeline(&counters).run(&job, records(200)).await.unwrap();
    assert_eq!(outcome.dataset.len(), 200);
    let peak = counters.peak.load(Ordering::SeqCst);
    assert!(peak <= 4, "peak in-flight {} exceeded limit", peak);
    assert!(peak >= 2, "burst should overlap calls, peak was {}", peak);
}

#[tokio::test]
async fn test_unknown_stage_kind_fails_before_any_provider() {
    let counters = Arc::new(Counters::default());
    let mut job = scenario_job();
    job.stages.push(StageDescriptor::new("summarize"));

    let err = pipeline(&counters)
        .run(&job, records(3))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
    assert!(err.to_string().contains("unknown stage kind 'summarize'"));
    assert_eq!(counters.inits(), 0);
    assert_eq!(counters.releases(), 0);
}

#[tokio::test]
async fn test_failing_stage_still_releases_its_providers() {
    let counters = Arc::new(Counters::default());
    let mut job = JobSpec::default();
    job.providers
        .insert("cpu".into(), ProviderDescriptor::new("doubler"));
    job.stages.push(StageDescriptor::new("probe"));
    job.stages
        .push(StageDescriptor::new("explode").with_provider("unused", "cpu"));
    job.stages.push(StageDescriptor::new("probe"));

    let (result, report) = pipeline(&counters)
        .run_reported(&job, records(2))
        .await;
    let err = result.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Stage);
    assert_eq!(err.stage(), Some((1, "explode")));
    assert!(err.to_string().contains("probe exploded"));

    assert_eq!(counters.inits(), 1);
    assert_eq!(counters.releases(), 1);
    // Only the first probe completed; the third never started.
    assert_eq!(counters.finalizes.load(Ordering::SeqCst), 1);
    assert_eq!(report.stages.len(), 2);
    assert_eq!(report.stages[0].state, StageState::Completed);
    assert_eq!(report.stages[1].state, StageState::Failed);
    assert!(!report.succeeded);
}

#[tokio::test]
async fn test_failed_provider_init_releases_earlier_handles() {
    let counters = Arc::new(Counters::default());
    let mut job = JobSpec::default();
    job.providers
        .insert("cpu".into(), ProviderDescriptor::new("doubler"));
    job.providers
        .insert("gpu".into(), ProviderDescriptor::new("broken"));
    job.stages.push(
        StageDescriptor::new("probe")
            .with_provider("a_first", "cpu")
            .with_provider("b_second", "gpu"),
    );

    let (result, report) = pipeline(&counters).run_reported(&job, records(1)).await;
    let err = result.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Resource);
    assert_eq!(err.stage(), Some((0, "probe")));
    assert_eq!(counters.inits(), 1);
    assert_eq!(counters.releases(), 1);
    assert_eq!(report.stages[0].state, StageState::Failed);
    assert_eq!(report.error_category, Some(ErrorCategory::Resource));
}

#[tokio::test]
async fn test_device_lease_is_free_again_for_the_next_stage() {
    let mut job = JobSpec::default();
    let mut gpu = ProviderDescriptor::new(echo::KIND).with_config("prefix", json!("A:"));
    gpu.device_ids = vec![0];
    let mut gpu_b = ProviderDescriptor::new(echo::KIND).with_config("prefix", json!("B:"));
    gpu_b.device_ids = vec![0];
    job.providers.insert("model_a".into(), gpu);
    job.providers.insert("model_b".into(), gpu_b);
    job.stages.push(
        StageDescriptor::new("generate")
            .with_param("template", json!("{id}"))
            .with_param("output_field", json!("a"))
            .with_provider("llm", "model_a"),
    );
    job.stages.push(
        StageDescriptor::new("generate")
            .with_param("template", json!("{a}"))
            .with_param("output_field", json!("b"))
            .with_provider("llm", "model_b"),
    );

    let outcome = Pipeline::with_builtins()
        .run(&job, records(2))
        .await
        .expect("second stage should lease device 0");
    let rec = outcome.dataset.get(1).unwrap();
    assert_eq!(rec["b"], json!("B:A:1"));
}

#[tokio::test]
async fn test_stage_output_does_not_alias_caller_records() {
    let input = records(2);
    let kept = input.clone();

    let mut job = JobSpec::default();
    job.stages.push(StageDescriptor::new("fingerprint"));
    let outcome = Pipeline::with_builtins().run(&job, input).await.unwrap();

    assert!(outcome.dataset.get(0).unwrap().contains_key("hash"));
    assert!(!kept.get(0).unwrap().contains_key("hash"));
}

#[tokio::test]
async fn test_records_rejected_before_the_provider_are_counted() {
    let mut job = JobSpec::default();
    job.providers
        .insert("bot".into(), ProviderDescriptor::new(echo::KIND));
    job.stages.push(
        StageDescriptor::new("generate")
            .with_param("template", json!("{q}"))
            .with_provider("llm", "bot"),
    );
    let data = Dataset::from_records([
        json!({"q": "a"}).as_object().cloned().unwrap(),
        json!({"other": 1}).as_object().cloned().unwrap(),
    ]);

    let outcome = Pipeline::with_builtins().run(&job, data).await.unwrap();
    let missing = outcome.dataset.get(1).unwrap();
    assert_eq!(missing["error"]["code"], json!("malformed_record"));
    assert_eq!(outcome.dataset.get(0).unwrap()["generated"], json!("a"));
    assert_eq!(outcome.report.stages[0].item_failures, 1);
    assert_eq!(outcome.report.item_failures, 1);
    assert!(outcome.report.succeeded);
}

#[tokio::test]
async fn test_error_rate_threshold_escalates() {
    let counters = Arc::new(Counters::default());
    let mut job = scenario_job();
    job.stages[1]
        .params
        .insert("max_error_rate".into(), Value::from(0.05));

    let err = pipeline(&counters)
        .run(&job, records(10))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Transport);
    assert_eq!(err.stage(), Some((1, "generate")));
    assert_eq!(counters.inits(), counters.releases());
}

#[tokio::test]
async fn test_cancel_mid_run_resolves_to_cancelled() {
    let counters = Arc::new(Counters::default());
    let pipeline = pipeline(&counters);
    let cancel = pipeline.cancel_token();
    let seen = Arc::new(Mutex::new(0usize));

    let mut job = JobSpec::default();
    job.providers.insert(
        "api".into(),
        ProviderDescriptor::new("remote").with_concurrency(1),
    );
    job.stages.push(
        StageDescriptor::new("generate")
            .with_param("template", json!("{value}"))
            .with_provider("llm", "api"),
    );

    let seen_in_sink = seen.clone();
    let pipeline = pipeline.with_progress(Arc::new(move |ev: ProgressEvent| {
        let mut s = seen_in_sink.lock().unwrap();
        *s = ev.done;
        if ev.done == 3 {
            cancel.cancel();
        }
    }));

    let err = pipeline.run(&job, records(50)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Cancelled);
    assert!(*seen.lock().unwrap() < 50);
    assert_eq!(counters.inits(), counters.releases());
}
