//! Provider handles: one constructed, resource-owning connection to an inference
//! backend.
//!
//! A backend is either in-process ([`LocalBackend`], blocking, processed in
//! sequential slices) or network-backed ([`Transport`], always fanned out through
//! the [`dispatcher`](crate::dispatcher)). A handle groups its workload by effective
//! parameters, runs each group on the backend, and returns one result per request
//! in input order.

use crate::cancel::CancelToken;
use crate::config::ProviderDescriptor;
use crate::devices::{DeviceLease, DevicePool};
use crate::dispatcher::{dispatch, DispatchOptions, DEFAULT_CONCURRENCY, DEFAULT_DRAIN_TIMEOUT};
use crate::errors::{ItemError, PipelineError, PipelineResult};
use crate::grouper::{self, Grouping, RequestGroup};
use crate::model::{ItemResult, ParamMap, Payload};
use crate::progress::ProgressSink;
use crate::registry::ProviderRegistry;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod echo;
pub mod http;

pub const DEFAULT_LOCAL_BATCH_SIZE: usize = 1;

/// In-process compute. Called from one thread at a time; never suspends.
pub trait LocalBackend: Send {
    /// Run one slice of prompts that share `params`. Returns one result per prompt.
    fn generate(&mut self, prompts: &[String], params: &ParamMap) -> Vec<ItemResult>;

    /// Free exclusively held resources. Called at most once, before the backend is dropped.
    fn release(&mut self) -> PipelineResult<()> {
        Ok(())
    }
}

/// Network endpoint. One call per request; failures are values.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, prompt: String, params: ParamMap) -> ItemResult;
}

/// What a provider factory builds.
pub enum Backend {
    InProcess(Box<dyn LocalBackend>),
    Network(Arc<dyn Transport>),
}

impl Backend {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProcess(_) => f.write_str("Backend::InProcess"),
            Self::Network(_) => f.write_str("Backend::Network"),
        }
    }
}

/// Inputs a provider factory sees.
#[derive(Debug, Clone, Copy)]
pub struct ProviderContext<'a> {
    pub name: &'a str,
    pub descriptor: &'a ProviderDescriptor,
    /// Devices leased for this handle (empty: CPU).
    pub devices: &'a [u32],
}

/// Run-wide state threaded into every handle.
#[derive(Clone, Default)]
pub struct ProviderEnv {
    pub devices: DevicePool,
    pub cancel: CancelToken,
    pub progress: Option<ProgressSink>,
    pub default_concurrency: Option<usize>,
    pub default_timeout: Option<Duration>,
    pub drain_timeout: Option<Duration>,
}

impl fmt::Debug for ProviderEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderEnv")
            .field("devices", &self.devices)
            .field("default_concurrency", &self.default_concurrency)
            .field("default_timeout", &self.default_timeout)
            .field("drain_timeout", &self.drain_timeout)
            .finish_non_exhaustive()
    }
}

/// Counters kept by a handle over its lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub requests: usize,
    pub failures: usize,
}

struct HandleState {
    backend: Option<Backend>,
    lease: Option<DeviceLease>,
}

/// A live provider. Created fresh per stage, released when the stage ends.
pub struct ProviderHandle {
    name: String,
    kind: String,
    defaults: ParamMap,
    batch_size: usize,
    network: bool,
    dispatch: DispatchOptions,
    state: Mutex<HandleState>,
    requests: AtomicUsize,
    failures: AtomicUsize,
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("network", &self.network)
            .field("released", &self.is_released())
            .finish()
    }
}

impl ProviderHandle {
    /// Build the backend registered for `descriptor.kind`, leasing its devices first.
    /// A failing factory drops the lease before the error is returned.
    pub fn initialize(
        name: &str,
        descriptor: &ProviderDescriptor,
        registry: &ProviderRegistry,
        env: &ProviderEnv,
    ) -> PipelineResult<Self> {
        let factory = registry.get(&descriptor.kind).ok_or_else(|| {
            PipelineError::config(format!(
                "provider '{}': unknown provider kind '{}'",
                name, descriptor.kind
            ))
        })?;

        let lease = env.devices.acquire(name, &descriptor.device_ids)?;
        let ctx = ProviderContext {
            name,
            descriptor,
            devices: lease.devices(),
        };
        let backend = factory(&ctx)?;
        let network = backend.is_network();

        let mut dispatch = DispatchOptions::default()
            .with_concurrency(
                descriptor
                    .concurrency
                    .or(env.default_concurrency)
                    .unwrap_or(DEFAULT_CONCURRENCY),
            )
            .with_drain_timeout(env.drain_timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT))
            .with_cancel(env.cancel.clone());
        if let Some(t) = descriptor.timeout().or(env.default_timeout) {
            dispatch = dispatch.with_call_timeout(t);
        }
        if let Some(sink) = &env.progress {
            dispatch = dispatch.with_progress(sink.clone());
        }

        info!(
            provider = name,
            kind = %descriptor.kind,
            network,
            devices = ?lease.devices(),
            "provider initialized"
        );

        Ok(Self {
            name: name.to_string(),
            kind: descriptor.kind.clone(),
            defaults: descriptor.generation.clone(),
            batch_size: descriptor.batch_size.unwrap_or(DEFAULT_LOCAL_BATCH_SIZE).max(1),
            network,
            dispatch,
            state: Mutex::new(HandleState {
                backend: Some(backend),
                lease: Some(lease),
            }),
            requests: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn is_network(&self) -> bool {
        self.network
    }

    pub fn defaults(&self) -> &ParamMap {
        &self.defaults
    }

    pub fn dispatch_options(&self) -> &DispatchOptions {
        &self.dispatch
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            requests: self.requests.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }

    pub fn is_released(&self) -> bool {
        self.state().backend.is_none()
    }

    fn state(&self) -> MutexGuard<'_, HandleState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn released_error(&self) -> PipelineError {
        PipelineError::resource(&self.name, "provider handle used after release")
    }

    /// Run every payload. The returned vector has one entry per payload, in order;
    /// malformed payloads and failed calls are error values at their position.
    pub async fn invoke(&self, payloads: Vec<Payload>) -> PipelineResult<Vec<ItemResult>> {
        let total = payloads.len();
        let grouping = grouper::group(&payloads, &self.defaults);
        drop(payloads);

        let mut table: Vec<Option<ItemResult>> = vec![None; total];
        for bad in &grouping.malformed {
            warn!(provider = %self.name, index = bad.index, reason = %bad.reason, "malformed request");
            table[bad.index] = Some(Err(ItemError::malformed(bad.reason.clone())));
        }

        if self.network {
            self.invoke_network(grouping, &mut table).await?;
        } else {
            self.invoke_local(&grouping, &mut table)?;
        }

        let results: Vec<ItemResult> = table
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(ItemError::internal("no result recorded"))))
            .collect();
        let failed = results.iter().filter(|r| r.is_err()).count();
        self.requests.fetch_add(total, Ordering::SeqCst);
        self.failures.fetch_add(failed, Ordering::SeqCst);
        debug!(provider = %self.name, total, failed, "invoke finished");
        Ok(results)
    }

    fn invoke_local(
        &self,
        grouping: &Grouping,
        table: &mut [Option<ItemResult>],
    ) -> PipelineResult<()> {
        let mut state = self.state();
        let Some(Backend::InProcess(backend)) = state.backend.as_mut() else {
            return Err(self.released_error());
        };

        for (signature, group) in &grouping.groups {
            debug!(provider = %self.name, group_size = group.len(), %signature, "running request group");
            for slice in group.members.chunks(self.batch_size) {
                let prompts: Vec<String> = slice.iter().map(|(_, p)| p.clone()).collect();
                let mut results = backend.generate(&prompts, &group.params);
                if results.len() != prompts.len() {
                    warn!(
                        provider = %self.name,
                        expected = prompts.len(),
                        got = results.len(),
                        "backend returned a misaligned slice"
                    );
                    results = prompts
                        .iter()
                        .map(|_| Err(ItemError::internal("backend returned a misaligned batch")))
                        .collect();
                }
                for ((index, _), result) in slice.iter().zip(results) {
                    table[*index] = Some(result);
                }
            }
        }
        Ok(())
    }

    async fn invoke_network(
        &self,
        grouping: Grouping,
        table: &mut [Option<ItemResult>],
    ) -> PipelineResult<()> {
        let transport = match self.state().backend.as_ref() {
            Some(Backend::Network(t)) => Arc::clone(t),
            _ => return Err(self.released_error()),
        };

        for (signature, group) in grouping.groups {
            let RequestGroup { params, members } = group;
            debug!(
                provider = %self.name,
                group_size = members.len(),
                concurrency = self.dispatch.concurrency_limit,
                %signature,
                "dispatching request group"
            );
            let (indices, prompts): (Vec<usize>, Vec<String>) = members.into_iter().unzip();
            let transport = Arc::clone(&transport);
            let results = dispatch(
                prompts,
                move |prompt: String| {
                    let transport = Arc::clone(&transport);
                    let params = params.clone();
                    async move { transport.send(prompt, params).await }
                },
                &self.dispatch,
            )
            .await;
            for (index, result) in indices.into_iter().zip(results) {
                table[index] = Some(result);
            }
        }
        Ok(())
    }

    /// Free the backend and its device lease. Idempotent; the resource is gone when
    /// this returns.
    pub fn release(&self) -> PipelineResult<()> {
        let mut state = self.state();
        let Some(backend) = state.backend.take() else {
            return Ok(());
        };

        let outcome = match backend {
            Backend::InProcess(mut local) => local.release(),
            Backend::Network(transport) => {
                if Arc::strong_count(&transport) > 1 {
                    warn!(provider = %self.name, "transport still referenced at release");
                }
                Ok(())
            }
        };
        if let Some(mut lease) = state.lease.take() {
            lease.release();
        }
        drop(state);

        let stats = self.stats();
        info!(
            provider = %self.name,
            requests = stats.requests,
            failures = stats.failures,
            "provider released"
        );
        outcome.map_err(|e| match e {
            err @ PipelineError::Resource { .. } => err,
            other => PipelineError::resource(&self.name, other.to_string()),
        })
    }
}

impl Drop for ProviderHandle {
    fn drop(&mut self) {
        if !self.is_released() {
            warn!(provider = %self.name, "provider dropped without release; releasing now");
            if let Err(e) = self.release() {
                warn!(provider = %self.name, error = %e, "release on drop failed");
            }
        }
    }
}
