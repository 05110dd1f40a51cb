//! Progress reporting for dispatches. The dispatcher emits done/total in completion
//! order; the binary layer consumes it through a sink.

use std::sync::Arc;

/// One progress update: how many items are done and the total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressEvent {
    pub done: usize,
    pub total: usize,
}

/// Sink for progress events. Called each time an item completes; `done` never
/// decreases within one dispatch. Implementations may throttle.
pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;
