//! Process exit codes. Part of the CLI contract; scripts branch on them.

use pqaef_core::{ErrorCategory, PipelineError};

pub const SUCCESS: i32 = 0;
pub const STAGE_FAILED: i32 = 1; // A stage implementation failed
pub const CONFIG_ERROR: i32 = 2; // Bad job file, unknown kind, missing reference, unreadable data
pub const RESOURCE_ERROR: i32 = 3; // Device lease or provider release failed
pub const TRANSPORT_THRESHOLD: i32 = 4; // Per-item transport failures above a stage's limit
pub const CANCELLED: i32 = 5; // Interrupted, or an internal error
pub const OUTPUT_ERROR: i32 = 6; // Run finished but results or report could not be written

pub fn for_error(err: &PipelineError) -> i32 {
    match err.category() {
        ErrorCategory::Configuration | ErrorCategory::MalformedRecord => CONFIG_ERROR,
        ErrorCategory::Resource => RESOURCE_ERROR,
        ErrorCategory::Transport => TRANSPORT_THRESHOLD,
        ErrorCategory::Stage => STAGE_FAILED,
        ErrorCategory::Cancelled => CANCELLED,
    }
}
