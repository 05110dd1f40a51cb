use crate::cli::args::RunArgs;
use crate::dumper::{JsonDumper, RunSummary};
use crate::exit_codes;
use crate::loader;
use crate::run_config::{RunConfig, DEFAULT_CHUNK_SIZE, DEFAULT_FILE_PREFIX};
use chrono::Utc;
use pqaef_core::{Pipeline, ProgressEvent, ProgressSink};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Logs at every tenth of a dispatch, plus the final item.
fn progress_logger() -> ProgressSink {
    Arc::new(|ev: ProgressEvent| {
        if ev.total == 0 {
            return;
        }
        let step = |n: usize| n * 10 / ev.total;
        if ev.done == ev.total || (ev.done > 0 && step(ev.done) != step(ev.done - 1)) {
            info!(done = ev.done, total = ev.total, "progress");
        }
    })
}

pub async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let started_at = Utc::now();
    let run = match RunConfig::load(&args.config) {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "failed to load run file");
            return Ok(exit_codes::for_error(&e));
        }
    };
    let data = match loader::load_sources(&run) {
        Ok(data) => data,
        Err(e) => {
            error!(error = %e, "failed to load data");
            return Ok(exit_codes::for_error(&e));
        }
    };

    let pipeline = Pipeline::with_builtins().with_progress(progress_logger());
    let cancel = pipeline.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let job = run.config.job();
    let (result, report) = pipeline.run_reported(&job, data).await;
    interrupt.abort();

    let output_dir = if args.no_output {
        None
    } else {
        run.output_dir(args.output_dir.as_deref())
    };
    let pipeline_code = match &result {
        Ok(_) => exit_codes::SUCCESS,
        Err(e) => exit_codes::for_error(e),
    };
    let Some(dir) = output_dir else {
        return Ok(pipeline_code);
    };

    let (prefix, chunk_size) = run
        .config
        .output
        .as_ref()
        .map(|o| (o.file_prefix.clone(), o.chunk_size))
        .unwrap_or_else(|| (DEFAULT_FILE_PREFIX.to_string(), DEFAULT_CHUNK_SIZE));
    let dumper = JsonDumper::new(dir, prefix, chunk_size);

    let mut code = pipeline_code;
    let output_files = match &result {
        Ok(dataset) => dumper.dump(dataset).unwrap_or_else(|e| {
            error!(error = %format!("{e:#}"), "failed to write results");
            code = exit_codes::OUTPUT_ERROR;
            Vec::new()
        }),
        Err(_) => Vec::new(),
    };
    let summary = RunSummary {
        config: args.config.clone(),
        started_at,
        finished_at: Utc::now(),
        output_files,
        report,
    };
    match dumper.write_report(&summary) {
        Ok(path) => info!(report = %path.display(), "run report written"),
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to write run report");
            if code == exit_codes::SUCCESS {
                code = exit_codes::OUTPUT_ERROR;
            }
        }
    }
    Ok(code)
}
