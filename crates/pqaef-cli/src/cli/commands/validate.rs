use crate::cli::args::ValidateArgs;
use crate::exit_codes;
use crate::run_config::RunConfig;
use pqaef_core::{Pipeline, PipelineError};
use tracing::error;

pub fn run(args: ValidateArgs) -> anyhow::Result<i32> {
    let run = match RunConfig::load(&args.config) {
        Ok(run) => run,
        Err(e) => {
            error!(error = %e, "invalid run file");
            return Ok(exit_codes::for_error(&e));
        }
    };
    if args.strict && !run.ignored_keys.is_empty() {
        let e = PipelineError::config(format!("unknown keys: {}", run.ignored_keys.join(", ")));
        error!(error = %e, "invalid run file");
        return Ok(exit_codes::for_error(&e));
    }

    let pipeline = Pipeline::with_builtins();
    if let Err(e) = pipeline.validate(&run.config.job()) {
        error!(error = %e, "invalid job");
        return Ok(exit_codes::for_error(&e));
    }

    for source in &run.config.data {
        for path in source.paths.iter() {
            let resolved = run.resolve(path);
            if !resolved.exists() {
                let e = PipelineError::config(format!(
                    "data path does not exist: {}",
                    resolved.display()
                ));
                error!(error = %e, "invalid data source");
                return Ok(exit_codes::for_error(&e));
            }
        }
    }

    println!(
        "ok: {} provider(s), {} stage(s), {} data source(s)",
        run.config.providers.len(),
        run.config.stages.len(),
        run.config.data.len()
    );
    Ok(exit_codes::SUCCESS)
}
