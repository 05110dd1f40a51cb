use crate::cli::args::KindsArgs;
use crate::exit_codes;
use pqaef_core::Pipeline;
use serde_json::json;

pub fn run(args: KindsArgs) -> anyhow::Result<i32> {
    let pipeline = Pipeline::with_builtins();
    let stages = pipeline.stage_registry();
    let providers = pipeline.provider_registry();

    if args.json {
        let stage_list: Vec<_> = stages
            .kinds()
            .into_iter()
            .map(|k| json!({"kind": k, "slots": stages.required_slots(k)}))
            .collect();
        let out = json!({"stages": stage_list, "providers": providers.kinds()});
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(exit_codes::SUCCESS);
    }

    println!("stages:");
    for kind in stages.kinds() {
        let slots = stages.required_slots(kind);
        if slots.is_empty() {
            println!("  {kind}");
        } else {
            println!("  {kind} (slots: {})", slots.join(", "));
        }
    }
    println!("providers:");
    for kind in providers.kinds() {
        println!("  {kind}");
    }
    Ok(exit_codes::SUCCESS)
}
