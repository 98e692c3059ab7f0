use clap::Args;
use engine::build_store;
use sandbox_process::check_prerequisites;
use tracing::{info, warn};

use super::ConfigArgs;
use crate::error::RunnerResult;

#[derive(Args)]
pub struct CheckArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

pub async fn run_check(args: CheckArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    info!(path = %args.config.config.display(), "config valid");

    let sandbox_config = config.process_sandbox_config();
    check_prerequisites(&sandbox_config, &config.sandbox.python).await?;
    info!(isolation = ?sandbox_config.isolation, "sandbox prerequisites met");

    // An unreachable bucket is reported but does not fail the check.
    let store = build_store(&config)?;
    let bucket = &config.resolver.default_bucket;
    match store.list_objects(bucket).await {
        Ok(objects) => info!(store = store.name(), bucket, objects = objects.len(), "uploads bucket reachable"),
        Err(e) => warn!(store = store.name(), bucket, error = %e, "uploads bucket not reachable"),
    }

    println!("ok");
    Ok(())
}
