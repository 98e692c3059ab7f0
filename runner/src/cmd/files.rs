use clap::Args;
use engine::build_store;
use storage::combined_listing;

use super::{ConfigArgs, print_json};
use crate::error::RunnerResult;

#[derive(Args)]
pub struct FilesArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Public bucket to list after the uploads bucket
    #[arg(long)]
    public_bucket: Option<String>,
    /// List a single bucket as-is instead of the combined catalog
    #[arg(long, conflicts_with = "public_bucket")]
    bucket: Option<String>,
}

pub async fn run_files(args: FilesArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    let store = build_store(&config)?;

    if let Some(bucket) = &args.bucket {
        let objects = store.list_objects(bucket).await?;
        return print_json(&objects);
    }

    let entries = combined_listing(
        store.as_ref(),
        &config.resolver.default_bucket,
        args.public_bucket.as_deref(),
    )
    .await;
    print_json(&entries)
}
