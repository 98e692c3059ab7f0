use clap::Args;
use engine::preview::preview_object;
use engine::{FileReference, build_store};

use super::{ConfigArgs, print_json};
use crate::error::RunnerResult;

#[derive(Args)]
pub struct PreviewArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// File reference, `uploaded:<key>` or `public:<bucket>/<key>`
    reference: FileReference,
    /// Number of rows to show
    #[arg(long, default_value_t = 10)]
    rows: usize,
}

pub async fn run_preview(args: PreviewArgs) -> RunnerResult<()> {
    let config = args.config.load().await?;
    let store = build_store(&config)?;
    let bucket = args.reference.bucket_or(&config.resolver.default_bucket);

    let preview = preview_object(
        store.as_ref(),
        bucket,
        &args.reference.key,
        args.rows,
        config.resolver.max_bytes_per_request,
    )
    .await?;
    print_json(&preview)
}
