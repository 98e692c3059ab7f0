use std::process::ExitCode;

use clap::Args;
use engine::{
    CodeGenerator, ExecutionRequest, FileReference, GeminiGenerator, Orchestrator, Resolver,
    build_store,
};
use sandbox::GuestLanguage;
use serde_json::json;
use tracing::info;

use super::{ConfigArgs, print_json};
use crate::error::RunnerResult;

#[derive(Args)]
pub struct GenerateArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Question to answer from the referenced files
    question: String,
    /// File reference, `uploaded:<key>` or `public:<bucket>/<key>` (repeatable)
    #[arg(long = "file", short = 'f', required = true)]
    files: Vec<FileReference>,
    /// Guest language to generate (python or sql)
    #[arg(long, short, default_value = "python")]
    language: GuestLanguage,
    /// Execute the generated script and print it together with the envelope
    #[arg(long)]
    run: bool,
}

pub async fn run_generate(args: GenerateArgs) -> RunnerResult<ExitCode> {
    let config = args.config.load().await?;

    // The generator only sees metadata; nothing is downloaded here.
    let resolver = Resolver::new(
        build_store(&config)?,
        config.resolver.default_bucket.clone(),
        config.resolver.max_bytes_per_request,
        config.fetch_timeout(),
        config.resolver.staging_dir.clone(),
    );
    let described = resolver.describe(&args.files).await?;

    let generator = GeminiGenerator::from_config(&config.codegen)?;
    let script = generator
        .generate(&args.question, args.language, &described)
        .await?;
    info!(generator = generator.name(), bytes = script.len(), "script generated");

    if !args.run {
        println!("{script}");
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = Orchestrator::from_config(&config)?;
    let request = ExecutionRequest::new(script.clone())
        .with_language(args.language)
        .with_files(args.files);
    let envelope = orchestrator.execute(request).await;
    let success = envelope.success;
    print_json(&json!({ "script": script, "result": envelope }))?;
    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}
