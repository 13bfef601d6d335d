use std::process::ExitCode;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use comfybatch_core::batch::{
    from_images, from_prompts, load_manifest, read_prompts, scan_images, BatchItem,
};
use comfybatch_core::job::{BatchReport, JobStatus};
use comfybatch_pipeline::batch::BatchRunner;
use comfybatch_pipeline::context::{api_from_settings, BatchContext, RunOptions};
use comfybatch_pipeline::events::BatchEvent;
use comfybatch_pipeline::settings::Settings;
use comfybatch_pipeline::translate::PromptTranslator;

use crate::args::RunArgs;

pub async fn execute(settings: &Settings, args: RunArgs) -> anyhow::Result<ExitCode> {
    let (workflow, mapping) = super::load_inputs(args.workflow.as_deref(), Some(&args.mapping))?;
    let mapping = mapping.context("mapping is required for run")?;
    let items = build_items(&args)?;
    let mapping = mapping.resolve(&workflow);

    let mut options = RunOptions::from_settings(settings);
    if let Some(dir) = &args.output {
        options.output_dir = dir.clone();
    }
    options.overrides = args.override_values();

    let translator = PromptTranslator::from_settings(&settings.ollama)
        .context("failed to set up prompt translation")?;
    let api = api_from_settings(settings).context("failed to create ComfyUI client")?;

    let runner = BatchRunner::new(BatchContext {
        api,
        workflow,
        mapping,
        translator,
        options,
    });

    let printer = tokio::spawn(print_events(runner.subscribe()));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received; cancelling batch");
            on_signal.cancel();
        }
    });

    let report = runner.run(&items, &cancel).await?;
    drop(runner);
    let _ = printer.await;

    print_summary(&report);
    Ok(if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Build the batch from whichever input source was given.
fn build_items(args: &RunArgs) -> anyhow::Result<Vec<BatchItem>> {
    let negative = args.negative.as_deref();

    if let Some(manifest) = &args.manifest {
        let mut items = load_manifest(manifest)
            .with_context(|| format!("failed to load manifest {}", manifest.display()))?;
        if let Some(negative) = negative {
            for item in items.iter_mut().filter(|i| i.negative_prompt.is_none()) {
                item.negative_prompt = Some(negative.to_string());
            }
        }
        return Ok(items);
    }

    let prompts = match (&args.prompts, &args.prompt) {
        (Some(file), _) => read_prompts(file)
            .with_context(|| format!("failed to read prompts {}", file.display()))?,
        (None, Some(prompt)) => vec![prompt.clone()],
        (None, None) => Vec::new(),
    };

    let items = match &args.images {
        Some(dir) => {
            let images = scan_images(dir)
                .with_context(|| format!("failed to scan {}", dir.display()))?;
            from_images(images, &prompts, negative)?
        }
        None if !prompts.is_empty() => from_prompts(prompts, negative)?,
        None => anyhow::bail!("nothing to run: pass --manifest, --images or --prompts"),
    };
    Ok(items)
}

async fn print_events(mut rx: broadcast::Receiver<BatchEvent>) {
    loop {
        match rx.recv().await {
            Ok(BatchEvent::ItemStarted { number, total }) => {
                println!("[{number}/{total}] started");
            }
            Ok(BatchEvent::ItemSubmitted { number, prompt_id }) => {
                println!("[{number}] queued as {prompt_id}");
            }
            Ok(BatchEvent::ItemProgress { number, percent }) => {
                println!("[{number}] {percent}%");
            }
            Ok(BatchEvent::ItemFinished { result }) => match result.status {
                JobStatus::Success => {
                    for path in &result.outputs {
                        println!("[{}] saved {}", result.number, path.display());
                    }
                }
                JobStatus::Failed => println!(
                    "[{}] failed: {}",
                    result.number,
                    result.error.as_deref().unwrap_or("unknown error")
                ),
                JobStatus::Cancelled => println!("[{}] cancelled", result.number),
                JobStatus::Skipped => {}
            },
            Ok(BatchEvent::BatchFinished { .. }) => break,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!(skipped = n, "Progress printer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn print_summary(report: &BatchReport) {
    println!(
        "{} succeeded, {} failed, {} cancelled, {} skipped",
        report.succeeded(),
        report.failed(),
        report.count(JobStatus::Cancelled),
        report.count(JobStatus::Skipped),
    );
}
