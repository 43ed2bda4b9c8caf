use std::sync::Arc;

use anyhow::Context as _;

use crate::cli::GenerateArgs;
use crate::generator::ContentGenerator as _;
use crate::model::{Ebook, EbookStatus};
use crate::orchestrator::{GenerationOrchestrator, StageOutcome, StageTask};
use crate::progress::ProgressReporter;
use crate::store::{ChapterStore, EbookStore, LocalFsStore};

/// Runs the whole pipeline synchronously and prints the final status
/// report to stdout.
pub async fn run(args: GenerateArgs) -> anyhow::Result<()> {
    let description = args.description.trim().to_string();
    if description.is_empty() {
        anyhow::bail!("--description must not be empty");
    }

    let generator = args.engine.build_generator()?;
    let store = Arc::new(LocalFsStore::new(&args.data_dir));
    let ebooks: Arc<dyn EbookStore> = store.clone();
    let chapters: Arc<dyn ChapterStore> = store;
    let orchestrator = GenerationOrchestrator::new(
        Arc::clone(&ebooks),
        Arc::clone(&chapters),
        Arc::clone(&generator),
    );

    let title = match args.title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
        Some(title) => title,
        None => generator
            .generate_title(&description)
            .await
            .map_err(|err| anyhow::anyhow!("generate title: {err}"))?,
    };

    let ebook = Ebook::new(args.user_id.as_str(), title, description);
    ebooks.create(&ebook).await.context("create ebook")?;
    tracing::info!(ebook_id = %ebook.id, title = %ebook.title, "ebook created");

    let mut task = StageTask::Toc {
        ebook_id: ebook.id.clone(),
    };
    loop {
        let outcome = orchestrator.run_task(&task).await?;
        match &outcome {
            StageOutcome::Failed { status, message, .. } => {
                if *status == EbookStatus::Completed {
                    tracing::warn!(%message, "cover generation failed, completed without cover");
                    break;
                }
                anyhow::bail!("generation failed: {message}");
            }
            _ => {}
        }
        match outcome.next_task() {
            Some(next) => task = next.clone(),
            None => break,
        }
    }

    let reporter = ProgressReporter::new(ebooks, chapters);
    let report = reporter.report(&ebook.id).await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize report")?
    );
    Ok(())
}
