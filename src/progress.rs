use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::PipelineError;
use crate::model::{ChapterStatus, EbookStatus};
use crate::store::{ChapterStore, EbookStore};

/// Read-only projection of a generation run, shaped for polling clients.
/// Chapter content is deliberately omitted; this answers "how far along"
/// without shipping the book.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationStatusReport {
    pub ebook_id: String,
    pub title: String,
    pub status: EbookStatus,
    pub progress: u8,
    pub toc_generated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cover_image_url: Option<String>,
    pub message: String,
    pub chapters: Vec<ChapterProgress>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChapterProgress {
    pub number: u32,
    pub title: String,
    pub status: ChapterStatus,
}

pub struct ProgressReporter {
    ebooks: Arc<dyn EbookStore>,
    chapters: Arc<dyn ChapterStore>,
}

impl ProgressReporter {
    pub fn new(ebooks: Arc<dyn EbookStore>, chapters: Arc<dyn ChapterStore>) -> Self {
        Self { ebooks, chapters }
    }

    pub async fn report(&self, ebook_id: &str) -> Result<GenerationStatusReport, PipelineError> {
        let ebook = self
            .ebooks
            .get(ebook_id)
            .await
            .map_err(PipelineError::Persistence)?
            .ok_or(PipelineError::NotFound("ebook"))?;
        let chapters = self
            .chapters
            .list(ebook_id)
            .await
            .map_err(PipelineError::Persistence)?;

        let message = status_message(ebook.status);
        Ok(GenerationStatusReport {
            ebook_id: ebook.id,
            title: ebook.title,
            status: ebook.status,
            progress: ebook.progress,
            toc_generated: ebook.toc_generated,
            cover_image_url: ebook.cover_image_url,
            message: message.to_string(),
            chapters: chapters
                .into_iter()
                .map(|c| ChapterProgress {
                    number: c.number,
                    title: c.title,
                    status: c.status,
                })
                .collect(),
            updated_at: ebook.updated_at,
        })
    }
}

fn status_message(status: EbookStatus) -> &'static str {
    match status {
        EbookStatus::Draft => "not started",
        EbookStatus::GeneratingToc => "generating table of contents",
        EbookStatus::GeneratingChapters => "generating chapters",
        EbookStatus::GeneratingCover => "generating cover image",
        EbookStatus::Completed => "completed",
        EbookStatus::Failed => "generation failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Chapter, Ebook};
    use crate::store::{ChapterUpdate, EbookUpdate, MemoryStore};

    #[tokio::test]
    async fn reports_status_and_chapter_breakdown() {
        let store = Arc::new(MemoryStore::new());
        let ebook = Ebook::new("u", "Title", "Desc");
        EbookStore::create(store.as_ref(), &ebook).await.unwrap();
        store
            .insert_all(
                &ebook.id,
                &[
                    Chapter::pending(&ebook.id, 1, "One"),
                    Chapter::pending(&ebook.id, 2, "Two"),
                ],
            )
            .await
            .unwrap();
        EbookStore::try_transition(
            store.as_ref(),
            &ebook.id,
            &[EbookStatus::Draft],
            EbookUpdate::status(EbookStatus::GeneratingToc),
        )
        .await
        .unwrap();
        EbookStore::try_transition(
            store.as_ref(),
            &ebook.id,
            &[EbookStatus::GeneratingToc],
            EbookUpdate::status(EbookStatus::GeneratingChapters)
                .with_progress(50)
                .with_toc_generated(),
        )
        .await
        .unwrap();
        ChapterStore::try_transition(
            store.as_ref(),
            &ebook.id,
            1,
            &[ChapterStatus::Pending],
            ChapterUpdate::status(ChapterStatus::Completed).with_content("<p>x</p>"),
        )
        .await
        .unwrap();

        let reporter = ProgressReporter::new(
            Arc::clone(&store) as Arc<dyn EbookStore>,
            Arc::clone(&store) as Arc<dyn ChapterStore>,
        );
        let report = reporter.report(&ebook.id).await.unwrap();

        assert_eq!(report.status, EbookStatus::GeneratingChapters);
        assert_eq!(report.progress, 50);
        assert!(report.toc_generated);
        assert_eq!(report.message, "generating chapters");
        assert_eq!(report.chapters.len(), 2);
        assert_eq!(report.chapters[0].status, ChapterStatus::Completed);
        assert_eq!(report.chapters[1].status, ChapterStatus::Pending);
    }

    #[tokio::test]
    async fn missing_ebook_is_not_found() {
        let store = Arc::new(MemoryStore::new());
        let reporter = ProgressReporter::new(
            Arc::clone(&store) as Arc<dyn EbookStore>,
            Arc::clone(&store) as Arc<dyn ChapterStore>,
        );
        let err = reporter.report("missing").await.unwrap_err();
        assert!(matches!(err, PipelineError::NotFound("ebook")));
    }
}
