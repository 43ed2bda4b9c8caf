use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::PipelineError;
use crate::generator::{ContentGenerator, GeneratorError};
use crate::model::{Chapter, ChapterStatus, Ebook, EbookStatus};
use crate::status::{StartDecision, decide_start};
use crate::store::{ChapterStore, ChapterUpdate, EbookStore, EbookUpdate};

/// One unit of orchestration work. Completing a stage names the follow-up
/// task so a dispatcher can chain stages without the orchestrator owning a
/// long-lived loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageTask {
    Toc { ebook_id: String },
    Chapter { ebook_id: String, number: u32 },
    Cover { ebook_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    TimedOut,
    Provider,
}

/// Result of one stage invocation. `NoOp` covers idempotent re-invocation
/// and stage conflicts; `Failed` carries the generation error kind while
/// still reporting where the records landed.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Advanced {
        status: EbookStatus,
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        next: Option<StageTask>,
    },
    NoOp {
        status: EbookStatus,
        progress: u8,
        message: String,
    },
    Failed {
        status: EbookStatus,
        progress: u8,
        kind: StageErrorKind,
        message: String,
    },
}

impl StageOutcome {
    pub fn status(&self) -> EbookStatus {
        match self {
            Self::Advanced { status, .. } | Self::NoOp { status, .. } | Self::Failed { status, .. } => {
                *status
            }
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            Self::Advanced { progress, .. }
            | Self::NoOp { progress, .. }
            | Self::Failed { progress, .. } => *progress,
        }
    }

    pub fn next_task(&self) -> Option<&StageTask> {
        match self {
            Self::Advanced { next, .. } => next.as_ref(),
            _ => None,
        }
    }

    pub fn error_kind(&self) -> Option<StageErrorKind> {
        match self {
            Self::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Upper bound on each external generation call. Exceeding it fails only
/// the unit in flight, never the whole pipeline.
#[derive(Debug, Clone, Copy)]
pub struct StageDeadlines {
    pub toc: Duration,
    pub chapter: Duration,
    pub cover: Duration,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            toc: Duration::from_secs(60),
            chapter: Duration::from_secs(120),
            cover: Duration::from_secs(120),
        }
    }
}

/// What to do when cover generation fails. The default completes the
/// ebook without a cover: the content is the primary deliverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverFailurePolicy {
    #[default]
    CompleteWithoutCover,
    FailEbook,
}

const DEFAULT_COVER_ASPECT: &str = "2:3";

/// Drives the e-book state machine one stage per invocation: TOC, then
/// chapters strictly in order, then the cover. Every status flip is a
/// conditional update so concurrent invocations cannot double-run a stage.
pub struct GenerationOrchestrator {
    ebooks: Arc<dyn EbookStore>,
    chapters: Arc<dyn ChapterStore>,
    generator: Arc<dyn ContentGenerator>,
    deadlines: StageDeadlines,
    cover_policy: CoverFailurePolicy,
    cover_aspect: String,
}

impl GenerationOrchestrator {
    pub fn new(
        ebooks: Arc<dyn EbookStore>,
        chapters: Arc<dyn ChapterStore>,
        generator: Arc<dyn ContentGenerator>,
    ) -> Self {
        Self {
            ebooks,
            chapters,
            generator,
            deadlines: StageDeadlines::default(),
            cover_policy: CoverFailurePolicy::default(),
            cover_aspect: DEFAULT_COVER_ASPECT.to_string(),
        }
    }

    pub fn with_deadlines(mut self, deadlines: StageDeadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    pub fn with_cover_policy(mut self, policy: CoverFailurePolicy) -> Self {
        self.cover_policy = policy;
        self
    }

    pub async fn run_task(&self, task: &StageTask) -> Result<StageOutcome, PipelineError> {
        match task {
            StageTask::Toc { ebook_id } => self.run_toc_stage(ebook_id).await,
            StageTask::Chapter { ebook_id, number } => {
                self.run_chapter_stage(ebook_id, *number).await
            }
            StageTask::Cover { ebook_id } => self.run_cover_stage(ebook_id).await,
        }
    }

    /// Entry point of a generation run. Idempotent: duplicate requests
    /// while a run is in flight report current progress instead of erroring,
    /// and a failed run with a surviving TOC resumes at the first
    /// non-completed chapter instead of regenerating everything.
    pub async fn run_toc_stage(&self, ebook_id: &str) -> Result<StageOutcome, PipelineError> {
        let ebook = self.load_ebook(ebook_id).await?;
        match decide_start(&ebook) {
            StartDecision::InProgress => Ok(no_op(&ebook, "generation already in progress")),
            StartDecision::AlreadyCompleted => Ok(no_op(&ebook, "generation already completed")),
            StartDecision::ResumeChapters => self.resume_chapters(&ebook).await,
            StartDecision::GenerateToc => self.generate_toc(&ebook).await,
        }
    }

    async fn generate_toc(&self, ebook: &Ebook) -> Result<StageOutcome, PipelineError> {
        let Some(claimed) = self
            .ebooks
            .try_transition(
                &ebook.id,
                &[EbookStatus::Draft, EbookStatus::Failed],
                EbookUpdate::status(EbookStatus::GeneratingToc).with_progress(0),
            )
            .await
            .map_err(PipelineError::Persistence)?
        else {
            // Lost the start race; report whatever the winner is doing.
            let current = self.load_ebook(&ebook.id).await?;
            return Ok(no_op(&current, "generation already in progress"));
        };

        tracing::info!(ebook_id = %claimed.id, "generating table of contents");
        let titles = match self
            .generator
            .generate_table_of_contents(&claimed.title, &claimed.description, self.deadlines.toc)
            .await
        {
            Ok(titles) if !titles.is_empty() => titles,
            Ok(_) => {
                return self
                    .fail_ebook(
                        &claimed,
                        GeneratorError::provider("table of contents is empty"),
                    )
                    .await;
            }
            Err(err) => return self.fail_ebook(&claimed, err).await,
        };

        let rows: Vec<Chapter> = titles
            .iter()
            .enumerate()
            .map(|(idx, title)| Chapter::pending(&claimed.id, idx as u32 + 1, title))
            .collect();
        if let Err(err) = self.chapters.insert_all(&claimed.id, &rows).await {
            self.mark_failed_best_effort(&claimed.id).await;
            return Err(PipelineError::Persistence(err));
        }

        let updated = self
            .ebooks
            .try_transition(
                &claimed.id,
                &[EbookStatus::GeneratingToc],
                EbookUpdate::status(EbookStatus::GeneratingChapters)
                    .with_progress(0)
                    .with_toc_generated(),
            )
            .await
            .map_err(PipelineError::Persistence)?;
        let Some(updated) = updated else {
            let current = self.load_ebook(&claimed.id).await?;
            return Ok(no_op(&current, "ebook state changed during toc generation"));
        };

        tracing::info!(ebook_id = %updated.id, chapters = rows.len(), "toc persisted");
        Ok(StageOutcome::Advanced {
            status: updated.status,
            progress: updated.progress,
            next: Some(StageTask::Chapter {
                ebook_id: updated.id,
                number: 1,
            }),
        })
    }

    async fn resume_chapters(&self, ebook: &Ebook) -> Result<StageOutcome, PipelineError> {
        let chapters = self.load_chapters(&ebook.id).await?;
        if chapters.is_empty() {
            // toc_generated without rows should not occur; regenerate.
            return self.generate_toc(ebook).await;
        }

        let total = chapters.len();
        let completed = chapters
            .iter()
            .filter(|c| c.status == ChapterStatus::Completed)
            .count();
        let progress = chapter_progress(completed, total);

        let Some(resumed) = self
            .ebooks
            .try_transition(
                &ebook.id,
                &[EbookStatus::Failed],
                EbookUpdate::status(EbookStatus::GeneratingChapters).with_progress(progress),
            )
            .await
            .map_err(PipelineError::Persistence)?
        else {
            let current = self.load_ebook(&ebook.id).await?;
            return Ok(no_op(&current, "generation already in progress"));
        };

        tracing::info!(ebook_id = %resumed.id, completed, total, "resuming chapter generation");

        if completed == total {
            // The earlier failure happened past the chapters; go straight on
            // to the cover.
            let advanced = self
                .ebooks
                .try_transition(
                    &resumed.id,
                    &[EbookStatus::GeneratingChapters],
                    EbookUpdate::status(EbookStatus::GeneratingCover).with_progress(100),
                )
                .await
                .map_err(PipelineError::Persistence)?;
            let Some(advanced) = advanced else {
                let current = self.load_ebook(&resumed.id).await?;
                return Ok(no_op(&current, "ebook state changed during resume"));
            };
            return Ok(StageOutcome::Advanced {
                status: advanced.status,
                progress: advanced.progress,
                next: Some(StageTask::Cover {
                    ebook_id: advanced.id,
                }),
            });
        }

        let next_number = chapters
            .iter()
            .find(|c| c.status != ChapterStatus::Completed)
            .map(|c| c.number);
        Ok(StageOutcome::Advanced {
            status: resumed.status,
            progress: resumed.progress,
            next: next_number.map(|number| StageTask::Chapter {
                ebook_id: resumed.id,
                number,
            }),
        })
    }

    /// Generates one chapter. Chapters run strictly in increasing `number`
    /// order because each is conditioned on the previous chapter's content.
    /// A failed chapter leaves the ebook in `generating_chapters` and can
    /// be re-invoked.
    pub async fn run_chapter_stage(
        &self,
        ebook_id: &str,
        number: u32,
    ) -> Result<StageOutcome, PipelineError> {
        if number == 0 {
            return Err(PipelineError::Validation(
                "chapter number must be 1 or greater".to_string(),
            ));
        }

        let ebook = self.load_ebook(ebook_id).await?;
        if ebook.status != EbookStatus::GeneratingChapters {
            return Ok(no_op(&ebook, "ebook is not generating chapters"));
        }

        let chapters = self.load_chapters(ebook_id).await?;
        let Some(chapter) = chapters.iter().find(|c| c.number == number) else {
            return Err(PipelineError::NotFound("chapter"));
        };

        match chapter.status {
            ChapterStatus::Completed => {
                return Ok(no_op(&ebook, &format!("chapter {number} already generated")));
            }
            ChapterStatus::Generating => {
                return Ok(no_op(
                    &ebook,
                    &format!("chapter {number} generation already in progress"),
                ));
            }
            ChapterStatus::Pending | ChapterStatus::Failed => {}
        }

        if chapters
            .iter()
            .any(|c| c.number < number && !c.status.is_terminal())
        {
            return Err(PipelineError::Validation(format!(
                "chapter {number} is not ready: earlier chapters have not finished"
            )));
        }

        let claimed = self
            .chapters
            .try_transition(
                ebook_id,
                number,
                &[ChapterStatus::Pending, ChapterStatus::Failed],
                ChapterUpdate::status(ChapterStatus::Generating),
            )
            .await
            .map_err(PipelineError::Persistence)?;
        if claimed.is_none() {
            let current = self.load_ebook(ebook_id).await?;
            return Ok(no_op(
                &current,
                &format!("chapter {number} generation already in progress"),
            ));
        }

        let previous_content = chapters
            .iter()
            .find(|c| number > 1 && c.number == number - 1)
            .filter(|c| c.status == ChapterStatus::Completed && !c.content.is_empty())
            .map(|c| c.content.clone());

        tracing::info!(ebook_id, number, "generating chapter");
        let generated = self
            .generator
            .generate_chapter(
                &ebook.title,
                &ebook.description,
                &chapter.title,
                previous_content.as_deref(),
                self.deadlines.chapter,
            )
            .await;

        let content = match generated {
            Ok(content) => content,
            Err(err) => {
                let (kind, message) = split_generator_error(err);
                tracing::warn!(ebook_id, number, %message, "chapter generation failed");
                self.chapters
                    .try_transition(
                        ebook_id,
                        number,
                        &[ChapterStatus::Generating],
                        ChapterUpdate::status(ChapterStatus::Failed),
                    )
                    .await
                    .map_err(PipelineError::Persistence)?;
                return Ok(StageOutcome::Failed {
                    status: EbookStatus::GeneratingChapters,
                    progress: ebook.progress,
                    kind,
                    message,
                });
            }
        };

        let written = self
            .chapters
            .try_transition(
                ebook_id,
                number,
                &[ChapterStatus::Generating],
                ChapterUpdate::status(ChapterStatus::Completed).with_content(content),
            )
            .await
            .map_err(|err| {
                PipelineError::Persistence(err.context(format!("persist chapter {number}")))
            })?;
        if written.is_none() {
            // The generation claim disappeared underneath us; do not report
            // the chapter as completed.
            return Err(PipelineError::Persistence(anyhow::anyhow!(
                "chapter {number} state changed while generating"
            )));
        }

        let all = self.load_chapters(ebook_id).await?;
        let total = all.len();
        let completed = all
            .iter()
            .filter(|c| c.status == ChapterStatus::Completed)
            .count();
        let progress = chapter_progress(completed, total);

        if completed == total {
            let advanced = self
                .ebooks
                .try_transition(
                    ebook_id,
                    &[EbookStatus::GeneratingChapters],
                    EbookUpdate::status(EbookStatus::GeneratingCover).with_progress(progress),
                )
                .await
                .map_err(PipelineError::Persistence)?;
            let Some(advanced) = advanced else {
                let current = self.load_ebook(ebook_id).await?;
                return Ok(no_op(&current, "ebook state changed during chapter generation"));
            };
            tracing::info!(ebook_id, "all chapters completed");
            return Ok(StageOutcome::Advanced {
                status: advanced.status,
                progress: advanced.progress,
                next: Some(StageTask::Cover {
                    ebook_id: advanced.id,
                }),
            });
        }

        self.ebooks
            .try_transition(
                ebook_id,
                &[EbookStatus::GeneratingChapters],
                EbookUpdate::status(EbookStatus::GeneratingChapters).with_progress(progress),
            )
            .await
            .map_err(PipelineError::Persistence)?;

        let next_number = all
            .iter()
            .find(|c| c.status == ChapterStatus::Pending)
            .map(|c| c.number);
        Ok(StageOutcome::Advanced {
            status: EbookStatus::GeneratingChapters,
            progress,
            next: next_number.map(|next| StageTask::Chapter {
                ebook_id: ebook_id.to_string(),
                number: next,
            }),
        })
    }

    /// Generates the cover image and completes the ebook. A no-op when the
    /// cover already exists; on failure the configured policy decides
    /// between completing without a cover and failing the ebook.
    pub async fn run_cover_stage(&self, ebook_id: &str) -> Result<StageOutcome, PipelineError> {
        let ebook = self.load_ebook(ebook_id).await?;
        if ebook.cover_image_url.is_some() {
            return Ok(no_op(&ebook, "cover already generated"));
        }
        if ebook.status != EbookStatus::GeneratingCover {
            return Ok(no_op(&ebook, "ebook is not generating a cover"));
        }

        tracing::info!(ebook_id, "generating cover image");
        let generated = self
            .generator
            .generate_cover_image(
                &ebook.title,
                &ebook.description,
                &self.cover_aspect,
                self.deadlines.cover,
            )
            .await;

        match generated {
            Ok(url) => {
                let completed = self
                    .ebooks
                    .try_transition(
                        ebook_id,
                        &[EbookStatus::GeneratingCover],
                        EbookUpdate::status(EbookStatus::Completed)
                            .with_progress(100)
                            .with_cover_image_url(url),
                    )
                    .await
                    .map_err(PipelineError::Persistence)?;
                let Some(completed) = completed else {
                    let current = self.load_ebook(ebook_id).await?;
                    return Ok(no_op(&current, "ebook state changed during cover generation"));
                };
                tracing::info!(ebook_id, "ebook completed");
                Ok(StageOutcome::Advanced {
                    status: completed.status,
                    progress: completed.progress,
                    next: None,
                })
            }
            Err(err) => {
                let (kind, message) = split_generator_error(err);
                tracing::warn!(ebook_id, %message, "cover generation failed");
                match self.cover_policy {
                    CoverFailurePolicy::CompleteWithoutCover => {
                        self.ebooks
                            .try_transition(
                                ebook_id,
                                &[EbookStatus::GeneratingCover],
                                EbookUpdate::status(EbookStatus::Completed).with_progress(100),
                            )
                            .await
                            .map_err(PipelineError::Persistence)?;
                        Ok(StageOutcome::Failed {
                            status: EbookStatus::Completed,
                            progress: 100,
                            kind,
                            message,
                        })
                    }
                    CoverFailurePolicy::FailEbook => {
                        self.mark_failed_best_effort(ebook_id).await;
                        Ok(StageOutcome::Failed {
                            status: EbookStatus::Failed,
                            progress: ebook.progress,
                            kind,
                            message,
                        })
                    }
                }
            }
        }
    }

    async fn fail_ebook(
        &self,
        ebook: &Ebook,
        err: GeneratorError,
    ) -> Result<StageOutcome, PipelineError> {
        let (kind, message) = split_generator_error(err);
        tracing::warn!(ebook_id = %ebook.id, %message, "generation failed");
        self.mark_failed_best_effort(&ebook.id).await;
        Ok(StageOutcome::Failed {
            status: EbookStatus::Failed,
            progress: 0,
            kind,
            message,
        })
    }

    async fn mark_failed_best_effort(&self, ebook_id: &str) {
        let result = self
            .ebooks
            .try_transition(
                ebook_id,
                &[
                    EbookStatus::Draft,
                    EbookStatus::GeneratingToc,
                    EbookStatus::GeneratingChapters,
                    EbookStatus::GeneratingCover,
                ],
                EbookUpdate::status(EbookStatus::Failed),
            )
            .await;
        if let Err(err) = result {
            tracing::error!(ebook_id, ?err, "could not mark ebook failed");
        }
    }

    async fn load_ebook(&self, ebook_id: &str) -> Result<Ebook, PipelineError> {
        self.ebooks
            .get(ebook_id)
            .await
            .map_err(PipelineError::Persistence)?
            .ok_or(PipelineError::NotFound("ebook"))
    }

    async fn load_chapters(&self, ebook_id: &str) -> Result<Vec<Chapter>, PipelineError> {
        self.chapters
            .list(ebook_id)
            .await
            .map_err(PipelineError::Persistence)
    }
}

fn no_op(ebook: &Ebook, message: &str) -> StageOutcome {
    StageOutcome::NoOp {
        status: ebook.status,
        progress: ebook.progress,
        message: message.to_string(),
    }
}

fn split_generator_error(err: GeneratorError) -> (StageErrorKind, String) {
    match err {
        GeneratorError::TimedOut => (StageErrorKind::TimedOut, err.to_string()),
        GeneratorError::Provider { ref message } => (StageErrorKind::Provider, message.clone()),
    }
}

fn chapter_progress(completed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((completed as f64 / total as f64) * 100.0).round() as u8
}
