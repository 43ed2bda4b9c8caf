use crate::model::{Ebook, EbookStatus};

/// Legal state transitions for an e-book. Everything else is rejected at
/// the store level via conditional updates.
pub fn can_transition(from: EbookStatus, to: EbookStatus) -> bool {
    use EbookStatus::*;
    match (from, to) {
        (Draft, GeneratingToc) => true,
        (Failed, GeneratingToc) => true,
        // Resume path: a failed ebook whose TOC already exists re-enters
        // chapter generation directly.
        (Failed, GeneratingChapters) => true,
        (GeneratingToc, GeneratingChapters) => true,
        // Progress updates re-assert the same state.
        (GeneratingChapters, GeneratingChapters) => true,
        (GeneratingChapters, GeneratingCover) => true,
        (GeneratingCover, Completed) => true,
        (from, Failed) => !from.is_terminal(),
        _ => false,
    }
}

/// What a "start generation" request should do given the current record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDecision {
    /// Begin from the top: generate a fresh table of contents.
    GenerateToc,
    /// The TOC survived an earlier failure; re-enter chapter generation
    /// at the first non-completed chapter instead of regenerating it.
    ResumeChapters,
    /// A generation run is already in flight; report current progress.
    InProgress,
    /// Nothing left to do.
    AlreadyCompleted,
}

pub fn decide_start(ebook: &Ebook) -> StartDecision {
    match ebook.status {
        EbookStatus::Draft => StartDecision::GenerateToc,
        EbookStatus::Failed if ebook.toc_generated => StartDecision::ResumeChapters,
        EbookStatus::Failed => StartDecision::GenerateToc,
        EbookStatus::Completed => StartDecision::AlreadyCompleted,
        EbookStatus::GeneratingToc
        | EbookStatus::GeneratingChapters
        | EbookStatus::GeneratingCover => StartDecision::InProgress,
    }
}
