use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an e-book. Advances left to right; `Failed` is reachable
/// from every non-terminal state. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EbookStatus {
    Draft,
    GeneratingToc,
    GeneratingChapters,
    GeneratingCover,
    Completed,
    Failed,
}

impl EbookStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_generating(self) -> bool {
        matches!(
            self,
            Self::GeneratingToc | Self::GeneratingChapters | Self::GeneratingCover
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ebook {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: String,
    pub status: EbookStatus,
    /// 0-100. Percentage of completed chapters while `generating_chapters`;
    /// pinned to 100 on completion.
    pub progress: u8,
    pub toc_generated: bool,
    pub cover_image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ebook {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            title: title.into(),
            description: description.into(),
            status: EbookStatus::Draft,
            progress: 0,
            toc_generated: false,
            cover_image_url: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChapterStatus {
    Pending,
    Generating,
    Completed,
    Failed,
}

impl ChapterStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: String,
    pub ebook_id: String,
    /// 1-based, unique within an ebook. Defines generation order: each
    /// chapter is conditioned on the previous chapter's content.
    pub number: u32,
    pub title: String,
    /// Empty until generated; written exactly once on success.
    pub content: String,
    pub status: ChapterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    pub fn pending(ebook_id: impl Into<String>, number: u32, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ebook_id: ebook_id.into(),
            number,
            title: title.into(),
            content: String::new(),
            status: ChapterStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_snake_case() {
        let json = serde_json::to_string(&EbookStatus::GeneratingChapters).unwrap();
        assert_eq!(json, "\"generating_chapters\"");
        let json = serde_json::to_string(&ChapterStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }

    #[test]
    fn new_ebook_starts_as_draft() {
        let ebook = Ebook::new("user-1", "Title", "Description");
        assert_eq!(ebook.status, EbookStatus::Draft);
        assert_eq!(ebook.progress, 0);
        assert!(!ebook.toc_generated);
        assert!(ebook.cover_image_url.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(EbookStatus::Completed.is_terminal());
        assert!(EbookStatus::Failed.is_terminal());
        assert!(!EbookStatus::GeneratingToc.is_terminal());
        assert!(ChapterStatus::Failed.is_terminal());
        assert!(!ChapterStatus::Generating.is_terminal());
    }
}
