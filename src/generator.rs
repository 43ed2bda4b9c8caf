use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failure modes of the content provider. A deadline overrun must stay
/// distinguishable from everything else so callers can report 408-style
/// outcomes; provider quota errors land in `Provider` and are unrelated
/// to this system's own rate limiter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("generation timed out")]
    TimedOut,

    #[error("content provider error: {message}")]
    Provider { message: String },
}

impl GeneratorError {
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
        }
    }
}

/// The only seam to the non-deterministic AI provider. Every call must
/// respect the caller-supplied deadline; no retries happen inside this
/// boundary.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate_title(&self, description: &str) -> Result<String, GeneratorError>;

    /// Ordered chapter titles for the book.
    async fn generate_table_of_contents(
        &self,
        title: &str,
        description: &str,
        deadline: Duration,
    ) -> Result<Vec<String>, GeneratorError>;

    /// Formatted chapter content. `previous_content` carries the prior
    /// chapter for narrative continuity, which is why chapters are
    /// generated strictly in order.
    async fn generate_chapter(
        &self,
        title: &str,
        description: &str,
        chapter_title: &str,
        previous_content: Option<&str>,
        deadline: Duration,
    ) -> Result<String, GeneratorError>;

    /// URL of the generated cover image.
    async fn generate_cover_image(
        &self,
        title: &str,
        description: &str,
        aspect_ratio: &str,
        deadline: Duration,
    ) -> Result<String, GeneratorError>;
}

/// Turns a model's free-form chapter listing into clean titles: one per
/// line, leading numbering and bullet markers stripped.
pub fn parse_chapter_titles(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(strip_list_marker)
        .filter(|title| !title.is_empty())
        .collect()
}

fn strip_list_marker(line: &str) -> String {
    let mut rest = line.trim_start();
    let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits > 0 {
        let after = &rest[digits..];
        if let Some(stripped) = after.strip_prefix('.').or_else(|| after.strip_prefix(')')) {
            rest = stripped;
        }
    }
    rest.trim_start_matches(['-', '*', ' ', '\t']).trim().to_string()
}

/// Deterministic generator for offline runs and the CLI. Content is
/// derived only from the inputs, so repeated runs are reproducible.
#[derive(Debug, Clone, Default)]
pub struct NoopGenerator;

const NOOP_CHAPTERS: [&str; 5] = [
    "Introduction",
    "Getting Started",
    "Core Concepts",
    "Putting It Into Practice",
    "Conclusion",
];

#[async_trait]
impl ContentGenerator for NoopGenerator {
    async fn generate_title(&self, description: &str) -> Result<String, GeneratorError> {
        let mut words = description.split_whitespace().take(4).collect::<Vec<_>>();
        if words.is_empty() {
            words.push("Untitled");
        }
        Ok(format!("A Guide to {}", words.join(" ")))
    }

    async fn generate_table_of_contents(
        &self,
        _title: &str,
        _description: &str,
        _deadline: Duration,
    ) -> Result<Vec<String>, GeneratorError> {
        Ok(NOOP_CHAPTERS.iter().map(|s| s.to_string()).collect())
    }

    async fn generate_chapter(
        &self,
        title: &str,
        description: &str,
        chapter_title: &str,
        previous_content: Option<&str>,
        _deadline: Duration,
    ) -> Result<String, GeneratorError> {
        let continuity = match previous_content {
            Some(_) => "<p>Continuing from the previous chapter.</p>\n",
            None => "",
        };
        Ok(format!(
            "<h1>{chapter_title}</h1>\n{continuity}<p>This chapter of \"{title}\" covers: {description}</p>\n"
        ))
    }

    async fn generate_cover_image(
        &self,
        title: &str,
        _description: &str,
        _aspect_ratio: &str,
        _deadline: Duration,
    ) -> Result<String, GeneratorError> {
        let slug = title
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
            .collect::<String>();
        Ok(format!("https://covers.invalid/{}.png", slug.trim_matches('-')))
    }
}
