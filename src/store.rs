use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;

use crate::model::{Chapter, ChapterStatus, Ebook, EbookStatus};
use crate::status::can_transition;

/// Partial mutation applied on a won transition. `updated_at` is always
/// refreshed by the store.
#[derive(Debug, Default, Clone)]
pub struct EbookUpdate {
    pub status: Option<EbookStatus>,
    pub progress: Option<u8>,
    pub toc_generated: Option<bool>,
    pub cover_image_url: Option<String>,
}

impl EbookUpdate {
    pub fn status(status: EbookStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_toc_generated(mut self) -> Self {
        self.toc_generated = Some(true);
        self
    }

    pub fn with_cover_image_url(mut self, url: impl Into<String>) -> Self {
        self.cover_image_url = Some(url.into());
        self
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChapterUpdate {
    pub status: Option<ChapterStatus>,
    pub content: Option<String>,
}

impl ChapterUpdate {
    pub fn status(status: ChapterStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// E-book persistence. `try_transition` is a conditional update: it applies
/// only while the current status is in `expected`, so two concurrent stage
/// invocations cannot both win the same transition. The loser observes
/// `None`.
#[async_trait]
pub trait EbookStore: Send + Sync {
    async fn create(&self, ebook: &Ebook) -> anyhow::Result<()>;
    async fn get(&self, ebook_id: &str) -> anyhow::Result<Option<Ebook>>;
    async fn try_transition(
        &self,
        ebook_id: &str,
        expected: &[EbookStatus],
        update: EbookUpdate,
    ) -> anyhow::Result<Option<Ebook>>;
}

#[async_trait]
pub trait ChapterStore: Send + Sync {
    /// Bulk insert after TOC generation. Fails if the ebook already has
    /// chapters: the chapter count is fixed once the TOC succeeds.
    async fn insert_all(&self, ebook_id: &str, chapters: &[Chapter]) -> anyhow::Result<()>;
    /// All chapters of an ebook ordered by `number`.
    async fn list(&self, ebook_id: &str) -> anyhow::Result<Vec<Chapter>>;
    async fn get(&self, ebook_id: &str, number: u32) -> anyhow::Result<Option<Chapter>>;
    async fn try_transition(
        &self,
        ebook_id: &str,
        number: u32,
        expected: &[ChapterStatus],
        update: ChapterUpdate,
    ) -> anyhow::Result<Option<Chapter>>;
}

fn apply_ebook_update(ebook: &mut Ebook, update: &EbookUpdate) -> anyhow::Result<()> {
    if let Some(status) = update.status {
        if !can_transition(ebook.status, status) {
            anyhow::bail!(
                "illegal status transition: {:?} -> {:?} for ebook {}",
                ebook.status,
                status,
                ebook.id
            );
        }
        ebook.status = status;
    }
    if let Some(progress) = update.progress {
        ebook.progress = progress.min(100);
    }
    if let Some(toc_generated) = update.toc_generated {
        ebook.toc_generated = toc_generated;
    }
    if let Some(url) = &update.cover_image_url {
        ebook.cover_image_url = Some(url.clone());
    }
    ebook.updated_at = Utc::now();
    Ok(())
}

fn apply_chapter_update(chapter: &mut Chapter, update: &ChapterUpdate) {
    if let Some(status) = update.status {
        chapter.status = status;
    }
    if let Some(content) = &update.content {
        chapter.content = content.clone();
    }
    chapter.updated_at = Utc::now();
}

#[derive(Debug, Default)]
struct MemoryInner {
    ebooks: HashMap<String, Ebook>,
    chapters: HashMap<String, Vec<Chapter>>,
}

/// In-memory store for single-process deployments and tests. One mutex
/// guards both maps, which makes every transition check-and-set atomic.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store poisoned"))
    }
}

#[async_trait]
impl EbookStore for MemoryStore {
    async fn create(&self, ebook: &Ebook) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if inner.ebooks.contains_key(&ebook.id) {
            anyhow::bail!("ebook already exists: {}", ebook.id);
        }
        inner.ebooks.insert(ebook.id.clone(), ebook.clone());
        Ok(())
    }

    async fn get(&self, ebook_id: &str) -> anyhow::Result<Option<Ebook>> {
        Ok(self.lock()?.ebooks.get(ebook_id).cloned())
    }

    async fn try_transition(
        &self,
        ebook_id: &str,
        expected: &[EbookStatus],
        update: EbookUpdate,
    ) -> anyhow::Result<Option<Ebook>> {
        let mut inner = self.lock()?;
        let Some(ebook) = inner.ebooks.get_mut(ebook_id) else {
            return Ok(None);
        };
        if !expected.contains(&ebook.status) {
            return Ok(None);
        }
        apply_ebook_update(ebook, &update)?;
        Ok(Some(ebook.clone()))
    }
}

#[async_trait]
impl ChapterStore for MemoryStore {
    async fn insert_all(&self, ebook_id: &str, chapters: &[Chapter]) -> anyhow::Result<()> {
        let mut inner = self.lock()?;
        if inner.chapters.get(ebook_id).is_some_and(|c| !c.is_empty()) {
            anyhow::bail!("chapters already exist for ebook {ebook_id}");
        }
        let mut sorted = chapters.to_vec();
        sorted.sort_by_key(|c| c.number);
        inner.chapters.insert(ebook_id.to_string(), sorted);
        Ok(())
    }

    async fn list(&self, ebook_id: &str) -> anyhow::Result<Vec<Chapter>> {
        Ok(self.lock()?.chapters.get(ebook_id).cloned().unwrap_or_default())
    }

    async fn get(&self, ebook_id: &str, number: u32) -> anyhow::Result<Option<Chapter>> {
        Ok(self
            .lock()?
            .chapters
            .get(ebook_id)
            .and_then(|chapters| chapters.iter().find(|c| c.number == number).cloned()))
    }

    async fn try_transition(
        &self,
        ebook_id: &str,
        number: u32,
        expected: &[ChapterStatus],
        update: ChapterUpdate,
    ) -> anyhow::Result<Option<Chapter>> {
        let mut inner = self.lock()?;
        let Some(chapter) = inner
            .chapters
            .get_mut(ebook_id)
            .and_then(|chapters| chapters.iter_mut().find(|c| c.number == number))
        else {
            return Ok(None);
        };
        if !expected.contains(&chapter.status) {
            return Ok(None);
        }
        apply_chapter_update(chapter, &update);
        Ok(Some(chapter.clone()))
    }
}

/// JSON documents on the local filesystem, one directory per ebook with
/// atomic tmp+rename writes. Read-modify-write cycles are serialized
/// behind an async mutex, which is what makes `try_transition` safe in a
/// single process; a multi-process deployment needs a store with real
/// conditional updates instead.
#[derive(Debug)]
pub struct LocalFsStore {
    base_dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalFsStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn ebook_dir(&self, ebook_id: &str) -> PathBuf {
        self.base_dir.join("ebooks").join(ebook_id)
    }

    fn ebook_json_path(&self, ebook_id: &str) -> PathBuf {
        self.ebook_dir(ebook_id).join("ebook.json")
    }

    fn chapters_json_path(&self, ebook_id: &str) -> PathBuf {
        self.ebook_dir(ebook_id).join("chapters.json")
    }
}

#[async_trait]
impl EbookStore for LocalFsStore {
    async fn create(&self, ebook: &Ebook) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.ebook_json_path(&ebook.id);
        if fs::try_exists(&path).await.unwrap_or(false) {
            anyhow::bail!("ebook already exists: {}", ebook.id);
        }
        write_json_atomic(&path, ebook).await.context("write ebook.json")
    }

    async fn get(&self, ebook_id: &str) -> anyhow::Result<Option<Ebook>> {
        let path = self.ebook_json_path(ebook_id);
        read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))
    }

    async fn try_transition(
        &self,
        ebook_id: &str,
        expected: &[EbookStatus],
        update: EbookUpdate,
    ) -> anyhow::Result<Option<Ebook>> {
        let _guard = self.write_lock.lock().await;
        let path = self.ebook_json_path(ebook_id);
        let Some(mut ebook) = read_json::<Ebook>(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
        else {
            return Ok(None);
        };
        if !expected.contains(&ebook.status) {
            return Ok(None);
        }
        apply_ebook_update(&mut ebook, &update)?;
        write_json_atomic(&path, &ebook)
            .await
            .context("write ebook.json")?;
        Ok(Some(ebook))
    }
}

#[async_trait]
impl ChapterStore for LocalFsStore {
    async fn insert_all(&self, ebook_id: &str, chapters: &[Chapter]) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.chapters_json_path(ebook_id);
        let existing: Option<Vec<Chapter>> = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?;
        if existing.is_some_and(|c| !c.is_empty()) {
            anyhow::bail!("chapters already exist for ebook {ebook_id}");
        }
        let mut sorted = chapters.to_vec();
        sorted.sort_by_key(|c| c.number);
        write_json_atomic(&path, &sorted)
            .await
            .context("write chapters.json")
    }

    async fn list(&self, ebook_id: &str) -> anyhow::Result<Vec<Chapter>> {
        let path = self.chapters_json_path(ebook_id);
        let chapters: Option<Vec<Chapter>> = read_json(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?;
        Ok(chapters.unwrap_or_default())
    }

    async fn get(&self, ebook_id: &str, number: u32) -> anyhow::Result<Option<Chapter>> {
        let chapters = self.list(ebook_id).await?;
        Ok(chapters.into_iter().find(|c| c.number == number))
    }

    async fn try_transition(
        &self,
        ebook_id: &str,
        number: u32,
        expected: &[ChapterStatus],
        update: ChapterUpdate,
    ) -> anyhow::Result<Option<Chapter>> {
        let _guard = self.write_lock.lock().await;
        let path = self.chapters_json_path(ebook_id);
        let Some(mut chapters) = read_json::<Vec<Chapter>>(&path)
            .await
            .with_context(|| format!("read: {}", path.display()))?
        else {
            return Ok(None);
        };
        let Some(chapter) = chapters.iter_mut().find(|c| c.number == number) else {
            return Ok(None);
        };
        if !expected.contains(&chapter.status) {
            return Ok(None);
        }
        apply_chapter_update(chapter, &update);
        let updated = chapter.clone();
        write_json_atomic(&path, &chapters)
            .await
            .context("write chapters.json")?;
        Ok(Some(updated))
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
