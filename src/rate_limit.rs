use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Result of a fixed-window quota check. `reset_at` tells callers when a
/// denied identifier becomes usable again.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

/// Fixed-window counter per identifier. The increment must be atomic with
/// respect to concurrent checks for the same identifier; a distributed
/// deployment would back this with a conditional-update store instead of
/// process memory.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(
        &self,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> anyhow::Result<RateLimitDecision>;
}

#[derive(Debug)]
struct WindowCounter {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Single-process limiter. Counters live behind one mutex, so increments
/// cannot lose updates across tasks.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn check(
        &self,
        identifier: &str,
        limit: u32,
        window: Duration,
    ) -> anyhow::Result<RateLimitDecision> {
        let now = Utc::now();
        let window = chrono::Duration::from_std(window)
            .map_err(|err| anyhow::anyhow!("rate limit window out of range: {err}"))?;

        let mut counters = self
            .counters
            .lock()
            .map_err(|_| anyhow::anyhow!("rate limit counters poisoned"))?;

        counters.retain(|_, counter| counter.reset_at > now);

        let counter = counters
            .entry(identifier.to_string())
            .or_insert_with(|| WindowCounter {
                count: 0,
                reset_at: now + window,
            });

        if counter.count >= limit {
            return Ok(RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: counter.reset_at,
            });
        }

        counter.count += 1;
        Ok(RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - counter.count,
            reset_at: counter.reset_at,
        })
    }
}

/// Pipeline actions subject to independent quotas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateEbook,
    GenerateToc,
    GenerateChapter,
    GenerateCover,
    CheckStatus,
}

impl Action {
    fn slug(self) -> &'static str {
        match self {
            Self::CreateEbook => "create_ebook",
            Self::GenerateToc => "generate_toc",
            Self::GenerateChapter => "generate_chapter",
            Self::GenerateCover => "generate_cover",
            Self::CheckStatus => "check_status",
        }
    }

    /// Quota key. Per-identifier, never global: two users never share a
    /// window, and neither do two actions of the same user.
    pub fn identifier(self, user_id: &str) -> String {
        format!("user_{user_id}_{}", self.slug())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Quota {
    pub limit: u32,
    pub window: Duration,
}

/// Per-action quotas. Numeric values are deployment policy, not contract.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPolicy {
    pub create_ebook: Quota,
    pub generate_toc: Quota,
    pub generate_chapter: Quota,
    pub generate_cover: Quota,
    pub check_status: Quota,
}

const HOUR: Duration = Duration::from_secs(60 * 60);
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            create_ebook: Quota { limit: 5, window: HOUR },
            generate_toc: Quota { limit: 10, window: DAY },
            generate_chapter: Quota { limit: 30, window: DAY },
            generate_cover: Quota { limit: 10, window: DAY },
            check_status: Quota { limit: 300, window: HOUR },
        }
    }
}

impl RateLimitPolicy {
    pub fn quota(&self, action: Action) -> Quota {
        match action {
            Action::CreateEbook => self.create_ebook,
            Action::GenerateToc => self.generate_toc,
            Action::GenerateChapter => self.generate_chapter,
            Action::GenerateCover => self.generate_cover,
            Action::CheckStatus => self.check_status,
        }
    }
}
