use std::sync::Arc;

use async_trait::async_trait;

use crate::app::queue::StageQueue;
use crate::orchestrator::{GenerationOrchestrator, StageTask};

/// Hands a stage to background execution and returns immediately. The
/// request that triggered a stage never waits for the stage to finish.
#[async_trait]
pub trait StageDispatcher: Send + Sync {
    async fn dispatch(&self, task: StageTask) -> anyhow::Result<()>;
}

/// Runs stages on the in-process queue. With `auto_advance` set, a stage
/// that names a follow-up task keeps the chain going until the pipeline
/// completes, fails, or no-ops; the chain holds a single queue permit for
/// its whole run so one ebook occupies one concurrency slot.
#[derive(Clone)]
pub struct InProcessStageDispatcher {
    queue: StageQueue,
    orchestrator: Arc<GenerationOrchestrator>,
    auto_advance: bool,
}

impl InProcessStageDispatcher {
    pub fn new(
        queue: StageQueue,
        orchestrator: Arc<GenerationOrchestrator>,
        auto_advance: bool,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            auto_advance,
        }
    }
}

#[async_trait]
impl StageDispatcher for InProcessStageDispatcher {
    async fn dispatch(&self, task: StageTask) -> anyhow::Result<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let auto_advance = self.auto_advance;
        self.queue.spawn(async move {
            let mut current = task;
            loop {
                match orchestrator.run_task(&current).await {
                    Ok(outcome) => match outcome.next_task() {
                        Some(next) if auto_advance => current = next.clone(),
                        _ => break,
                    },
                    Err(err) => {
                        tracing::error!(task = ?current, %err, "stage execution failed");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}
