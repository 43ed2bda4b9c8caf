use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Bounds how many generation pipelines run at once. Work spawned here
/// waits for a permit before executing, so a burst of requests queues
/// instead of fanning out unbounded provider calls.
#[derive(Debug, Clone)]
pub struct StageQueue {
    semaphore: Arc<Semaphore>,
}

impl StageQueue {
    pub fn new(max_concurrency: usize) -> Self {
        let permits = max_concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("stage queue semaphore is closed");
            fut.await;
        });
    }
}
