//! Refreshing region boundaries from the boundary service

use crate::error::Result;
use crate::retry::RetryExecutor;
use crate::scheduler::TicketQueue;
use crate::source::BoundarySource;
use crate::store::Store;
use crate::verify::VerificationPass;
use std::sync::Arc;
use tracing::info;

pub struct BoundaryRefresher {
    source: Arc<dyn BoundarySource>,
    queue: TicketQueue,
    retry: RetryExecutor,
    store: Arc<dyn Store>,
}

impl BoundaryRefresher {
    pub fn new(source: Arc<dyn BoundarySource>, queue: TicketQueue, retry: RetryExecutor, store: Arc<dyn Store>) -> Self {
        Self {
            source,
            queue,
            retry,
            store,
        }
    }

    /// Fetch every boundary and store it; returns the number that changed
    ///
    /// The whole set is validated before anything is written, so one broken
    /// polygon leaves the stored boundaries untouched. When any region
    /// changed, both verification passes start over on their next run.
    pub async fn refresh(&self) -> Result<u64> {
        let source = self.source.clone();
        let boundaries = self
            .retry
            .execute("fetch region boundaries", None, |_| {
                let source = source.clone();
                self.queue.run(move || async move { source.fetch_boundaries().await })
            })
            .await?;

        for boundary in &boundaries {
            boundary.clone().into_region()?;
        }
        let changed = self.store.upsert_regions(&boundaries).await?;
        info!(
            queue = %self.queue.name(),
            regions = boundaries.len(),
            changed,
            "Region boundaries refreshed"
        );
        if changed > 0 {
            for pass in [VerificationPass::Verify, VerificationPass::Assign] {
                self.store.reset_chunk_cursor(&pass.cursor_name()).await?;
            }
            info!(changed, "Boundaries changed, verification cursors reset");
        }
        Ok(changed)
    }
}
