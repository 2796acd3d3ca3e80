//! Traits for batch sources
//!
//! Engine-agnostic consumption interface shared by the spooler and the CDC
//! reconstructor.

use crate::batch::{AckReport, Batch, BatchId};
use async_trait::async_trait;
use std::time::Duration;

/// Pull-based producer of acknowledged batches.
///
/// A consumer drives a source with [`poll_next_batch`](Self::poll_next_batch)
/// and confirms each delivered batch with [`acknowledge`](Self::acknowledge).
/// The source only advances its durable cursor on acknowledgement.
#[async_trait]
pub trait BatchSource: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Validate configuration, restore the cursor and spawn background work.
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Wait up to `max_wait` for the next batch; `Ok(None)` on timeout.
    async fn poll_next_batch(&mut self, max_wait: Duration) -> Result<Option<Batch>, Self::Error>;

    /// Commit a delivered batch.
    async fn acknowledge(&mut self, batch_id: BatchId) -> Result<AckReport, Self::Error>;

    /// Stop background work. Partially assembled batches are dropped.
    async fn stop(&mut self) -> Result<(), Self::Error>;

    /// True while the source is running and has not failed.
    fn is_healthy(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::record::{Field, Record};
    use std::collections::VecDeque;

    struct MockSource {
        active: bool,
        pending: VecDeque<Batch>,
        acked: Vec<BatchId>,
    }

    #[async_trait]
    impl BatchSource for MockSource {
        type Error = CoreError;

        async fn start(&mut self) -> Result<(), CoreError> {
            self.active = true;
            Ok(())
        }

        async fn poll_next_batch(&mut self, _max_wait: Duration) -> Result<Option<Batch>, CoreError> {
            Ok(self.pending.pop_front())
        }

        async fn acknowledge(&mut self, batch_id: BatchId) -> Result<AckReport, CoreError> {
            self.acked.push(batch_id);
            Ok(AckReport::new(batch_id, 1))
        }

        async fn stop(&mut self) -> Result<(), CoreError> {
            self.active = false;
            Ok(())
        }

        fn is_healthy(&self) -> bool {
            self.active
        }
    }

    #[tokio::test]
    async fn test_mock_source() {
        let mut batch = Batch::new(BatchId::new(1));
        batch.records.push(Record::new("m::0", Field::string("x")));
        let mut source = MockSource {
            active: false,
            pending: VecDeque::from([batch]),
            acked: Vec::new(),
        };

        assert!(!source.is_healthy());
        source.start().await.unwrap();
        assert!(source.is_healthy());

        let batch = source
            .poll_next_batch(Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        let report = source.acknowledge(batch.id).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(source.acked, vec![BatchId::new(1)]);
        assert!(source
            .poll_next_batch(Duration::from_millis(1))
            .await
            .unwrap()
            .is_none());

        source.stop().await.unwrap();
        assert!(!source.is_healthy());
    }
}
