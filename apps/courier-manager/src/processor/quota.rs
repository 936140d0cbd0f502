use async_trait::async_trait;
use courier_proto::ModeratorId;
use dashmap::DashMap;

use super::RepositoryError;

/// Usage ledger. Limits and billing live with the host; the processor only reports
/// confirmed sends.
#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn consume(&self, moderator_id: ModeratorId, units: u64) -> Result<(), RepositoryError>;
    async fn usage(&self, moderator_id: ModeratorId) -> Result<u64, RepositoryError>;
}

#[derive(Default)]
pub struct InMemoryQuotaLedger {
    used: DashMap<ModeratorId, u64>,
}

impl InMemoryQuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QuotaLedger for InMemoryQuotaLedger {
    async fn consume(&self, moderator_id: ModeratorId, units: u64) -> Result<(), RepositoryError> {
        *self.used.entry(moderator_id).or_insert(0) += units;
        Ok(())
    }

    async fn usage(&self, moderator_id: ModeratorId) -> Result<u64, RepositoryError> {
        Ok(self.used.get(&moderator_id).map(|used| *used).unwrap_or(0))
    }
}
