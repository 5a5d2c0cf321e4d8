pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::pool::BettingPool;
use crate::types::{
    MoveRecord, RefundTicket, Session, SessionStatus, SettlementResult, SettlementStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Durable store for everything the coordinator must not lose: sessions,
/// the append-only move log, settlements, betting pools and the refund
/// queue. Injected everywhere; tests build isolated instances.
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    async fn save_session(&self, session: &Session) -> Result<()>;

    async fn load_session(&self, session_id: Uuid) -> Result<Option<Session>>;

    async fn load_session_by_code(&self, code: &str) -> Result<Option<Session>>;

    /// Persists the session only if its stored status still matches
    /// `expected`. Returns false when another writer got there first.
    async fn update_session_if_status(
        &self,
        session: &Session,
        expected: SessionStatus,
    ) -> Result<bool>;

    async fn list_expired_waiting(&self, now: DateTime<Utc>) -> Result<Vec<Session>>;

    /// Appends one move record. Sequence numbers are unique per session
    /// and the log is never updated in place.
    async fn append_move(&self, record: &MoveRecord) -> Result<()>;

    async fn load_moves(&self, session_id: Uuid) -> Result<Vec<MoveRecord>>;

    async fn last_move(&self, session_id: Uuid) -> Result<Option<MoveRecord>>;

    async fn next_move_seq(&self, session_id: Uuid) -> Result<u64>;

    async fn save_settlement(&self, result: &SettlementResult) -> Result<()>;

    async fn load_settlement(&self, session_id: Uuid) -> Result<Option<SettlementResult>>;

    /// Status-guarded settlement update; a Confirmed result can never be
    /// overwritten through this path.
    async fn update_settlement_if_status(
        &self,
        result: &SettlementResult,
        expected: SettlementStatus,
    ) -> Result<bool>;

    async fn save_pool(&self, pool: &BettingPool) -> Result<()>;

    async fn load_pool(&self, session_id: Uuid) -> Result<Option<BettingPool>>;

    async fn save_refund(&self, ticket: &RefundTicket) -> Result<()>;

    async fn list_queued_refunds(&self) -> Result<Vec<RefundTicket>>;
}
