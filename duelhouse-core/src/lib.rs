//! Duelhouse - Session coordinator for ledger-anchored wagered matches
//!
//! This library coordinates real-time, two-player wagered matches: escrow
//! joins against a distributed ledger, turn-based move validation with an
//! append-only log, spectator betting and exactly-once settlement.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod game;
pub mod ledger;
pub mod locks;
pub mod pool;
pub mod rules;
pub mod session;
pub mod settlement;
pub mod storage;
pub mod types;
pub mod world;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use error::{CoordinatorError, ErrorKind, Result};
pub use events::SessionEvent;
pub use game::mint_anti_fraud_token;
pub use ledger::{HttpLedger, HttpRollup, LedgerRpc, RollupClient};
pub use pool::{BetStake, BettingPool};
pub use rules::{RulesValidator, SkirmishRules, Terminal};
pub use storage::{CoordinatorStore, SqliteStore};
pub use types::{
    Coord, CountdownStatus, EntryRequirements, JoinTicket, MoveOutcome, MoveRecord, MoveRequest,
    Outcome, PieceKind, Session, SessionSettings, SessionStatus, SettlementResult,
    SettlementStatus,
};
pub use world::{WorldSnapshot, WorldState};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::rollup::MockRollup;
    use crate::ledger::MockLedger;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_coordinator_creation() {
        let temp_dir = tempdir().unwrap();
        let store = Arc::new(
            SqliteStore::new(&temp_dir.path().join("duelhouse.db"))
                .await
                .unwrap(),
        );

        let coordinator = Coordinator::new(
            CoordinatorConfig::default(),
            store,
            Arc::new(MockLedger::new()),
            Arc::new(MockRollup::new()),
            Arc::new(SkirmishRules),
        )
        .unwrap();

        let session = coordinator
            .create_session(SessionSettings::default(), EntryRequirements::default())
            .await
            .unwrap();
        assert_eq!(session.status, SessionStatus::Waiting);
        assert_eq!(session.code.len(), 6);
    }
}
