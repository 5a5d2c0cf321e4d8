use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBroadcaster, SessionEvent};
use crate::game::MoveCoordinator;
use crate::ledger::{LedgerGateway, LedgerRpc, RollupClient};
use crate::locks::SessionLocks;
use crate::pool::{BetStake, BettingPool};
use crate::rules::RulesValidator;
use crate::session::SessionManager;
use crate::settlement::SettlementCoordinator;
use crate::storage::CoordinatorStore;
use crate::types::{
    Coord, CountdownStatus, EntryRequirements, JoinTicket, MoveOutcome, MoveRequest, Outcome,
    PieceKind, Session, SessionSettings, SessionStatus, SettlementResult,
};
use crate::world::WorldSnapshot;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Entry point for hosts. Composes the session, game and settlement
/// coordinators over shared storage, locks and events, and owns the
/// background tasks for countdown activation and rollup startup.
pub struct Coordinator {
    config: CoordinatorConfig,
    sessions: Arc<SessionManager>,
    game: Arc<MoveCoordinator>,
    settlement: Arc<SettlementCoordinator>,
    events: Arc<EventBroadcaster>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn CoordinatorStore>,
        ledger: Arc<dyn LedgerRpc>,
        rollup: Arc<dyn RollupClient>,
        rules: Arc<dyn RulesValidator>,
    ) -> Result<Self> {
        config.validate()?;

        let locks = Arc::new(SessionLocks::new());
        let events = Arc::new(EventBroadcaster::new());
        let gateway = Arc::new(LedgerGateway::new(ledger, &config));

        let settlement = Arc::new(SettlementCoordinator::new(
            store.clone(),
            gateway.clone(),
            locks.clone(),
            events.clone(),
            config.clone(),
        ));
        let game = Arc::new(MoveCoordinator::new(
            store.clone(),
            locks.clone(),
            events.clone(),
            config.clone(),
            settlement.clone(),
            rules,
        ));
        let sessions = Arc::new(SessionManager::new(
            store,
            gateway,
            rollup,
            locks,
            events.clone(),
            config.clone(),
        ));

        Ok(Self {
            config,
            sessions,
            game,
            settlement,
            events,
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    // --- session lifecycle ---

    pub async fn create_session(
        &self,
        settings: SessionSettings,
        entry: EntryRequirements,
    ) -> Result<Session> {
        self.sessions.create_session(settings, entry).await
    }

    pub async fn build_join_transaction(
        &self,
        session_id: Uuid,
        wallet: &str,
    ) -> Result<JoinTicket> {
        self.sessions.build_join_transaction(session_id, wallet).await
    }

    /// Confirms a funded join. When this fills the session, the countdown
    /// begins and activation is scheduled for when it ends.
    pub async fn confirm_join(
        &self,
        session_id: Uuid,
        wallet: &str,
        signed_tx_ref: &str,
    ) -> Result<Session> {
        let session = self
            .sessions
            .confirm_join(session_id, wallet, signed_tx_ref)
            .await?;

        if session.status == SessionStatus::Countdown {
            if let Some(ends_at) = session.countdown_ends_at {
                schedule_activation(self.sessions.clone(), session_id, ends_at);
            }
        }
        Ok(session)
    }

    /// Manual activation, for operators and recovery. The rollup start is
    /// kicked off in the background either way.
    pub async fn activate(&self, session_id: Uuid) -> Result<Session> {
        let session = self.sessions.activate(session_id).await?;
        spawn_rollup_start(self.sessions.clone(), session_id);
        Ok(session)
    }

    pub async fn session(&self, session_id: Uuid) -> Result<Session> {
        self.sessions.session(session_id).await
    }

    pub async fn session_by_code(&self, code: &str) -> Result<Session> {
        self.sessions.session_by_code(code).await
    }

    pub async fn countdown_status(&self, session_id: Uuid) -> Result<CountdownStatus> {
        self.sessions.countdown_status(session_id).await
    }

    pub async fn escrow_address(&self, session_id: Uuid) -> Result<String> {
        Ok(self.sessions.session(session_id).await?.escrow_address)
    }

    pub async fn sweep_expired(&self) -> Result<usize> {
        self.sessions.sweep_expired().await
    }

    pub async fn process_refunds(&self) -> Result<usize> {
        self.sessions.process_refunds().await
    }

    /// Aborts a running or pending session and settles it immediately,
    /// returning every deposit and stake.
    pub async fn abort_session(&self, session_id: Uuid) -> Result<SettlementResult> {
        self.sessions.abort_session(session_id).await?;
        let result = self.settlement.settle(session_id, Outcome::Aborted).await;
        self.game.release_session(session_id);
        result
    }

    // --- live match ---

    pub async fn submit_move(
        &self,
        session_id: Uuid,
        wallet: &str,
        request: MoveRequest,
        anti_fraud_token: &str,
    ) -> Result<MoveOutcome> {
        self.game
            .submit_move(session_id, wallet, request, anti_fraud_token)
            .await
    }

    pub async fn undo_last_move(&self, session_id: Uuid, wallet: &str) -> Result<MoveOutcome> {
        self.game.undo_last_move(session_id, wallet).await
    }

    pub async fn resign(&self, session_id: Uuid, wallet: &str) -> Result<SettlementResult> {
        self.game.resign(session_id, wallet).await
    }

    pub async fn enforce_time_limit(&self, session_id: Uuid) -> Result<Option<SettlementResult>> {
        self.game.enforce_time_limit(session_id).await
    }

    pub async fn valid_moves(
        &self,
        session_id: Uuid,
        wallet: &str,
        from: Option<Coord>,
        piece: Option<PieceKind>,
    ) -> Result<Vec<MoveRequest>> {
        self.game.valid_moves(session_id, wallet, from, piece).await
    }

    pub async fn world_snapshot(&self, session_id: Uuid) -> Result<WorldSnapshot> {
        self.game.world_snapshot(session_id).await
    }

    pub async fn import_snapshot(&self, snapshot: WorldSnapshot) -> Result<()> {
        self.game.import_snapshot(snapshot).await
    }

    // --- betting and settlement ---

    pub async fn record_bet(
        &self,
        session_id: Uuid,
        wallet: &str,
        outcome: Outcome,
        amount: u64,
    ) -> Result<BetStake> {
        self.settlement
            .record_bet(session_id, wallet, outcome, amount)
            .await
    }

    pub async fn betting_pool(&self, session_id: Uuid) -> Result<BettingPool> {
        self.settlement.betting_pool(session_id).await
    }

    pub async fn settlement_result(&self, session_id: Uuid) -> Result<SettlementResult> {
        self.settlement.result(session_id).await
    }

    pub async fn reconcile(&self, session_id: Uuid) -> Result<SettlementResult> {
        self.settlement.reconcile(session_id).await
    }

    /// Live event feed for one session.
    pub fn subscribe(&self, session_id: Uuid) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe(session_id)
    }
}

/// Activates the session once its countdown ends. Duplicate timers are
/// harmless: activation is idempotent and status-guarded.
fn schedule_activation(
    sessions: Arc<SessionManager>,
    session_id: Uuid,
    ends_at: DateTime<Utc>,
) {
    tokio::spawn(async move {
        let wait = (ends_at - Utc::now()).to_std().unwrap_or_default();
        tokio::time::sleep(wait + std::time::Duration::from_millis(50)).await;

        match sessions.activate(session_id).await {
            Ok(_) => spawn_rollup_start(sessions, session_id),
            Err(CoordinatorError::InvalidTransition { .. }) => {
                // the session ended or was aborted during the countdown
            }
            Err(e) => {
                tracing::warn!("Scheduled activation of session {} failed: {}", session_id, e)
            }
        }
    });
}

fn spawn_rollup_start(sessions: Arc<SessionManager>, session_id: Uuid) {
    tokio::spawn(async move {
        if let Err(e) = sessions.start_rollup_with_backoff(session_id).await {
            tracing::error!("Rollup never started for session {}: {}", session_id, e);
        }
    });
}
