use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBroadcaster, SessionEvent};
use crate::locks::SessionLocks;
use crate::rules::RulesValidator;
use crate::settlement::SettlementCoordinator;
use crate::storage::CoordinatorStore;
use crate::types::{
    Coord, MoveKind, MoveOutcome, MoveRecord, MoveRequest, Outcome, PieceKind, Session,
    SessionStatus, SettlementResult, MAX_PLAYERS,
};
use crate::world::{WorldSnapshot, WorldState};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Tolerated clock skew for tokens stamped slightly in the future.
const MAX_CLOCK_SKEW_SECS: i64 = 5;

/// How long a settlement reader polls for a row another worker is still
/// writing before giving up.
const SETTLEMENT_WAIT_ATTEMPTS: u32 = 20;
const SETTLEMENT_WAIT_MS: u64 = 50;

/// Client-side anti-fraud token: `nonce.timestamp.digest`, where the digest
/// binds the wallet, nonce and timestamp together. Tokens are single use
/// and expire after a short window.
pub fn mint_anti_fraud_token(wallet: &str) -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let nonce_hex = hex::encode(nonce);
    let timestamp = Utc::now().timestamp();
    let digest = token_digest(wallet, &nonce_hex, timestamp);
    format!("{}.{}.{}", nonce_hex, timestamp, digest)
}

fn token_digest(wallet: &str, nonce: &str, timestamp: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}|{}|{}", wallet, nonce, timestamp).as_bytes());
    hex::encode(hasher.finalize())
}

fn undo_hash(last_hash: &str, of_seq: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(last_hash.as_bytes());
    hasher.update(b"undone");
    hasher.update(of_seq.to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Drives live matches: validates and applies moves, keeps the per-session
/// world, records the append-only move log and hands finished sessions to
/// settlement.
pub struct MoveCoordinator {
    store: Arc<dyn CoordinatorStore>,
    locks: Arc<SessionLocks>,
    events: Arc<EventBroadcaster>,
    config: CoordinatorConfig,
    settlement: Arc<SettlementCoordinator>,
    rules: Arc<dyn RulesValidator>,
    worlds: RwLock<HashMap<Uuid, WorldState>>,
    used_tokens: RwLock<HashMap<Uuid, HashSet<String>>>,
}

impl MoveCoordinator {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        locks: Arc<SessionLocks>,
        events: Arc<EventBroadcaster>,
        config: CoordinatorConfig,
        settlement: Arc<SettlementCoordinator>,
        rules: Arc<dyn RulesValidator>,
    ) -> Self {
        Self {
            store,
            locks,
            events,
            config,
            settlement,
            rules,
            worlds: RwLock::new(HashMap::new()),
            used_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Validates and applies one move. Everything a player can cause comes
    /// back in-band as `success == false` with the current version, so a
    /// client can resync; only infrastructure faults are errors.
    pub async fn submit_move(
        &self,
        session_id: Uuid,
        wallet: &str,
        request: MoveRequest,
        anti_fraud_token: &str,
    ) -> Result<MoveOutcome> {
        let received_at = std::time::Instant::now();
        let lock = self.locks.acquire(session_id);
        let guard = lock.lock().await;

        let Some(session) = self.store.load_session(session_id).await? else {
            return Ok(MoveOutcome::rejected("Session not found", 0));
        };

        if session.status != SessionStatus::Active {
            return Ok(MoveOutcome::rejected(
                "Session is not active",
                self.version_of(session_id),
            ));
        }
        let Some(agent) = session.participant_index(wallet) else {
            return Ok(MoveOutcome::rejected(
                "Wallet is not a participant",
                self.version_of(session_id),
            ));
        };

        let mut world = self.ensure_world(&session).await?;

        if world.current_turn() != agent {
            return Ok(MoveOutcome::rejected("Not your turn", world.version()));
        }
        if let Err(reason) = self.verify_token(session_id, wallet, anti_fraud_token) {
            return Ok(MoveOutcome::rejected(reason, world.version()));
        }
        if let Err(reason) = self.rules.is_legal_move(&world, agent, &request) {
            return Ok(MoveOutcome::rejected(reason, world.version()));
        }

        let applied = world.apply_move(agent, &request)?;
        let seq = self.store.next_move_seq(session_id).await?;
        let record = MoveRecord {
            session_id,
            seq,
            author: wallet.to_string(),
            from_coord: request.from,
            to_coord: request.to,
            piece: request.piece,
            anti_fraud_token: anti_fraud_token.to_string(),
            hash: applied.hash.clone(),
            applied_at: Utc::now(),
            latency_ms: received_at.elapsed().as_millis() as u64,
            kind: MoveKind::Applied,
        };
        self.store.append_move(&record).await?;
        self.consume_token(session_id, anti_fraud_token);

        let terminal = self.rules.is_terminal(&world);
        self.worlds.write().insert(session_id, world);

        self.events.publish(SessionEvent::MoveApplied {
            session_id,
            seq,
            version: applied.version,
            hash: applied.hash.clone(),
            author: wallet.to_string(),
        });
        tracing::info!(
            "Move {} applied on session {} by player {} ({} -> {})",
            seq,
            session_id,
            agent,
            request.from,
            request.to
        );

        let final_outcome = if terminal.terminal {
            let outcome = match terminal.winner {
                Some(index) => Outcome::for_winner_index(index),
                None => Outcome::Draw,
            };
            let mut finished = session;
            finished.status = SessionStatus::Completed;
            if !self
                .store
                .update_session_if_status(&finished, SessionStatus::Active)
                .await?
            {
                tracing::warn!("Session {} changed status under a final move", session_id);
            }
            Some(outcome)
        } else {
            None
        };

        drop(guard);

        if let Some(outcome) = final_outcome {
            drop(lock);
            // the move stands even when the payout needs reconciliation
            if let Err(e) = self.settlement.settle(session_id, outcome).await {
                tracing::error!(
                    "Settlement after the final move of session {} failed: {}",
                    session_id,
                    e
                );
            }
            self.release_session(session_id);
        }

        Ok(MoveOutcome::applied(applied.hash, seq, applied.version))
    }

    /// Takes back the caller's own last move within the undo window. The
    /// log keeps both records; the world goes back one version.
    pub async fn undo_last_move(&self, session_id: Uuid, wallet: &str) -> Result<MoveOutcome> {
        let received_at = std::time::Instant::now();
        let lock = self.locks.acquire(session_id);
        let _guard = lock.lock().await;

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.status != SessionStatus::Active {
            return Err(CoordinatorError::validation("Session is not active"));
        }
        if !session.is_participant(wallet) {
            return Err(CoordinatorError::validation("Wallet is not a participant"));
        }

        let last = self
            .store
            .last_move(session_id)
            .await?
            .filter(|record| matches!(record.kind, MoveKind::Applied))
            .ok_or(CoordinatorError::NoMoveToUndo)?;

        if last.author != wallet {
            return Err(CoordinatorError::NotAuthor);
        }
        let age = Utc::now() - last.applied_at;
        if age > Duration::seconds(self.config.undo_window_secs as i64) {
            return Err(CoordinatorError::WindowExpired);
        }

        let mut world = self.ensure_world(&session).await?;
        if !world.can_revert() {
            return Err(CoordinatorError::NoMoveToUndo);
        }

        let restored_version = world.revert_last()?;
        let seq = self.store.next_move_seq(session_id).await?;
        let hash = undo_hash(&last.hash, last.seq);
        let record = MoveRecord {
            session_id,
            seq,
            author: wallet.to_string(),
            from_coord: last.to_coord,
            to_coord: last.from_coord,
            piece: last.piece,
            anti_fraud_token: String::new(),
            hash: hash.clone(),
            applied_at: Utc::now(),
            latency_ms: received_at.elapsed().as_millis() as u64,
            kind: MoveKind::Undone { of_seq: last.seq },
        };
        self.store.append_move(&record).await?;
        self.worlds.write().insert(session_id, world);

        self.events.publish(SessionEvent::MoveUndone {
            session_id,
            of_seq: last.seq,
            version: restored_version,
        });
        tracing::info!(
            "Move {} undone on session {} by its author",
            last.seq,
            session_id
        );

        Ok(MoveOutcome::applied(hash, seq, restored_version))
    }

    /// Concede the match. The opponent wins and the session settles at
    /// once; resigning an already finished session returns its settlement.
    pub async fn resign(&self, session_id: Uuid, wallet: &str) -> Result<SettlementResult> {
        let lock = self.locks.acquire(session_id);
        let guard = lock.lock().await;

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        match session.status {
            SessionStatus::Active => {}
            SessionStatus::Completed | SessionStatus::Aborted => {
                drop(guard);
                drop(lock);
                return self.await_settlement(session_id).await;
            }
            _ => return Err(CoordinatorError::validation("Session is not active")),
        }

        let Some(agent) = session.participant_index(wallet) else {
            return Err(CoordinatorError::validation("Wallet is not a participant"));
        };
        let outcome = Outcome::for_winner_index((agent + 1) % MAX_PLAYERS);

        let mut finished = session;
        finished.status = SessionStatus::Completed;
        if !self
            .store
            .update_session_if_status(&finished, SessionStatus::Active)
            .await?
        {
            return Err(CoordinatorError::InvalidTransition {
                from: SessionStatus::Active.to_string(),
                to: SessionStatus::Completed.to_string(),
            });
        }
        tracing::info!("Player {} resigned session {}", agent, session_id);

        drop(guard);
        drop(lock);
        let result = self.settlement.settle(session_id, outcome).await;
        self.release_session(session_id);
        result
    }

    /// Forfeits the on-turn player when the per-move clock has run out.
    /// Returns the settlement when a forfeit happened, None otherwise.
    pub async fn enforce_time_limit(&self, session_id: Uuid) -> Result<Option<SettlementResult>> {
        let lock = self.locks.acquire(session_id);
        let guard = lock.lock().await;

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.status != SessionStatus::Active {
            return Ok(None);
        }
        let Some(limit_secs) = session
            .settings
            .move_time_limit_secs
            .or(self.config.default_move_time_limit_secs)
        else {
            return Ok(None);
        };

        let last = self.store.last_move(session_id).await?;
        let Some(clock_base) = last.map(|r| r.applied_at).or(session.activated_at) else {
            return Ok(None);
        };

        // a limit that cannot form a representable deadline can never expire
        let Some(deadline) = i64::try_from(limit_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|limit| clock_base.checked_add_signed(limit))
        else {
            return Ok(None);
        };
        if Utc::now() <= deadline {
            return Ok(None);
        }

        let world = self.ensure_world(&session).await?;
        let on_turn = world.current_turn();
        let outcome = Outcome::for_winner_index((on_turn + 1) % MAX_PLAYERS);

        let mut finished = session;
        finished.status = SessionStatus::Completed;
        if !self
            .store
            .update_session_if_status(&finished, SessionStatus::Active)
            .await?
        {
            return Ok(None);
        }
        tracing::warn!(
            "Session {} forfeited on time by player {}",
            session_id,
            on_turn
        );

        drop(guard);
        drop(lock);
        let result = self.settlement.settle(session_id, outcome).await;
        self.release_session(session_id);
        Ok(Some(result?))
    }

    /// Legal moves for a participant, optionally narrowed to one origin
    /// square or one piece kind. Off-turn queries are allowed.
    pub async fn valid_moves(
        &self,
        session_id: Uuid,
        wallet: &str,
        from: Option<Coord>,
        piece: Option<PieceKind>,
    ) -> Result<Vec<MoveRequest>> {
        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.status != SessionStatus::Active {
            return Err(CoordinatorError::validation("Session is not active"));
        }
        let Some(agent) = session.participant_index(wallet) else {
            return Err(CoordinatorError::validation("Wallet is not a participant"));
        };

        let world = self.ensure_world(&session).await?;
        Ok(self.rules.enumerate_legal_moves(&world, agent, from, piece))
    }

    pub async fn world_snapshot(&self, session_id: Uuid) -> Result<WorldSnapshot> {
        if let Some(world) = self.worlds.read().get(&session_id) {
            return Ok(world.snapshot());
        }

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.status == SessionStatus::Active {
            let world = self.ensure_world(&session).await?;
            Ok(world.snapshot())
        } else {
            Err(CoordinatorError::validation("Session has no world state"))
        }
    }

    /// Replaces the in-memory world with an imported snapshot, for
    /// migrating a session between coordinator processes.
    pub async fn import_snapshot(&self, snapshot: WorldSnapshot) -> Result<()> {
        let session_id = snapshot.session_id;
        self.store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        let version = snapshot.version;
        self.worlds
            .write()
            .insert(session_id, WorldState::from_snapshot(snapshot));
        tracing::info!(
            "Imported world snapshot at version {} for session {}",
            version,
            session_id
        );
        Ok(())
    }

    /// Settlement of a finished session. A final move marks the session
    /// Completed before its settlement row lands, so a reader arriving in
    /// that window waits briefly instead of reporting the row missing.
    async fn await_settlement(&self, session_id: Uuid) -> Result<SettlementResult> {
        for _ in 1..SETTLEMENT_WAIT_ATTEMPTS {
            match self.settlement.result(session_id).await {
                Err(CoordinatorError::SettlementNotFound(_)) => {
                    tokio::time::sleep(std::time::Duration::from_millis(SETTLEMENT_WAIT_MS)).await
                }
                other => return other,
            }
        }
        self.settlement.result(session_id).await
    }

    /// Drops the in-memory state a finished session no longer needs. The
    /// world stays reconstructible from the move log, so a late reader
    /// rebuilds it on demand.
    pub(crate) fn release_session(&self, session_id: Uuid) {
        self.worlds.write().remove(&session_id);
        self.used_tokens.write().remove(&session_id);
        self.events.drop_topic(session_id);
        self.locks.release(session_id);
    }

    /// World for the session, rebuilt from the move log when this process
    /// has not seen it yet. Replay is deterministic, so every coordinator
    /// arrives at the same version and hash chain.
    async fn ensure_world(&self, session: &Session) -> Result<WorldState> {
        if let Some(world) = self.worlds.read().get(&session.id) {
            return Ok(world.clone());
        }

        let records = self.store.load_moves(session.id).await?;
        let mut world = WorldState::initial(session.id);
        for record in &records {
            match record.kind {
                MoveKind::Applied => {
                    let agent = session.participant_index(&record.author).ok_or_else(|| {
                        CoordinatorError::internal(format!(
                            "Move author {} is not a participant of session {}",
                            record.author, session.id
                        ))
                    })?;
                    let request = MoveRequest {
                        from: record.from_coord,
                        to: record.to_coord,
                        piece: record.piece,
                    };
                    world.apply_move(agent, &request)?;
                }
                MoveKind::Undone { .. } => {
                    world.revert_last()?;
                }
            }
        }

        let mut worlds = self.worlds.write();
        let entry = worlds.entry(session.id).or_insert(world);
        Ok(entry.clone())
    }

    fn version_of(&self, session_id: Uuid) -> u64 {
        self.worlds
            .read()
            .get(&session_id)
            .map(|w| w.version())
            .unwrap_or(0)
    }

    fn verify_token(
        &self,
        session_id: Uuid,
        wallet: &str,
        token: &str,
    ) -> std::result::Result<(), String> {
        let mut parts = token.split('.');
        let (Some(nonce), Some(raw_ts), Some(digest), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err("Malformed anti-fraud token".to_string());
        };
        let Ok(timestamp) = raw_ts.parse::<i64>() else {
            return Err("Malformed anti-fraud token".to_string());
        };

        if token_digest(wallet, nonce, timestamp) != digest {
            return Err("Anti-fraud token does not match the wallet".to_string());
        }

        let age = Utc::now().timestamp() - timestamp;
        if age > self.config.token_max_age_secs {
            return Err("Anti-fraud token has expired".to_string());
        }
        if age < -MAX_CLOCK_SKEW_SECS {
            return Err("Anti-fraud token timestamp is in the future".to_string());
        }

        let used = self.used_tokens.read();
        if used
            .get(&session_id)
            .map_or(false, |nonces| nonces.contains(nonce))
        {
            return Err("Anti-fraud token was already used".to_string());
        }

        Ok(())
    }

    /// Burns the token's nonce. Only called for applied moves, so a token
    /// rejected for another reason stays valid for a retry.
    fn consume_token(&self, session_id: Uuid, token: &str) {
        if let Some(nonce) = token.split('.').next() {
            self.used_tokens
                .write()
                .entry(session_id)
                .or_default()
                .insert(nonce.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{LedgerGateway, MockLedger};
    use crate::rules::SkirmishRules;
    use crate::storage::SqliteStore;
    use crate::types::{EntryRequirements, SessionSettings};
    use futures::future::join_all;
    use tempfile::tempdir;

    const FEE: u64 = 100_000;

    struct Harness {
        game: MoveCoordinator,
        ledger: Arc<MockLedger>,
        store: Arc<SqliteStore>,
        events: Arc<EventBroadcaster>,
        dir: tempfile::TempDir,
    }

    async fn harness() -> Harness {
        harness_with(CoordinatorConfig {
            settle_backoff_ms: 10,
            ..Default::default()
        })
        .await
    }

    async fn harness_with(config: CoordinatorConfig) -> Harness {
        let dir = tempdir().unwrap();
        let store = Arc::new(
            SqliteStore::new(&dir.path().join("duelhouse.db"))
                .await
                .unwrap(),
        );
        let ledger = Arc::new(MockLedger::new());
        let events = Arc::new(EventBroadcaster::new());
        let locks = Arc::new(SessionLocks::new());
        let gateway = Arc::new(LedgerGateway::new(ledger.clone(), &config));

        let settlement = Arc::new(SettlementCoordinator::new(
            store.clone(),
            gateway,
            locks.clone(),
            events.clone(),
            config.clone(),
        ));
        let game = MoveCoordinator::new(
            store.clone(),
            locks,
            events.clone(),
            config,
            settlement,
            Arc::new(SkirmishRules),
        );

        Harness {
            game,
            ledger,
            store,
            events,
            dir,
        }
    }

    fn wallet(tag: u8) -> String {
        format!("{:02x}", tag).repeat(32)
    }

    fn scout_step(from: (i16, i16), to: (i16, i16)) -> MoveRequest {
        MoveRequest {
            from: Coord::new(from.0, from.1),
            to: Coord::new(to.0, to.1),
            piece: PieceKind::Scout,
        }
    }

    /// Persists an Active two-player session ready for moves.
    async fn active_session(store: &SqliteStore, settings: SessionSettings) -> Session {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut deposits = HashMap::new();
        deposits.insert(wallet(1), FEE);
        deposits.insert(wallet(2), FEE);

        let session = Session {
            id,
            code: format!("G{}", &id.simple().to_string()[..5]).to_uppercase(),
            status: SessionStatus::Active,
            settings,
            entry: EntryRequirements {
                entry_fee: FEE,
                ..Default::default()
            },
            participants: vec![wallet(1), wallet(2)],
            escrow_address: LedgerGateway::derive_escrow_address(id),
            escrow_confirmed: 2 * FEE,
            deposits,
            funding_txs: HashMap::new(),
            created_at: now,
            expires_at: now + Duration::hours(24),
            countdown_ends_at: None,
            activated_at: Some(now),
            rollup_started: true,
        };
        store.save_session(&session).await.unwrap();
        session
    }

    async fn submit(
        h: &Harness,
        session_id: Uuid,
        wallet: &str,
        mv: MoveRequest,
    ) -> MoveOutcome {
        h.game
            .submit_move(session_id, wallet, mv, &mint_anti_fraud_token(wallet))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_submit_move_applies_and_logs() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;
        let mut rx = h.events.subscribe(session.id);

        let outcome = submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;

        assert!(outcome.success);
        assert_eq!(outcome.seq, 1);
        assert_eq!(outcome.version, 1);
        assert!(!outcome.hash.is_empty());

        let log = h.store.load_moves(session.id).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].author, wallet(1));
        assert!(log[0].latency_ms < 1_000);

        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::MoveApplied { seq: 1, version: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_player_rejections_are_in_band() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        // player 2 moving first
        let off_turn = submit(&h, session.id, &wallet(2), scout_step((1, 4), (1, 3))).await;
        assert!(!off_turn.success);
        assert_eq!(off_turn.reason.as_deref(), Some("Not your turn"));
        assert_eq!(off_turn.version, 0);

        // a wallet that never joined
        let outsider = submit(&h, session.id, &wallet(9), scout_step((1, 0), (1, 1))).await;
        assert!(!outsider.success);

        // a scout cannot jump two squares
        let illegal = submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 3))).await;
        assert!(!illegal.success);
        assert_eq!(illegal.version, 0);

        // nothing was recorded
        assert!(h.store.load_moves(session.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_and_replayed_tokens_are_rejected() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        // token stamped beyond the max age
        let expired_ts = Utc::now().timestamp() - 3_600;
        let stale = format!(
            "{}.{}.{}",
            "ab".repeat(16),
            expired_ts,
            token_digest(&wallet(1), &"ab".repeat(16), expired_ts)
        );
        let rejected = h
            .game
            .submit_move(session.id, &wallet(1), scout_step((1, 0), (1, 1)), &stale)
            .await
            .unwrap();
        assert!(!rejected.success);
        assert_eq!(rejected.reason.as_deref(), Some("Anti-fraud token has expired"));
        assert_eq!(rejected.version, 0);

        // tampered digest
        let forged = format!("{}.{}.{}", "cd".repeat(16), Utc::now().timestamp(), "00".repeat(32));
        let rejected = h
            .game
            .submit_move(session.id, &wallet(1), scout_step((1, 0), (1, 1)), &forged)
            .await
            .unwrap();
        assert!(!rejected.success);

        // a consumed token cannot be replayed on a later turn
        let token = mint_anti_fraud_token(&wallet(1));
        let first = h
            .game
            .submit_move(session.id, &wallet(1), scout_step((1, 0), (1, 1)), &token)
            .await
            .unwrap();
        assert!(first.success);
        submit(&h, session.id, &wallet(2), scout_step((1, 4), (1, 3))).await;

        let replayed = h
            .game
            .submit_move(session.id, &wallet(1), scout_step((1, 1), (0, 2)), &token)
            .await
            .unwrap();
        assert!(!replayed.success);
        assert_eq!(
            replayed.reason.as_deref(),
            Some("Anti-fraud token was already used")
        );
        assert_eq!(replayed.version, 2);
    }

    #[tokio::test]
    async fn test_racing_duplicates_keep_the_log_gapless() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        // the same player races five copies of their move
        let session_id = session.id;
        let results = join_all((0..5).map(|_| {
            let game = &h.game;
            let player = wallet(1);
            async move {
                let token = mint_anti_fraud_token(&player);
                game.submit_move(session_id, &player, scout_step((1, 0), (1, 1)), &token)
                    .await
            }
        }))
        .await;

        let applied: Vec<_> = results
            .iter()
            .map(|r| r.as_ref().unwrap())
            .filter(|o| o.success)
            .collect();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].seq, 1);

        let log = h.store.load_moves(session.id).await.unwrap();
        assert_eq!(log.len(), 1);

        // play continues normally afterwards
        let next = submit(&h, session.id, &wallet(2), scout_step((1, 4), (1, 3))).await;
        assert!(next.success);
        assert_eq!(next.seq, 2);
    }

    #[tokio::test]
    async fn test_undo_restores_the_previous_version() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;
        let mut rx = h.events.subscribe(session.id);

        submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;
        let undone = h.game.undo_last_move(session.id, &wallet(1)).await.unwrap();

        assert!(undone.success);
        assert_eq!(undone.seq, 2);
        assert_eq!(undone.version, 0);

        // both the move and its undo are in the log
        let log = h.store.load_moves(session.id).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].kind, MoveKind::Undone { of_seq: 1 });

        let _ = rx.try_recv().unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            SessionEvent::MoveUndone { of_seq: 1, version: 0, .. }
        ));

        // only one step back is kept
        assert!(matches!(
            h.game.undo_last_move(session.id, &wallet(1)).await,
            Err(CoordinatorError::NoMoveToUndo)
        ));

        // the author may replace the move
        let replay = submit(&h, session.id, &wallet(1), scout_step((1, 0), (0, 1))).await;
        assert!(replay.success);
        assert_eq!(replay.version, 1);
    }

    #[tokio::test]
    async fn test_undo_is_author_only_and_windowed() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        assert!(matches!(
            h.game.undo_last_move(session.id, &wallet(1)).await,
            Err(CoordinatorError::NoMoveToUndo)
        ));

        submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;
        assert!(matches!(
            h.game.undo_last_move(session.id, &wallet(2)).await,
            Err(CoordinatorError::NotAuthor)
        ));

        // a zero-length window has always expired
        let strict = harness_with(CoordinatorConfig {
            undo_window_secs: 0,
            settle_backoff_ms: 10,
            ..Default::default()
        })
        .await;
        let session = active_session(&strict.store, SessionSettings::default()).await;
        submit(&strict, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(matches!(
            strict.game.undo_last_move(session.id, &wallet(1)).await,
            Err(CoordinatorError::WindowExpired)
        ));
    }

    #[tokio::test]
    async fn test_crown_capture_ends_and_settles_the_match() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        // player 1 marches a scout to the enemy crown
        submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;
        submit(&h, session.id, &wallet(2), scout_step((1, 4), (0, 3))).await;
        submit(&h, session.id, &wallet(1), scout_step((1, 1), (1, 2))).await;
        submit(&h, session.id, &wallet(2), scout_step((0, 3), (0, 2))).await;
        submit(&h, session.id, &wallet(1), scout_step((1, 2), (1, 3))).await;
        submit(&h, session.id, &wallet(2), scout_step((0, 2), (0, 1))).await;
        let winning = submit(&h, session.id, &wallet(1), scout_step((1, 3), (2, 4))).await;
        assert!(winning.success);
        assert_eq!(winning.seq, 7);

        let stored = h.store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);

        let settlement = h.game.settlement.result(session.id).await.unwrap();
        assert_eq!(settlement.outcome, Outcome::Player1Win);
        assert_eq!(settlement.payouts.get(&wallet(1)), Some(&195_000));
        assert_eq!(h.ledger.payout_submissions().len(), 1);

        // the board rejects play after the end
        let late = submit(&h, session.id, &wallet(2), scout_step((3, 4), (3, 3))).await;
        assert!(!late.success);
        assert_eq!(late.reason.as_deref(), Some("Session is not active"));
    }

    #[tokio::test]
    async fn test_resign_forfeits_to_the_opponent() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        let settlement = h.game.resign(session.id, &wallet(2)).await.unwrap();
        assert_eq!(settlement.outcome, Outcome::Player1Win);
        assert_eq!(settlement.payouts.get(&wallet(1)), Some(&195_000));

        let stored = h.store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);

        // resigning again just reads the settlement back
        let again = h.game.resign(session.id, &wallet(2)).await.unwrap();
        assert_eq!(again.outcome, Outcome::Player1Win);
        assert_eq!(h.ledger.payout_submissions().len(), 1);
    }

    #[tokio::test]
    async fn test_resign_waits_out_a_racing_settlement_write() {
        let h = harness().await;
        let mut session = active_session(&h.store, SessionSettings::default()).await;

        // the winner's final move has committed the session, but its
        // settlement row is still in flight
        session.status = SessionStatus::Completed;
        h.store.save_session(&session).await.unwrap();

        let settlement = h.game.settlement.clone();
        let session_id = session.id;
        let writer = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            settlement.settle(session_id, Outcome::Player1Win).await
        });

        let seen = h.game.resign(session.id, &wallet(2)).await.unwrap();
        assert_eq!(seen.outcome, Outcome::Player1Win);
        assert_eq!(seen.payouts.get(&wallet(1)), Some(&195_000));
        writer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_finished_sessions_release_scratch_state() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;
        assert!(h.game.worlds.read().contains_key(&session.id));
        assert!(h.game.used_tokens.read().contains_key(&session.id));

        let mut rx = h.events.subscribe(session.id);
        h.game.resign(session.id, &wallet(2)).await.unwrap();

        assert!(h.game.worlds.read().is_empty());
        assert!(h.game.used_tokens.read().is_empty());
        assert!(h.game.locks.is_empty());

        // the topic delivers its buffered end event, then closes
        assert!(matches!(rx.recv().await, Ok(SessionEvent::Ended { .. })));
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_time_limit_forfeits_the_on_turn_player() {
        let h = harness().await;
        let settings = SessionSettings {
            move_time_limit_secs: Some(1),
            ..Default::default()
        };
        let mut session = active_session(&h.store, settings).await;

        // within the clock, nothing happens
        assert!(h
            .game
            .enforce_time_limit(session.id)
            .await
            .unwrap()
            .is_none());

        // backdate activation so player 1's clock has run out
        session.activated_at = Some(Utc::now() - Duration::seconds(10));
        h.store.save_session(&session).await.unwrap();

        let result = h
            .game
            .enforce_time_limit(session.id)
            .await
            .unwrap()
            .expect("forfeit settlement");
        assert_eq!(result.outcome, Outcome::Player2Win);

        let stored = h.store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_oversized_move_clock_never_forfeits() {
        let h = harness().await;

        // limits past the calendar and limits that wrap a signed cast
        for limit in [10_u64.pow(16), u64::MAX] {
            let settings = SessionSettings {
                move_time_limit_secs: Some(limit),
                ..Default::default()
            };
            let mut session = active_session(&h.store, settings).await;
            session.activated_at = Some(Utc::now() - Duration::days(1));
            h.store.save_session(&session).await.unwrap();

            assert!(h
                .game
                .enforce_time_limit(session.id)
                .await
                .unwrap()
                .is_none());
            let stored = h.store.load_session(session.id).await.unwrap().unwrap();
            assert_eq!(stored.status, SessionStatus::Active);
        }
    }

    #[tokio::test]
    async fn test_valid_moves_respects_filters() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        let all = h
            .game
            .valid_moves(session.id, &wallet(1), None, None)
            .await
            .unwrap();
        assert!(!all.is_empty());

        let from_scout = h
            .game
            .valid_moves(session.id, &wallet(1), Some(Coord::new(1, 0)), None)
            .await
            .unwrap();
        assert!(from_scout.iter().all(|m| m.from == Coord::new(1, 0)));
        assert_eq!(from_scout.len(), 3);

        // off-turn queries work too
        let for_waiting_player = h
            .game
            .valid_moves(session.id, &wallet(2), None, Some(PieceKind::Crown))
            .await
            .unwrap();
        assert!(for_waiting_player
            .iter()
            .all(|m| m.piece == PieceKind::Crown));

        assert!(h
            .game
            .valid_moves(session.id, &wallet(9), None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_snapshot_survives_a_coordinator_restart() {
        let h = harness().await;
        let session = active_session(&h.store, SessionSettings::default()).await;

        submit(&h, session.id, &wallet(1), scout_step((1, 0), (1, 1))).await;
        submit(&h, session.id, &wallet(2), scout_step((1, 4), (1, 3))).await;
        let exported = h.game.world_snapshot(session.id).await.unwrap();
        assert_eq!(exported.version, 2);

        // a new coordinator over the same database replays the log
        let config = CoordinatorConfig {
            settle_backoff_ms: 10,
            ..Default::default()
        };
        let store = Arc::new(
            SqliteStore::new(&h.dir.path().join("duelhouse.db"))
                .await
                .unwrap(),
        );
        let locks = Arc::new(SessionLocks::new());
        let events = Arc::new(EventBroadcaster::new());
        let gateway = Arc::new(LedgerGateway::new(Arc::new(MockLedger::new()), &config));
        let settlement = Arc::new(SettlementCoordinator::new(
            store.clone(),
            gateway,
            locks.clone(),
            events.clone(),
            config.clone(),
        ));
        let restarted = MoveCoordinator::new(
            store,
            locks,
            events,
            config,
            settlement,
            Arc::new(SkirmishRules),
        );

        let replayed = restarted.world_snapshot(session.id).await.unwrap();
        assert_eq!(replayed, exported);

        // an imported snapshot replaces the in-memory world outright
        restarted.import_snapshot(exported.clone()).await.unwrap();
        assert_eq!(
            restarted.world_snapshot(session.id).await.unwrap(),
            exported
        );
    }
}
