use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBroadcaster, SessionEvent};
use crate::ledger::{is_valid_wallet_address, LedgerGateway, RollupClient};
use crate::locks::SessionLocks;
use crate::storage::CoordinatorStore;
use crate::types::{
    CountdownStatus, EntryRequirements, IntentStatus, JoinIntent, JoinTicket, RefundStatus,
    RefundTicket, Session, SessionSettings, SessionStatus, MAX_MOVE_TIME_LIMIT_SECS,
};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Owns sessions and join intents: creation, the escrow-join protocol,
/// countdown, activation, expiry sweep and the refund queue.
pub struct SessionManager {
    store: Arc<dyn CoordinatorStore>,
    gateway: Arc<LedgerGateway>,
    rollup: Arc<dyn RollupClient>,
    locks: Arc<SessionLocks>,
    events: Arc<EventBroadcaster>,
    config: CoordinatorConfig,
    intents: RwLock<HashMap<(Uuid, String), JoinIntent>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        gateway: Arc<LedgerGateway>,
        rollup: Arc<dyn RollupClient>,
        locks: Arc<SessionLocks>,
        events: Arc<EventBroadcaster>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            rollup,
            locks,
            events,
            config,
            intents: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_session(
        &self,
        settings: SessionSettings,
        entry: EntryRequirements,
    ) -> Result<Session> {
        if settings.variant.trim().is_empty() {
            return Err(CoordinatorError::validation("Variant cannot be empty"));
        }
        if let Some(limit) = settings.move_time_limit_secs {
            if limit == 0 {
                return Err(CoordinatorError::validation(
                    "Move time limit must be greater than 0",
                ));
            }
            if limit > MAX_MOVE_TIME_LIMIT_SECS {
                return Err(CoordinatorError::validation(
                    "Move time limit cannot exceed 24 hours",
                ));
            }
        }
        if let Some(allow_list) = &entry.allow_list {
            for address in allow_list {
                if !is_valid_wallet_address(address) {
                    return Err(CoordinatorError::invalid_address(address));
                }
            }
        }

        let id = Uuid::new_v4();
        let mut code = generate_join_code();
        for _ in 0..3 {
            if self.store.load_session_by_code(&code).await?.is_none() {
                break;
            }
            code = generate_join_code();
        }

        let now = Utc::now();
        let mut session = Session {
            id,
            code: code.clone(),
            status: SessionStatus::Created,
            settings,
            entry,
            participants: Vec::new(),
            escrow_address: LedgerGateway::derive_escrow_address(id),
            escrow_confirmed: 0,
            deposits: HashMap::new(),
            funding_txs: HashMap::new(),
            created_at: now,
            expires_at: now + Duration::seconds(self.config.session_ttl_secs as i64),
            countdown_ends_at: None,
            activated_at: None,
            rollup_started: false,
        };

        self.store.save_session(&session).await?;

        session.status = SessionStatus::Waiting;
        self.store
            .update_session_if_status(&session, SessionStatus::Created)
            .await?;

        tracing::info!("Created session {} with join code {}", id, code);
        Ok(session)
    }

    /// First half of the escrow-join protocol: checks the preconditions
    /// and hands the client an unsigned funding transaction to sign.
    pub async fn build_join_transaction(
        &self,
        session_id: Uuid,
        wallet: &str,
    ) -> Result<JoinTicket> {
        if !is_valid_wallet_address(wallet) {
            return Err(CoordinatorError::invalid_address(wallet));
        }

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.is_participant(wallet) {
            return Err(CoordinatorError::AlreadyJoined(wallet.to_string()));
        }

        match session.status {
            SessionStatus::Waiting => {}
            SessionStatus::Countdown | SessionStatus::Active => {
                return Err(CoordinatorError::SessionFull)
            }
            SessionStatus::Expired => {
                return Err(CoordinatorError::validation("Session has expired"))
            }
            _ => return Err(CoordinatorError::validation("Session is not joinable")),
        }

        if session.expires_at <= Utc::now() {
            return Err(CoordinatorError::validation("Session has expired"));
        }
        if session.is_full() {
            return Err(CoordinatorError::SessionFull);
        }
        if let Some(allow_list) = &session.entry.allow_list {
            if !allow_list.iter().any(|a| a == wallet) {
                return Err(CoordinatorError::NotWhitelisted(wallet.to_string()));
            }
        }

        let unsigned_tx_ref = self.gateway.build_funding_transaction(
            wallet,
            session.entry.entry_fee,
            &session.escrow_address,
        );

        let intent = JoinIntent {
            session_id,
            wallet: wallet.to_string(),
            unsigned_tx_ref: unsigned_tx_ref.clone(),
            expected_amount: session.entry.entry_fee,
            status: IntentStatus::Built,
            built_at: Utc::now(),
        };
        self.intents
            .write()
            .insert((session_id, wallet.to_string()), intent);

        tracing::info!(
            "Built join transaction for wallet {} on session {}",
            wallet,
            session_id
        );

        Ok(JoinTicket {
            session_id,
            wallet: wallet.to_string(),
            unsigned_tx_ref,
            expected_amount: session.entry.entry_fee,
            escrow_address: session.escrow_address,
        })
    }

    /// Second half of the escrow-join protocol: verifies the broadcast
    /// deposit on the ledger, then adds the wallet under the session lock.
    /// Confirming the same deposit twice returns the current session.
    pub async fn confirm_join(
        &self,
        session_id: Uuid,
        wallet: &str,
        signed_tx_ref: &str,
    ) -> Result<Session> {
        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.is_participant(wallet) {
            return if session.funding_txs.get(wallet).map(String::as_str) == Some(signed_tx_ref) {
                Ok(session)
            } else {
                Err(CoordinatorError::AlreadyJoined(wallet.to_string()))
            };
        }

        let intent = self
            .intents
            .read()
            .get(&(session_id, wallet.to_string()))
            .cloned()
            .ok_or_else(|| CoordinatorError::IntentNotFound(wallet.to_string()))?;

        if let Some(pending) = self
            .intents
            .write()
            .get_mut(&(session_id, wallet.to_string()))
        {
            pending.status = IntentStatus::Submitted;
        }

        // ledger round trips happen before taking the session lock
        let confirmation = self.gateway.confirm_transaction(signed_tx_ref).await?;

        if confirmation.sender != wallet {
            self.drop_intent(session_id, wallet);
            return Err(CoordinatorError::validation(
                "Deposit sender does not match the joining wallet",
            ));
        }
        if confirmation.amount < intent.expected_amount {
            self.drop_intent(session_id, wallet);
            self.queue_stray_refund(session_id, wallet, confirmation.amount)
                .await?;
            return Err(CoordinatorError::AmountMismatch {
                need: intent.expected_amount,
                confirmed: confirmation.amount,
            });
        }

        let lock = self.locks.acquire(session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        if session.is_participant(wallet) {
            self.drop_intent(session_id, wallet);
            return if session.funding_txs.get(wallet).map(String::as_str) == Some(signed_tx_ref) {
                Ok(session)
            } else {
                Err(CoordinatorError::AlreadyJoined(wallet.to_string()))
            };
        }

        if session.status != SessionStatus::Waiting
            || session.is_full()
            || session.expires_at <= Utc::now()
        {
            // the deposit landed but the seat is gone
            self.drop_intent(session_id, wallet);
            self.queue_stray_refund(session_id, wallet, confirmation.amount)
                .await?;
            return Err(CoordinatorError::SessionFull);
        }

        session.participants.push(wallet.to_string());
        session
            .deposits
            .insert(wallet.to_string(), confirmation.amount);
        session
            .funding_txs
            .insert(wallet.to_string(), signed_tx_ref.to_string());
        session.escrow_confirmed += confirmation.amount;

        let full = session.is_full();
        if full {
            session.status = SessionStatus::Countdown;
            session.countdown_ends_at =
                Some(Utc::now() + Duration::seconds(self.config.countdown_secs as i64));
        }

        if !self
            .store
            .update_session_if_status(&session, SessionStatus::Waiting)
            .await?
        {
            return Err(CoordinatorError::InvalidTransition {
                from: SessionStatus::Waiting.to_string(),
                to: session.status.to_string(),
            });
        }

        self.drop_intent(session_id, wallet);
        tracing::info!(
            "Wallet {} joined session {} with deposit {}",
            wallet,
            session_id,
            confirmation.amount
        );

        if full {
            self.events.publish(SessionEvent::CountdownStarted {
                session_id,
                ends_at: session.countdown_ends_at.unwrap_or_else(Utc::now),
            });
            tracing::info!(
                "Session {} is full, countdown runs until {:?}",
                session_id,
                session.countdown_ends_at
            );
        }

        Ok(session)
    }

    /// Countdown to Active. Idempotent so that racing timers and manual
    /// activation cannot double-fire.
    pub async fn activate(&self, session_id: Uuid) -> Result<Session> {
        let lock = self.locks.acquire(session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        match session.status {
            SessionStatus::Active => return Ok(session),
            SessionStatus::Countdown => {}
            other => {
                return Err(CoordinatorError::InvalidTransition {
                    from: other.to_string(),
                    to: SessionStatus::Active.to_string(),
                })
            }
        }

        if let Some(ends_at) = session.countdown_ends_at {
            if Utc::now() < ends_at {
                return Err(CoordinatorError::validation("Countdown still running"));
            }
        }

        session.status = SessionStatus::Active;
        session.activated_at = Some(Utc::now());

        if !self
            .store
            .update_session_if_status(&session, SessionStatus::Countdown)
            .await?
        {
            let current = self
                .store
                .load_session(session_id)
                .await?
                .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;
            return if current.status == SessionStatus::Active {
                Ok(current)
            } else {
                Err(CoordinatorError::InvalidTransition {
                    from: current.status.to_string(),
                    to: SessionStatus::Active.to_string(),
                })
            };
        }

        tracing::info!("Session {} is live", session_id);
        Ok(session)
    }

    /// Requests the rollup start for an Active session, retrying with
    /// exponential backoff. Failure never rolls the session back; the
    /// session just keeps reporting `rollup_started == false`.
    pub async fn start_rollup_with_backoff(&self, session_id: Uuid) -> Result<()> {
        if let Some(session) = self.store.load_session(session_id).await? {
            if session.rollup_started || session.status != SessionStatus::Active {
                return Ok(());
            }
        }

        let mut backoff_ms = self.config.rollup_backoff_ms;

        for attempt in 1..=self.config.rollup_max_attempts {
            match self.rollup.start_session(session_id).await {
                Ok(()) => {
                    let lock = self.locks.acquire(session_id);
                    let _guard = lock.lock().await;

                    if let Some(mut session) = self.store.load_session(session_id).await? {
                        if !session.rollup_started {
                            session.rollup_started = true;
                            self.store.save_session(&session).await?;
                        }
                    }

                    self.events
                        .publish(SessionEvent::RollupStarted { session_id });
                    tracing::info!("Rollup started for session {}", session_id);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        "Rollup start attempt {}/{} failed for session {}: {}",
                        attempt,
                        self.config.rollup_max_attempts,
                        session_id,
                        e
                    );
                    if attempt < self.config.rollup_max_attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                    }
                }
            }
        }

        tracing::error!(
            "Rollup start exhausted {} attempts for session {}",
            self.config.rollup_max_attempts,
            session_id
        );
        Err(CoordinatorError::rollup(format!(
            "Rollup start exhausted retries for session {}",
            session_id
        )))
    }

    /// Expires Waiting sessions past their TTL, drops their intents and
    /// queues refunds for any confirmed deposit. Returns how many sessions
    /// this pass expired.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let candidates = self.store.list_expired_waiting(now).await?;
        let mut expired = 0;

        for candidate in candidates {
            let lock = self.locks.acquire(candidate.id);
            let guard = lock.lock().await;

            let Some(mut session) = self.store.load_session(candidate.id).await? else {
                continue;
            };
            if session.status != SessionStatus::Waiting || session.expires_at > now {
                continue;
            }

            session.status = SessionStatus::Expired;
            if !self
                .store
                .update_session_if_status(&session, SessionStatus::Waiting)
                .await?
            {
                continue;
            }

            self.intents
                .write()
                .retain(|(session_id, _), _| *session_id != session.id);

            for (wallet, amount) in &session.deposits {
                self.queue_stray_refund(session.id, wallet, *amount).await?;
            }

            // nothing further happens on an expired session
            self.events.drop_topic(session.id);
            tracing::info!("Expired session {}", session.id);
            expired += 1;

            drop(guard);
            drop(lock);
            self.locks.release(candidate.id);
        }

        Ok(expired)
    }

    /// Pushes queued refunds through the gateway. Tickets that fail stay
    /// queued with their attempt count bumped; the whole pass is safe to
    /// repeat.
    pub async fn process_refunds(&self) -> Result<usize> {
        let queued = self.store.list_queued_refunds().await?;
        let mut done = 0;

        for mut ticket in queued {
            ticket.attempts += 1;
            match self
                .gateway
                .refund(ticket.session_id, &ticket.wallet, ticket.amount)
                .await
            {
                Ok(tx_ref) => {
                    ticket.status = RefundStatus::Done;
                    self.store.save_refund(&ticket).await?;
                    tracing::info!(
                        "Refunded {} to wallet {} for session {} ({})",
                        ticket.amount,
                        ticket.wallet,
                        ticket.session_id,
                        tx_ref
                    );
                    done += 1;
                }
                Err(e) => {
                    self.store.save_refund(&ticket).await?;
                    tracing::warn!(
                        "Refund attempt {} failed for wallet {} on session {}: {}",
                        ticket.attempts,
                        ticket.wallet,
                        ticket.session_id,
                        e
                    );
                }
            }
        }

        Ok(done)
    }

    /// Operator abort. Works from any non-terminal status; deposits and
    /// bets are returned through the settlement path.
    pub async fn abort_session(&self, session_id: Uuid) -> Result<Session> {
        let lock = self.locks.acquire(session_id);
        let _guard = lock.lock().await;

        let mut session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        let previous = session.status;
        if !previous.can_transition_to(SessionStatus::Aborted) {
            return Err(CoordinatorError::InvalidTransition {
                from: previous.to_string(),
                to: SessionStatus::Aborted.to_string(),
            });
        }

        session.status = SessionStatus::Aborted;
        if !self
            .store
            .update_session_if_status(&session, previous)
            .await?
        {
            return Err(CoordinatorError::InvalidTransition {
                from: previous.to_string(),
                to: SessionStatus::Aborted.to_string(),
            });
        }

        self.intents
            .write()
            .retain(|(id, _), _| *id != session_id);

        tracing::warn!("Aborted session {}", session_id);
        Ok(session)
    }

    pub async fn session(&self, session_id: Uuid) -> Result<Session> {
        self.store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))
    }

    pub async fn session_by_code(&self, code: &str) -> Result<Session> {
        self.store
            .load_session_by_code(code)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(code))
    }

    pub async fn countdown_status(&self, session_id: Uuid) -> Result<CountdownStatus> {
        let session = self.session(session_id).await?;
        let remaining_ms = session
            .countdown_ends_at
            .map(|ends_at| (ends_at - Utc::now()).num_milliseconds().max(0))
            .unwrap_or(0);

        Ok(CountdownStatus {
            session_id,
            status: session.status,
            countdown_ends_at: session.countdown_ends_at,
            remaining_ms,
            rollup_started: session.rollup_started,
        })
    }

    /// In-flight join intent, if any. Intents die on confirm, reject and
    /// session expiry.
    pub fn join_intent(&self, session_id: Uuid, wallet: &str) -> Option<JoinIntent> {
        self.intents
            .read()
            .get(&(session_id, wallet.to_string()))
            .cloned()
    }

    fn drop_intent(&self, session_id: Uuid, wallet: &str) {
        self.intents
            .write()
            .remove(&(session_id, wallet.to_string()));
    }

    async fn queue_stray_refund(&self, session_id: Uuid, wallet: &str, amount: u64) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }

        let ticket = RefundTicket {
            session_id,
            wallet: wallet.to_string(),
            amount,
            status: RefundStatus::Queued,
            attempts: 0,
            queued_at: Utc::now(),
        };
        self.store.save_refund(&ticket).await?;
        tracing::warn!(
            "Deposit of {} from wallet {} cannot stay in session {}, refund queued",
            amount,
            wallet,
            session_id
        );
        Ok(())
    }
}

fn generate_join_code() -> String {
    // unambiguous alphabet, no 0/O or 1/I
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
