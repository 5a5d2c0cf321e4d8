use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, Result};
use crate::events::{EventBroadcaster, SessionEvent};
use crate::ledger::{is_valid_wallet_address, LedgerGateway};
use crate::locks::SessionLocks;
use crate::pool::{BetStake, BettingPool};
use crate::storage::CoordinatorStore;
use crate::types::{Outcome, Session, SessionStatus, SettlementResult, SettlementStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Turns a finished session into ledger payouts exactly once, with
/// retries and a manual reconciliation escape hatch.
pub struct SettlementCoordinator {
    store: Arc<dyn CoordinatorStore>,
    gateway: Arc<LedgerGateway>,
    locks: Arc<SessionLocks>,
    events: Arc<EventBroadcaster>,
    config: CoordinatorConfig,
}

impl SettlementCoordinator {
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        gateway: Arc<LedgerGateway>,
        locks: Arc<SessionLocks>,
        events: Arc<EventBroadcaster>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            gateway,
            locks,
            events,
            config,
        }
    }

    /// Settles a Completed or Aborted session. The first call freezes the
    /// pool, computes payouts and submits them; later calls return the
    /// recorded settlement without touching the ledger again. A result
    /// stuck in FailedNeedsReconciliation is the one exception: its
    /// payouts go back through the submission path.
    pub async fn settle(&self, session_id: Uuid, outcome: Outcome) -> Result<SettlementResult> {
        let lock = self.locks.acquire(session_id);
        let guard = lock.lock().await;

        if let Some(mut existing) = self.store.load_settlement(session_id).await? {
            if existing.status != SettlementStatus::FailedNeedsReconciliation {
                return Ok(existing);
            }
            existing.status = SettlementStatus::Pending;
            self.store.save_settlement(&existing).await?;
            drop(guard);
            self.submit_with_retries(&mut existing).await?;
            return Ok(existing);
        }

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        match session.status {
            SessionStatus::Completed | SessionStatus::Aborted => {}
            other => {
                return Err(CoordinatorError::InvalidTransition {
                    from: other.to_string(),
                    to: SessionStatus::Completed.to_string(),
                })
            }
        }

        // no more bets once the outcome is known
        let mut pool = self
            .store
            .load_pool(session_id)
            .await?
            .unwrap_or_else(|| BettingPool::new(session_id));
        if !pool.frozen {
            pool.freeze();
            self.store.save_pool(&pool).await?;
        }

        let payouts = compute_payouts(&session, &pool, outcome, self.config.platform_fee_bps)?;

        let mut settlement = SettlementResult {
            session_id,
            outcome,
            payouts,
            ledger_tx_ref: None,
            status: SettlementStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
        };
        self.store.save_settlement(&settlement).await?;

        self.events.publish(SessionEvent::Ended {
            session_id,
            outcome,
        });
        tracing::info!(
            "Session {} ended as {:?}, paying out to {} wallets",
            session_id,
            outcome,
            settlement.payouts.len()
        );

        // ledger retries run without the session lock
        drop(guard);

        self.submit_with_retries(&mut settlement).await?;
        Ok(settlement)
    }

    /// Retries a settlement that is stuck in Pending or
    /// FailedNeedsReconciliation. Submitted and Confirmed settlements are
    /// returned as they are.
    pub async fn reconcile(&self, session_id: Uuid) -> Result<SettlementResult> {
        let lock = self.locks.acquire(session_id);
        let _guard = lock.lock().await;

        let mut settlement = self
            .store
            .load_settlement(session_id)
            .await?
            .ok_or(CoordinatorError::SettlementNotFound(session_id))?;

        match settlement.status {
            SettlementStatus::Submitted | SettlementStatus::Confirmed => return Ok(settlement),
            SettlementStatus::Pending | SettlementStatus::FailedNeedsReconciliation => {}
        }

        if settlement.payouts.is_empty() {
            settlement.status = SettlementStatus::Confirmed;
            self.store.save_settlement(&settlement).await?;
            return Ok(settlement);
        }

        settlement.attempts += 1;
        match self
            .gateway
            .submit_payouts(session_id, &settlement.payouts)
            .await
        {
            Ok(tx_ref) => {
                settlement.ledger_tx_ref = Some(tx_ref);
                settlement.status = SettlementStatus::Submitted;
                self.store.save_settlement(&settlement).await?;
                settlement.status = SettlementStatus::Confirmed;
                self.store.save_settlement(&settlement).await?;
                tracing::info!("Reconciled settlement for session {}", session_id);
                Ok(settlement)
            }
            Err(e) => {
                settlement.status = SettlementStatus::FailedNeedsReconciliation;
                self.store.save_settlement(&settlement).await?;
                tracing::error!(
                    "Reconciliation attempt for session {} failed: {}",
                    session_id,
                    e
                );
                Err(CoordinatorError::ReconciliationRequired(session_id))
            }
        }
    }

    pub async fn result(&self, session_id: Uuid) -> Result<SettlementResult> {
        self.store
            .load_settlement(session_id)
            .await?
            .ok_or(CoordinatorError::SettlementNotFound(session_id))
    }

    /// Places a spectator bet. Bets are open while the session is waiting
    /// for players or live, and closed during the countdown and once the
    /// outcome is known. Participants cannot bet on their own match.
    pub async fn record_bet(
        &self,
        session_id: Uuid,
        wallet: &str,
        outcome: Outcome,
        amount: u64,
    ) -> Result<BetStake> {
        if !is_valid_wallet_address(wallet) {
            return Err(CoordinatorError::invalid_address(wallet));
        }
        if outcome == Outcome::Aborted {
            return Err(CoordinatorError::validation("Cannot bet on an abort"));
        }

        let lock = self.locks.acquire(session_id);
        let _guard = lock.lock().await;

        let session = self
            .store
            .load_session(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::session_not_found(session_id.to_string()))?;

        match session.status {
            SessionStatus::Waiting | SessionStatus::Active => {}
            _ => {
                return Err(CoordinatorError::validation(
                    "Betting is closed for this session",
                ))
            }
        }
        if session.is_participant(wallet) {
            return Err(CoordinatorError::validation(
                "Participants cannot bet on their own match",
            ));
        }

        let mut pool = self
            .store
            .load_pool(session_id)
            .await?
            .unwrap_or_else(|| BettingPool::new(session_id));
        let stake = pool.place(wallet, outcome, amount)?;
        self.store.save_pool(&pool).await?;

        tracing::info!(
            "Bet of {} on {:?} recorded for session {} at odds {:.2}",
            amount,
            outcome,
            session_id,
            stake.odds_snapshot
        );
        Ok(stake)
    }

    /// Current pool for display surfaces; an untouched session shows an
    /// empty pool.
    pub async fn betting_pool(&self, session_id: Uuid) -> Result<BettingPool> {
        Ok(self
            .store
            .load_pool(session_id)
            .await?
            .unwrap_or_else(|| BettingPool::new(session_id)))
    }

    async fn submit_with_retries(&self, settlement: &mut SettlementResult) -> Result<()> {
        let session_id = settlement.session_id;

        if settlement.payouts.is_empty() {
            settlement.status = SettlementStatus::Confirmed;
            self.store
                .update_settlement_if_status(settlement, SettlementStatus::Pending)
                .await?;
            return Ok(());
        }

        let mut backoff_ms = self.config.settle_backoff_ms;
        for attempt in 1..=self.config.settle_max_attempts {
            settlement.attempts += 1;
            match self
                .gateway
                .submit_payouts(session_id, &settlement.payouts)
                .await
            {
                Ok(tx_ref) => {
                    settlement.ledger_tx_ref = Some(tx_ref.clone());
                    settlement.status = SettlementStatus::Submitted;
                    self.store
                        .update_settlement_if_status(settlement, SettlementStatus::Pending)
                        .await?;
                    settlement.status = SettlementStatus::Confirmed;
                    self.store
                        .update_settlement_if_status(settlement, SettlementStatus::Submitted)
                        .await?;
                    tracing::info!(
                        "Payouts for session {} submitted to the ledger ({})",
                        session_id,
                        tx_ref
                    );
                    return Ok(());
                }
                Err(e) => {
                    // attempt counts must not overwrite a result a
                    // concurrent reconcile has already advanced
                    self.store
                        .update_settlement_if_status(settlement, SettlementStatus::Pending)
                        .await?;
                    tracing::warn!(
                        "Payout submission attempt {}/{} failed for session {}: {}",
                        attempt,
                        self.config.settle_max_attempts,
                        session_id,
                        e
                    );
                    if attempt < self.config.settle_max_attempts {
                        tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2);
                    }
                }
            }
        }

        settlement.status = SettlementStatus::FailedNeedsReconciliation;
        self.store
            .update_settlement_if_status(settlement, SettlementStatus::Pending)
            .await?;
        tracing::error!(
            "Settlement for session {} needs reconciliation after {} attempts",
            session_id,
            settlement.attempts
        );
        Err(CoordinatorError::ReconciliationRequired(session_id))
    }
}

/// Payout schedule for a finished session.
///
/// A decisive outcome pays the whole escrow minus the platform fee to the
/// winner and splits the betting pool pro rata across the winning stakes,
/// each share minus the fee. A pool with no winning stake stays with the
/// platform. Draws and aborts return every deposit and every stake in full.
pub fn compute_payouts(
    session: &Session,
    pool: &BettingPool,
    outcome: Outcome,
    fee_bps: u64,
) -> Result<HashMap<String, u64>> {
    let mut payouts = HashMap::new();

    match outcome.winner_index() {
        Some(winner_index) => {
            let winner = session
                .participants
                .get(winner_index)
                .ok_or_else(|| CoordinatorError::internal("Winner index out of range"))?;
            credit(&mut payouts, winner, after_fee(session.escrow_confirmed, fee_bps)?)?;

            let winning_total = pool.outcome_total(outcome);
            if winning_total == 0 {
                if pool.total_pool > 0 {
                    tracing::info!(
                        "No winning bets on session {}, pool of {} stays with the platform",
                        session.id,
                        pool.total_pool
                    );
                }
            } else {
                for bet in pool.bets.iter().filter(|b| b.outcome == outcome) {
                    let share = mul_div(bet.amount, pool.total_pool, winning_total)?;
                    credit(&mut payouts, &bet.wallet, after_fee(share, fee_bps)?)?;
                }
            }
        }
        None => {
            for (wallet, amount) in &session.deposits {
                credit(&mut payouts, wallet, *amount)?;
            }
            for bet in &pool.bets {
                credit(&mut payouts, &bet.wallet, bet.amount)?;
            }
        }
    }

    Ok(payouts)
}

fn after_fee(amount: u64, fee_bps: u64) -> Result<u64> {
    let fee = mul_div(amount, fee_bps, 10_000)?;
    Ok(amount - fee)
}

fn mul_div(amount: u64, numerator: u64, denominator: u64) -> Result<u64> {
    let wide = (amount as u128) * (numerator as u128) / (denominator as u128);
    u64::try_from(wide).map_err(|_| CoordinatorError::internal("Payout arithmetic overflow"))
}

fn credit(payouts: &mut HashMap<String, u64>, wallet: &str, amount: u64) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    let entry = payouts.entry(wallet.to_string()).or_insert(0);
    *entry = entry
        .checked_add(amount)
        .ok_or_else(|| CoordinatorError::internal("Payout arithmetic overflow"))?;
    Ok(())
}
