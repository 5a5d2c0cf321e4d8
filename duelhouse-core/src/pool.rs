use crate::error::{CoordinatorError, Result};
use crate::types::Outcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One placed bet, with the implied odds at placement time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetStake {
    pub wallet: String,
    pub outcome: Outcome,
    pub amount: u64,
    pub odds_snapshot: f64,
    pub placed_at: DateTime<Utc>,
}

/// Spectator betting pool for one session. The betting surface writes it,
/// settlement freezes and reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BettingPool {
    pub session_id: Uuid,
    pub total_pool: u64,
    pub per_outcome: HashMap<Outcome, u64>,
    pub bets: Vec<BetStake>,
    pub frozen: bool,
}

impl BettingPool {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            total_pool: 0,
            per_outcome: HashMap::new(),
            bets: Vec::new(),
            frozen: false,
        }
    }

    /// Adds a stake and returns it with its odds snapshot. Implied odds are
    /// the ratio of the whole pool to the chosen outcome's pool, both
    /// including this stake.
    pub fn place(&mut self, wallet: &str, outcome: Outcome, amount: u64) -> Result<BetStake> {
        if self.frozen {
            return Err(CoordinatorError::PoolFrozen);
        }
        if amount == 0 {
            return Err(CoordinatorError::validation("Bet amount must be positive"));
        }

        self.total_pool = self
            .total_pool
            .checked_add(amount)
            .ok_or_else(|| CoordinatorError::validation("Pool total overflow"))?;

        let outcome_total = self.per_outcome.entry(outcome).or_insert(0);
        *outcome_total += amount;

        let stake = BetStake {
            wallet: wallet.to_string(),
            outcome,
            amount,
            odds_snapshot: self.total_pool as f64 / *outcome_total as f64,
            placed_at: Utc::now(),
        };
        self.bets.push(stake.clone());

        Ok(stake)
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn bets_count(&self) -> usize {
        self.bets.len()
    }

    pub fn outcome_total(&self, outcome: Outcome) -> u64 {
        self.per_outcome.get(&outcome).copied().unwrap_or(0)
    }
}
