use crate::error::{CoordinatorError, Result};
use crate::types::MAX_MOVE_TIME_LIMIT_SECS;
use serde::{Deserialize, Serialize};

/// Ceiling for the timing knobs that feed date arithmetic.
const MAX_TIMER_SECS: u64 = 31_536_000;

/// Timing and policy knobs for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// How long a Waiting session stays joinable before it expires.
    pub session_ttl_secs: u64,
    /// Length of the pre-game countdown once the second player is funded.
    pub countdown_secs: u64,
    /// Window after a move during which its author may undo it.
    pub undo_window_secs: u64,
    /// Total budget for polling a deposit confirmation on the ledger.
    pub confirm_timeout_ms: u64,
    /// Delay between consecutive confirmation polls.
    pub confirm_poll_interval_ms: u64,
    /// Maximum age of an anti-fraud token before it counts as stale.
    pub token_max_age_secs: i64,
    pub settle_max_attempts: u32,
    pub settle_backoff_ms: u64,
    pub rollup_max_attempts: u32,
    pub rollup_backoff_ms: u64,
    /// Platform fee in basis points, taken from winner payouts.
    pub platform_fee_bps: u64,
    /// Fallback per-move time limit when session settings leave it unset.
    pub default_move_time_limit_secs: Option<u64>,
    pub ledger_url: String,
    pub rollup_url: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 86_400, // 24 hours
            countdown_secs: 10,
            undo_window_secs: 10,
            confirm_timeout_ms: 2_000,
            confirm_poll_interval_ms: 250,
            token_max_age_secs: 30,
            settle_max_attempts: 5,
            settle_backoff_ms: 500,
            rollup_max_attempts: 5,
            rollup_backoff_ms: 500,
            platform_fee_bps: 250, // 2.5%
            default_move_time_limit_secs: None,
            ledger_url: "http://localhost:8545".to_string(),
            rollup_url: "http://localhost:7070".to_string(),
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.session_ttl_secs == 0 {
            return Err(CoordinatorError::validation(
                "Session TTL must be greater than 0",
            ));
        }

        if self.session_ttl_secs > MAX_TIMER_SECS
            || self.countdown_secs > MAX_TIMER_SECS
            || self.undo_window_secs > MAX_TIMER_SECS
        {
            return Err(CoordinatorError::validation(
                "Timing knobs cannot exceed one year",
            ));
        }

        if self.confirm_poll_interval_ms == 0 {
            return Err(CoordinatorError::validation(
                "Confirmation poll interval must be greater than 0",
            ));
        }

        if self.confirm_poll_interval_ms > self.confirm_timeout_ms {
            return Err(CoordinatorError::validation(
                "Confirmation poll interval cannot exceed the poll budget",
            ));
        }

        if self.platform_fee_bps > 10_000 {
            return Err(CoordinatorError::validation(
                "Platform fee cannot exceed 10000 basis points",
            ));
        }

        if self.settle_max_attempts == 0 {
            return Err(CoordinatorError::validation(
                "Settlement needs at least one attempt",
            ));
        }

        if let Some(limit) = self.default_move_time_limit_secs {
            if limit == 0 || limit > MAX_MOVE_TIME_LIMIT_SECS {
                return Err(CoordinatorError::validation(
                    "Default move time limit must be between 1 second and 24 hours",
                ));
            }
        }

        if self.ledger_url.is_empty() {
            return Err(CoordinatorError::validation("Ledger URL cannot be empty"));
        }

        if self.rollup_url.is_empty() {
            return Err(CoordinatorError::validation("Rollup URL cannot be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_excessive_fee() {
        let config = CoordinatorConfig {
            platform_fee_bps: 10_001,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_poll_interval_over_budget() {
        let config = CoordinatorConfig {
            confirm_timeout_ms: 100,
            confirm_poll_interval_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_out_of_range_default_move_clock() {
        let config = CoordinatorConfig {
            default_move_time_limit_secs: Some(u64::MAX),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CoordinatorConfig {
            default_move_time_limit_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_oversized_timers() {
        let config = CoordinatorConfig {
            undo_window_secs: u64::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
