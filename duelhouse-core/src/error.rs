use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Broad failure class, used by callers that map errors to a transport
/// surface (HTTP layer, CLI exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    StateConflict,
    ExternalDependency,
    ReconciliationRequired,
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid wallet address: {0}")]
    InvalidAddress(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Join intent not found for wallet {0}")]
    IntentNotFound(String),

    #[error("Settlement not found for session {0}")]
    SettlementNotFound(Uuid),

    #[error("Session is full")]
    SessionFull,

    #[error("Wallet already joined: {0}")]
    AlreadyJoined(String),

    #[error("Wallet not on the allow list: {0}")]
    NotWhitelisted(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Undo window expired")]
    WindowExpired,

    #[error("No move to undo")]
    NoMoveToUndo,

    #[error("Only the author of the last move can undo it")]
    NotAuthor,

    #[error("Betting pool is frozen")]
    PoolFrozen,

    #[error("Transaction not found on ledger: {0}")]
    TransactionNotFound(String),

    #[error("Deposit amount mismatch: need {need}, confirmed {confirmed}")]
    AmountMismatch { need: u64, confirmed: u64 },

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Rollup error: {0}")]
    Rollup(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Settlement requires reconciliation for session {0}")]
    ReconciliationRequired(Uuid),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_address(msg: impl Into<String>) -> Self {
        Self::InvalidAddress(msg.into())
    }

    pub fn session_not_found(id: impl Into<String>) -> Self {
        Self::SessionNotFound(id.into())
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    pub fn rollup(msg: impl Into<String>) -> Self {
        Self::Rollup(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::InvalidAddress(_) => ErrorKind::Validation,
            Self::SessionNotFound(_)
            | Self::IntentNotFound(_)
            | Self::SettlementNotFound(_) => ErrorKind::NotFound,
            Self::SessionFull
            | Self::AlreadyJoined(_)
            | Self::NotWhitelisted(_)
            | Self::InvalidTransition { .. }
            | Self::WindowExpired
            | Self::NoMoveToUndo
            | Self::NotAuthor
            | Self::PoolFrozen
            | Self::TransactionNotFound(_)
            | Self::AmountMismatch { .. } => ErrorKind::StateConflict,
            Self::Ledger(_) | Self::Rollup(_) | Self::Timeout(_) => {
                ErrorKind::ExternalDependency
            }
            Self::ReconciliationRequired(_) => ErrorKind::ReconciliationRequired,
            Self::Storage(_) | Self::Serialization(_) | Self::Io(_) | Self::Internal(_) => {
                ErrorKind::Infrastructure
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            CoordinatorError::validation("bad settings").kind(),
            ErrorKind::Validation
        );
        assert_eq!(CoordinatorError::SessionFull.kind(), ErrorKind::StateConflict);
        assert_eq!(
            CoordinatorError::ledger("connection refused").kind(),
            ErrorKind::ExternalDependency
        );
        assert_eq!(
            CoordinatorError::ReconciliationRequired(Uuid::new_v4()).kind(),
            ErrorKind::ReconciliationRequired
        );
    }

    #[test]
    fn test_error_display() {
        let err = CoordinatorError::AmountMismatch {
            need: 100_000,
            confirmed: 50_000,
        };
        assert_eq!(
            err.to_string(),
            "Deposit amount mismatch: need 100000, confirmed 50000"
        );
    }
}
