use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Hard cap on participants per session.
pub const MAX_PLAYERS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Created,
    Waiting,
    Countdown,
    Active,
    Completed,
    Expired,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Waiting => "waiting",
            Self::Countdown => "countdown",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }

    /// Allowed forward transitions. Terminal statuses never transition again.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Created, Waiting)
                | (Waiting, Countdown)
                | (Waiting, Expired)
                | (Waiting, Aborted)
                | (Countdown, Active)
                | (Countdown, Aborted)
                | (Active, Completed)
                | (Active, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Aborted)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of a match from the coordinator's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    Player1Win,
    Player2Win,
    Draw,
    Aborted,
}

impl Outcome {
    /// Participant index of the winner, when there is one.
    pub fn winner_index(&self) -> Option<usize> {
        match self {
            Self::Player1Win => Some(0),
            Self::Player2Win => Some(1),
            Self::Draw | Self::Aborted => None,
        }
    }

    pub fn for_winner_index(index: usize) -> Self {
        if index == 0 {
            Self::Player1Win
        } else {
            Self::Player2Win
        }
    }
}

/// Upper bound for per-move clocks, and the ceiling that keeps move
/// deadline arithmetic in range.
pub const MAX_MOVE_TIME_LIMIT_SECS: u64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Per-move clock; forfeits the on-turn player once exceeded.
    pub move_time_limit_secs: Option<u64>,
    pub variant: String,
    pub allow_spectators: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            move_time_limit_secs: None,
            variant: "skirmish".to_string(),
            allow_spectators: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntryRequirements {
    pub min_rating: Option<u32>,
    /// Escrow deposit each participant must fund, in base ledger units.
    pub entry_fee: u64,
    /// When set, only these wallet addresses may join.
    pub allow_list: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Short shareable join code.
    pub code: String,
    pub status: SessionStatus,
    pub settings: SessionSettings,
    pub entry: EntryRequirements,
    /// Wallet addresses in join order; index 0 is player 1.
    pub participants: Vec<String>,
    pub escrow_address: String,
    /// Sum of confirmed escrow deposits.
    pub escrow_confirmed: u64,
    /// Confirmed deposit amount per wallet.
    pub deposits: HashMap<String, u64>,
    /// Confirmed funding transaction per wallet.
    pub funding_txs: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub countdown_ends_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub rollup_started: bool,
}

impl Session {
    pub fn is_participant(&self, wallet: &str) -> bool {
        self.participants.iter().any(|p| p == wallet)
    }

    pub fn participant_index(&self, wallet: &str) -> Option<usize> {
        self.participants.iter().position(|p| p == wallet)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= MAX_PLAYERS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntentStatus {
    Built,
    Submitted,
    Confirmed,
    Rejected,
}

/// Ephemeral record of a join attempt, alive between build and confirm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinIntent {
    pub session_id: Uuid,
    pub wallet: String,
    pub unsigned_tx_ref: String,
    pub expected_amount: u64,
    pub status: IntentStatus,
    pub built_at: DateTime<Utc>,
}

/// What a joining client needs to sign and broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinTicket {
    pub session_id: Uuid,
    pub wallet: String,
    pub unsigned_tx_ref: String,
    pub expected_amount: u64,
    pub escrow_address: String,
}

/// Ledger view of a single transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfirmation {
    pub exists: bool,
    pub finalized: bool,
    pub amount: u64,
    pub sender: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PieceKind {
    Scout,
    Keep,
    Crown,
}

impl PieceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Keep => "keep",
            Self::Crown => "crown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i16,
    pub y: i16,
}

impl Coord {
    pub fn new(x: i16, y: i16) -> Self {
        Self { x, y }
    }
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRequest {
    pub from: Coord,
    pub to: Coord,
    pub piece: PieceKind,
}

/// Result surface for move submission and undo. User-causable rejections
/// come back as `success == false` with a reason, never as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveOutcome {
    pub success: bool,
    pub reason: Option<String>,
    pub hash: String,
    pub seq: u64,
    pub version: u64,
}

impl MoveOutcome {
    pub fn rejected(reason: impl Into<String>, version: u64) -> Self {
        Self {
            success: false,
            reason: Some(reason.into()),
            hash: String::new(),
            seq: 0,
            version,
        }
    }

    pub fn applied(hash: String, seq: u64, version: u64) -> Self {
        Self {
            success: true,
            reason: None,
            hash,
            seq,
            version,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoveKind {
    Applied,
    /// Compensating record appended by an undo; history is never rewritten.
    Undone { of_seq: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoveRecord {
    pub session_id: Uuid,
    /// Strictly increasing per session, no gaps, never reused.
    pub seq: u64,
    pub author: String,
    pub from_coord: Coord,
    pub to_coord: Coord,
    pub piece: PieceKind,
    pub anti_fraud_token: String,
    pub hash: String,
    pub applied_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub kind: MoveKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    Pending,
    Submitted,
    Confirmed,
    FailedNeedsReconciliation,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
            Self::FailedNeedsReconciliation => "failed_needs_reconciliation",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementResult {
    pub session_id: Uuid,
    pub outcome: Outcome,
    /// Wallet address to amount owed, escrow pot and betting pool combined.
    pub payouts: HashMap<String, u64>,
    pub ledger_tx_ref: Option<String>,
    pub status: SettlementStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundStatus {
    Queued,
    Done,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Done => "done",
        }
    }
}

/// Durable marker for a deposit that must go back to its wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundTicket {
    pub session_id: Uuid,
    pub wallet: String,
    pub amount: u64,
    pub status: RefundStatus,
    pub attempts: u32,
    pub queued_at: DateTime<Utc>,
}

/// Countdown info for display surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountdownStatus {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub countdown_ends_at: Option<DateTime<Utc>>,
    pub remaining_ms: i64,
    pub rollup_started: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use SessionStatus::*;

        assert!(Created.can_transition_to(Waiting));
        assert!(Waiting.can_transition_to(Countdown));
        assert!(Waiting.can_transition_to(Expired));
        assert!(Countdown.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Active.can_transition_to(Aborted));

        // no skipping and no going back
        assert!(!Created.can_transition_to(Active));
        assert!(!Countdown.can_transition_to(Waiting));
        assert!(!Active.can_transition_to(Expired));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Expired.can_transition_to(Waiting));
    }

    #[test]
    fn test_outcome_winner_index() {
        assert_eq!(Outcome::Player1Win.winner_index(), Some(0));
        assert_eq!(Outcome::Player2Win.winner_index(), Some(1));
        assert_eq!(Outcome::Draw.winner_index(), None);
        assert_eq!(Outcome::for_winner_index(1), Outcome::Player2Win);
    }

    #[test]
    fn test_session_participant_helpers() {
        let session = Session {
            id: Uuid::new_v4(),
            code: "ABC123".to_string(),
            status: SessionStatus::Waiting,
            settings: SessionSettings::default(),
            entry: EntryRequirements::default(),
            participants: vec!["a".repeat(64), "b".repeat(64)],
            escrow_address: "0".repeat(64),
            escrow_confirmed: 0,
            deposits: HashMap::new(),
            funding_txs: HashMap::new(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            countdown_ends_at: None,
            activated_at: None,
            rollup_started: false,
        };

        assert!(session.is_full());
        assert_eq!(session.participant_index(&"b".repeat(64)), Some(1));
        assert_eq!(session.participant_index("missing"), None);
    }
}
