use crate::error::{CoordinatorError, Result};
use crate::pool::BettingPool;
use crate::storage::CoordinatorStore;
use crate::types::{
    MoveRecord, RefundTicket, Session, SessionStatus, SettlementResult, SettlementStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Sqlite-backed store. Records are serialized to JSON in a `data` column;
/// the columns next to it exist for lookups and status-guarded updates.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CoordinatorError::internal(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };

        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                code TEXT UNIQUE NOT NULL,
                status TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS moves (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (session_id, seq)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS settlements (
                session_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS pools (
                session_id TEXT PRIMARY KEY,
                data TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS refunds (
                session_id TEXT NOT NULL,
                wallet TEXT NOT NULL,
                status TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (session_id, wallet)
            )",
            [],
        )?;

        Ok(())
    }
}

#[async_trait]
impl CoordinatorStore for SqliteStore {
    async fn save_session(&self, session: &Session) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT OR REPLACE INTO sessions (id, code, status, expires_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                session.id.to_string(),
                session.code,
                session.status.as_str(),
                session.expires_at.timestamp(),
                serde_json::to_string(session)?,
            ],
        )?;

        Ok(())
    }

    async fn load_session(&self, session_id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM sessions WHERE id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn load_session_by_code(&self, code: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM sessions WHERE code = ?1",
                params![code],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update_session_if_status(
        &self,
        session: &Session,
        expected: SessionStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;

        let changed = conn.execute(
            "UPDATE sessions SET status = ?1, expires_at = ?2, data = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                session.status.as_str(),
                session.expires_at.timestamp(),
                serde_json::to_string(session)?,
                session.id.to_string(),
                expected.as_str(),
            ],
        )?;

        Ok(changed > 0)
    }

    async fn list_expired_waiting(&self, now: DateTime<Utc>) -> Result<Vec<Session>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(
            "SELECT data FROM sessions WHERE status = 'waiting' AND expires_at <= ?1",
        )?;
        let rows = stmt.query_map(params![now.timestamp()], |row| row.get::<_, String>(0))?;

        let mut sessions = Vec::new();
        for raw in rows {
            sessions.push(serde_json::from_str(&raw?)?);
        }

        Ok(sessions)
    }

    async fn append_move(&self, record: &MoveRecord) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO moves (session_id, seq, data) VALUES (?1, ?2, ?3)",
            params![
                record.session_id.to_string(),
                record.seq as i64,
                serde_json::to_string(record)?,
            ],
        )?;

        Ok(())
    }

    async fn load_moves(&self, session_id: Uuid) -> Result<Vec<MoveRecord>> {
        let conn = self.conn.lock().await;

        let mut stmt =
            conn.prepare("SELECT data FROM moves WHERE session_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut moves = Vec::new();
        for raw in rows {
            moves.push(serde_json::from_str(&raw?)?);
        }

        Ok(moves)
    }

    async fn last_move(&self, session_id: Uuid) -> Result<Option<MoveRecord>> {
        let conn = self.conn.lock().await;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM moves WHERE session_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn next_move_seq(&self, session_id: Uuid) -> Result<u64> {
        let conn = self.conn.lock().await;

        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM moves WHERE session_id = ?1",
            params![session_id.to_string()],
            |row| row.get(0),
        )?;

        Ok(max as u64 + 1)
    }

    async fn save_settlement(&self, result: &SettlementResult) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT OR REPLACE INTO settlements (session_id, status, data)
             VALUES (?1, ?2, ?3)",
            params![
                result.session_id.to_string(),
                result.status.as_str(),
                serde_json::to_string(result)?,
            ],
        )?;

        Ok(())
    }

    async fn load_settlement(&self, session_id: Uuid) -> Result<Option<SettlementResult>> {
        let conn = self.conn.lock().await;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM settlements WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update_settlement_if_status(
        &self,
        result: &SettlementResult,
        expected: SettlementStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().await;

        let changed = conn.execute(
            "UPDATE settlements SET status = ?1, data = ?2
             WHERE session_id = ?3 AND status = ?4",
            params![
                result.status.as_str(),
                serde_json::to_string(result)?,
                result.session_id.to_string(),
                expected.as_str(),
            ],
        )?;

        Ok(changed > 0)
    }

    async fn save_pool(&self, pool: &BettingPool) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT OR REPLACE INTO pools (session_id, data) VALUES (?1, ?2)",
            params![pool.session_id.to_string(), serde_json::to_string(pool)?],
        )?;

        Ok(())
    }

    async fn load_pool(&self, session_id: Uuid) -> Result<Option<BettingPool>> {
        let conn = self.conn.lock().await;

        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM pools WHERE session_id = ?1",
                params![session_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;

        match data {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn save_refund(&self, ticket: &RefundTicket) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT OR REPLACE INTO refunds (session_id, wallet, status, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                ticket.session_id.to_string(),
                ticket.wallet,
                ticket.status.as_str(),
                serde_json::to_string(ticket)?,
            ],
        )?;

        Ok(())
    }

    async fn list_queued_refunds(&self) -> Result<Vec<RefundTicket>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare("SELECT data FROM refunds WHERE status = 'queued'")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut tickets = Vec::new();
        for raw in rows {
            tickets.push(serde_json::from_str(&raw?)?);
        }

        Ok(tickets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        Coord, EntryRequirements, MoveKind, Outcome, PieceKind, RefundStatus, SessionSettings,
    };
    use std::collections::HashMap;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> SqliteStore {
        SqliteStore::new(&dir.path().join("duelhouse.db"))
            .await
            .unwrap()
    }

    fn sample_session(code: &str) -> Session {
        Session {
            id: Uuid::new_v4(),
            code: code.to_string(),
            status: SessionStatus::Waiting,
            settings: SessionSettings::default(),
            entry: EntryRequirements {
                entry_fee: 100_000,
                ..Default::default()
            },
            participants: Vec::new(),
            escrow_address: "e".repeat(64),
            escrow_confirmed: 0,
            deposits: HashMap::new(),
            funding_txs: HashMap::new(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(24),
            countdown_ends_at: None,
            activated_at: None,
            rollup_started: false,
        }
    }

    fn sample_move(session_id: Uuid, seq: u64) -> MoveRecord {
        MoveRecord {
            session_id,
            seq,
            author: "a".repeat(64),
            from_coord: Coord::new(1, 0),
            to_coord: Coord::new(1, 1),
            piece: PieceKind::Scout,
            anti_fraud_token: "token".to_string(),
            hash: format!("hash_{}", seq),
            applied_at: Utc::now(),
            latency_ms: 3,
            kind: MoveKind::Applied,
        }
    }

    #[tokio::test]
    async fn test_session_round_trip_and_code_lookup() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let session = sample_session("AB12CD");
        store.save_session(&session).await.unwrap();

        let by_id = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(by_id.code, "AB12CD");
        assert_eq!(by_id.entry.entry_fee, 100_000);

        let by_code = store.load_session_by_code("AB12CD").await.unwrap().unwrap();
        assert_eq!(by_code.id, session.id);

        assert!(store.load_session(Uuid::new_v4()).await.unwrap().is_none());
        assert!(store
            .load_session_by_code("ZZZZZZ")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_status_guarded_update() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut session = sample_session("GUARD1");
        store.save_session(&session).await.unwrap();

        session.status = SessionStatus::Countdown;
        assert!(store
            .update_session_if_status(&session, SessionStatus::Waiting)
            .await
            .unwrap());

        // a second writer still expecting Waiting loses the race
        let mut stale = session.clone();
        stale.status = SessionStatus::Expired;
        assert!(!store
            .update_session_if_status(&stale, SessionStatus::Waiting)
            .await
            .unwrap());

        let stored = store.load_session(session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Countdown);
    }

    #[tokio::test]
    async fn test_move_log_is_append_only_and_gapless() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let session_id = Uuid::new_v4();

        assert_eq!(store.next_move_seq(session_id).await.unwrap(), 1);

        for seq in 1..=3 {
            store.append_move(&sample_move(session_id, seq)).await.unwrap();
        }

        assert_eq!(store.next_move_seq(session_id).await.unwrap(), 4);
        let moves = store.load_moves(session_id).await.unwrap();
        assert_eq!(
            moves.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(store.last_move(session_id).await.unwrap().unwrap().seq, 3);

        // reusing a sequence number must fail loudly
        assert!(store.append_move(&sample_move(session_id, 2)).await.is_err());
    }

    #[tokio::test]
    async fn test_settlement_confirmed_is_immutable() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let session_id = Uuid::new_v4();

        let mut result = SettlementResult {
            session_id,
            outcome: Outcome::Player1Win,
            payouts: HashMap::from([("w".repeat(64), 195_000u64)]),
            ledger_tx_ref: None,
            status: SettlementStatus::Pending,
            attempts: 1,
            created_at: Utc::now(),
        };
        store.save_settlement(&result).await.unwrap();

        result.status = SettlementStatus::Confirmed;
        result.ledger_tx_ref = Some("settle_tx".to_string());
        assert!(store
            .update_settlement_if_status(&result, SettlementStatus::Pending)
            .await
            .unwrap());

        // nothing still expecting Pending can touch it now
        let mut rogue = result.clone();
        rogue.status = SettlementStatus::FailedNeedsReconciliation;
        assert!(!store
            .update_settlement_if_status(&rogue, SettlementStatus::Pending)
            .await
            .unwrap());

        let stored = store.load_settlement(session_id).await.unwrap().unwrap();
        assert_eq!(stored.status, SettlementStatus::Confirmed);
        assert_eq!(stored.ledger_tx_ref.as_deref(), Some("settle_tx"));
    }

    #[tokio::test]
    async fn test_pool_round_trip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut pool = BettingPool::new(Uuid::new_v4());
        pool.place(&"b".repeat(64), Outcome::Player2Win, 500).unwrap();
        store.save_pool(&pool).await.unwrap();

        let loaded = store.load_pool(pool.session_id).await.unwrap().unwrap();
        assert_eq!(loaded.total_pool, 500);
        assert_eq!(loaded.bets_count(), 1);
    }

    #[tokio::test]
    async fn test_refund_queue_lifecycle() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let session_id = Uuid::new_v4();

        let mut ticket = RefundTicket {
            session_id,
            wallet: "w".repeat(64),
            amount: 100_000,
            status: RefundStatus::Queued,
            attempts: 0,
            queued_at: Utc::now(),
        };
        store.save_refund(&ticket).await.unwrap();
        assert_eq!(store.list_queued_refunds().await.unwrap().len(), 1);

        ticket.status = RefundStatus::Done;
        ticket.attempts = 1;
        store.save_refund(&ticket).await.unwrap();
        assert!(store.list_queued_refunds().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_waiting_listing() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        let mut expired = sample_session("OLD111");
        expired.expires_at = Utc::now() - chrono::Duration::minutes(5);
        store.save_session(&expired).await.unwrap();

        let fresh = sample_session("NEW222");
        store.save_session(&fresh).await.unwrap();

        let mut active = sample_session("ACT333");
        active.status = SessionStatus::Active;
        active.expires_at = Utc::now() - chrono::Duration::minutes(5);
        store.save_session(&active).await.unwrap();

        let listed = store.list_expired_waiting(Utc::now()).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, expired.id);
    }
}
