use crate::error::{CoordinatorError, Result};
use crate::types::{Coord, MoveRequest, PieceKind, MAX_PLAYERS};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Boards are square, BOARD_SIZE x BOARD_SIZE, origin at (0,0).
pub const BOARD_SIZE: i16 = 5;

/// One piece on the board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: u32,
    pub agent: usize,
    pub piece: PieceKind,
    pub pos: Coord,
}

/// Serializable export of a world. Importing it and exporting again yields
/// the identical version and components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub session_id: Uuid,
    pub version: u64,
    pub current_turn: usize,
    pub last_move_hash: String,
    pub entities: Vec<Entity>,
}

/// State of the board just before the last applied move, kept so that a
/// single undo can restore it exactly.
#[derive(Debug, Clone)]
struct PriorFrame {
    version: u64,
    current_turn: usize,
    last_move_hash: String,
    entities: Vec<Entity>,
}

/// What an applied move did to the world.
#[derive(Debug, Clone)]
pub struct AppliedMove {
    pub hash: String,
    pub version: u64,
    pub captured: Option<u32>,
}

/// Authoritative per-session game state. Only the move coordinator mutates
/// it, and only while holding the session's lock.
#[derive(Debug, Clone)]
pub struct WorldState {
    session_id: Uuid,
    version: u64,
    current_turn: usize,
    last_move_hash: String,
    entities: Vec<Entity>,
    prior: Option<PriorFrame>,
}

impl WorldState {
    /// Starting position: each side fields a crown flanked by two scouts on
    /// its back rank and a keep in front of the crown, mirrored across the
    /// board. Player 1 (agent 0) moves first.
    pub fn initial(session_id: Uuid) -> Self {
        let entities = vec![
            Entity {
                id: 1,
                agent: 0,
                piece: PieceKind::Scout,
                pos: Coord::new(1, 0),
            },
            Entity {
                id: 2,
                agent: 0,
                piece: PieceKind::Crown,
                pos: Coord::new(2, 0),
            },
            Entity {
                id: 3,
                agent: 0,
                piece: PieceKind::Scout,
                pos: Coord::new(3, 0),
            },
            Entity {
                id: 4,
                agent: 0,
                piece: PieceKind::Keep,
                pos: Coord::new(2, 1),
            },
            Entity {
                id: 5,
                agent: 1,
                piece: PieceKind::Scout,
                pos: Coord::new(1, BOARD_SIZE - 1),
            },
            Entity {
                id: 6,
                agent: 1,
                piece: PieceKind::Crown,
                pos: Coord::new(2, BOARD_SIZE - 1),
            },
            Entity {
                id: 7,
                agent: 1,
                piece: PieceKind::Scout,
                pos: Coord::new(3, BOARD_SIZE - 1),
            },
            Entity {
                id: 8,
                agent: 1,
                piece: PieceKind::Keep,
                pos: Coord::new(2, BOARD_SIZE - 2),
            },
        ];

        Self {
            session_id,
            version: 0,
            current_turn: 0,
            last_move_hash: genesis_hash(session_id),
            entities,
            prior: None,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current_turn(&self) -> usize {
        self.current_turn
    }

    pub fn last_move_hash(&self) -> &str {
        &self.last_move_hash
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity_at(&self, pos: Coord) -> Option<&Entity> {
        self.entities.iter().find(|e| e.pos == pos)
    }

    pub fn crown_alive(&self, agent: usize) -> bool {
        self.entities
            .iter()
            .any(|e| e.agent == agent && e.piece == PieceKind::Crown)
    }

    /// Applies an already-validated move: bumps the version, flips the
    /// turn, removes a captured piece and extends the hash chain.
    pub fn apply_move(&mut self, agent: usize, mv: &MoveRequest) -> Result<AppliedMove> {
        let prior = PriorFrame {
            version: self.version,
            current_turn: self.current_turn,
            last_move_hash: self.last_move_hash.clone(),
            entities: self.entities.clone(),
        };

        let captured = self
            .entity_at(mv.to)
            .filter(|e| e.agent != agent)
            .map(|e| e.id);

        let mover_id = self
            .entity_at(mv.from)
            .filter(|e| e.agent == agent && e.piece == mv.piece)
            .map(|e| e.id)
            .ok_or_else(|| {
                CoordinatorError::internal(format!(
                    "No {} for agent {} at {}",
                    mv.piece.as_str(),
                    agent,
                    mv.from
                ))
            })?;

        if let Some(captured_id) = captured {
            self.entities.retain(|e| e.id != captured_id);
        }
        for entity in &mut self.entities {
            if entity.id == mover_id {
                entity.pos = mv.to;
            }
        }

        self.version += 1;
        self.current_turn = (self.current_turn + 1) % MAX_PLAYERS;
        self.last_move_hash = chain_hash(&prior.last_move_hash, agent, mv, self.version);
        self.prior = Some(prior);

        Ok(AppliedMove {
            hash: self.last_move_hash.clone(),
            version: self.version,
            captured,
        })
    }

    pub fn can_revert(&self) -> bool {
        self.prior.is_some()
    }

    /// Restores the state before the last applied move and returns the
    /// restored version. Only one step back is kept.
    pub fn revert_last(&mut self) -> Result<u64> {
        let prior = self.prior.take().ok_or(CoordinatorError::NoMoveToUndo)?;

        self.version = prior.version;
        self.current_turn = prior.current_turn;
        self.last_move_hash = prior.last_move_hash;
        self.entities = prior.entities;

        Ok(self.version)
    }

    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            session_id: self.session_id,
            version: self.version,
            current_turn: self.current_turn,
            last_move_hash: self.last_move_hash.clone(),
            entities: self.entities.clone(),
        }
    }

    pub fn from_snapshot(snapshot: WorldSnapshot) -> Self {
        let mut entities = snapshot.entities;
        entities.sort_by_key(|e| e.id);

        Self {
            session_id: snapshot.session_id,
            version: snapshot.version,
            current_turn: snapshot.current_turn,
            last_move_hash: snapshot.last_move_hash,
            entities,
            prior: None,
        }
    }
}

fn genesis_hash(session_id: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"duelhouse/genesis");
    hasher.update(session_id.as_bytes());
    hex::encode(hasher.finalize())
}

fn chain_hash(prev: &str, agent: usize, mv: &MoveRequest, version: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update([agent as u8]);
    hasher.update(mv.from.x.to_le_bytes());
    hasher.update(mv.from.y.to_le_bytes());
    hasher.update(mv.to.x.to_le_bytes());
    hasher.update(mv.to.y.to_le_bytes());
    hasher.update(mv.piece.as_str().as_bytes());
    hasher.update(version.to_le_bytes());
    hex::encode(hasher.finalize())
}
