use crate::types::{Coord, MoveRequest, PieceKind};
use crate::world::{WorldState, BOARD_SIZE};

/// Terminal check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terminal {
    pub terminal: bool,
    pub winner: Option<usize>,
    pub draw: bool,
}

impl Terminal {
    pub fn ongoing() -> Self {
        Self {
            terminal: false,
            winner: None,
            draw: false,
        }
    }

    pub fn won_by(agent: usize) -> Self {
        Self {
            terminal: true,
            winner: Some(agent),
            draw: false,
        }
    }

    pub fn drawn() -> Self {
        Self {
            terminal: true,
            winner: None,
            draw: true,
        }
    }
}

/// Move-legality engine. The production engine lives in its own service;
/// the coordinator only depends on this seam.
pub trait RulesValidator: Send + Sync {
    /// Ok when the move is legal, Err carries the rejection reason.
    fn is_legal_move(
        &self,
        world: &WorldState,
        agent: usize,
        mv: &MoveRequest,
    ) -> std::result::Result<(), String>;

    fn enumerate_legal_moves(
        &self,
        world: &WorldState,
        agent: usize,
        from: Option<Coord>,
        piece: Option<PieceKind>,
    ) -> Vec<MoveRequest>;

    fn is_terminal(&self, world: &WorldState) -> Terminal;
}

/// Reference ruleset: capture the enemy crown on a 5x5 board. Scouts and
/// crowns step one square in any direction, keeps step orthogonally. A
/// player with no legal move on their turn draws the game.
pub struct SkirmishRules;

const ORTHOGONAL: [(i16, i16); 4] = [(1, 0), (-1, 0), (0, 1), (0, -1)];
const ALL_DIRECTIONS: [(i16, i16); 8] = [
    (1, 0),
    (-1, 0),
    (0, 1),
    (0, -1),
    (1, 1),
    (1, -1),
    (-1, 1),
    (-1, -1),
];

fn steps(piece: PieceKind) -> &'static [(i16, i16)] {
    match piece {
        PieceKind::Keep => &ORTHOGONAL,
        PieceKind::Scout | PieceKind::Crown => &ALL_DIRECTIONS,
    }
}

fn in_bounds(pos: Coord) -> bool {
    pos.x >= 0 && pos.x < BOARD_SIZE && pos.y >= 0 && pos.y < BOARD_SIZE
}

impl RulesValidator for SkirmishRules {
    fn is_legal_move(
        &self,
        world: &WorldState,
        agent: usize,
        mv: &MoveRequest,
    ) -> std::result::Result<(), String> {
        if !in_bounds(mv.from) || !in_bounds(mv.to) {
            return Err("Move is off the board".to_string());
        }

        let mover = match world.entity_at(mv.from) {
            Some(e) if e.agent == agent && e.piece == mv.piece => e,
            Some(_) => return Err("No such piece of yours at the origin".to_string()),
            None => return Err("No piece at the origin".to_string()),
        };

        let delta = (mv.to.x - mv.from.x, mv.to.y - mv.from.y);
        if !steps(mover.piece).contains(&delta) {
            return Err(format!("A {} cannot move like that", mover.piece.as_str()));
        }

        if let Some(occupant) = world.entity_at(mv.to) {
            if occupant.agent == agent {
                return Err("Cannot capture your own piece".to_string());
            }
        }

        Ok(())
    }

    fn enumerate_legal_moves(
        &self,
        world: &WorldState,
        agent: usize,
        from: Option<Coord>,
        piece: Option<PieceKind>,
    ) -> Vec<MoveRequest> {
        let mut moves = Vec::new();

        for entity in world.entities() {
            if entity.agent != agent {
                continue;
            }
            if from.is_some_and(|f| f != entity.pos) {
                continue;
            }
            if piece.is_some_and(|p| p != entity.piece) {
                continue;
            }

            for (dx, dy) in steps(entity.piece) {
                let to = Coord::new(entity.pos.x + dx, entity.pos.y + dy);
                if !in_bounds(to) {
                    continue;
                }
                if world.entity_at(to).is_some_and(|e| e.agent == agent) {
                    continue;
                }
                moves.push(MoveRequest {
                    from: entity.pos,
                    to,
                    piece: entity.piece,
                });
            }
        }

        moves
    }

    fn is_terminal(&self, world: &WorldState) -> Terminal {
        if !world.crown_alive(0) {
            return Terminal::won_by(1);
        }
        if !world.crown_alive(1) {
            return Terminal::won_by(0);
        }

        let on_turn = world.current_turn();
        if self
            .enumerate_legal_moves(world, on_turn, None, None)
            .is_empty()
        {
            return Terminal::drawn();
        }

        Terminal::ongoing()
    }
}
