//! Move selection for AI seats.

use shared::{Color, Placement, RuleEngine};

/// Picks a placement for `color` on the current board. Returning `None`
/// passes the turn.
pub trait MoveChooser: Send + Sync {
    fn choose(&self, engine: &RuleEngine, color: Color, difficulty: u8) -> Option<Placement>;
}

/// Plays the first legal placement found, largest pieces first. Difficulty
/// is ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstLegalMove;

impl MoveChooser for FirstLegalMove {
    fn choose(&self, engine: &RuleEngine, color: Color, _difficulty: u8) -> Option<Placement> {
        engine.first_legal_placement(color)
    }
}
