pub mod piece;
pub mod protocol;
pub mod rules;

pub use piece::{Flip, Orientation, PieceKind, Rotation};
pub use protocol::{encode_frame, Command, CommandKind, FrameDecoder, FrameError, ParseError};
pub use rules::{Placement, PlacementError, RuleEngine};

use serde::{Deserialize, Serialize};
use std::fmt;

pub const BOARD_SIZE: i32 = 20;
pub const MAX_PLAYERS: usize = 4;
pub const MIN_PLAYERS_TO_START: usize = 2;
pub const PIECES_PER_COLOR: usize = 21;
pub const ALL_PIECES_BONUS: i32 = 15;
pub const SINGLE_LAST_BONUS: i32 = 5;

/// `(row, col)` on the board.
pub type Position = (i32, i32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Color {
    Blue = 1,
    Yellow = 2,
    Red = 3,
    Green = 4,
}

impl Color {
    /// Seating and turn order.
    pub const ALL: [Color; 4] = [Color::Blue, Color::Yellow, Color::Red, Color::Green];

    pub fn index(self) -> usize {
        self as usize - 1
    }

    /// Wire id, 1 through 4.
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id).checked_sub(1)?).copied()
    }

    pub fn start_corner(self) -> Position {
        let last = BOARD_SIZE - 1;
        match self {
            Color::Blue => (0, 0),
            Color::Yellow => (0, last),
            Color::Red => (last, 0),
            Color::Green => (last, last),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Yellow => "yellow",
            Color::Red => "red",
            Color::Green => "green",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_ids_and_indices() {
        for (i, color) in Color::ALL.into_iter().enumerate() {
            assert_eq!(color.index(), i);
            assert_eq!(Color::from_id(color.id()), Some(color));
        }
        assert_eq!(Color::from_id(0), None);
        assert_eq!(Color::from_id(5), None);
    }

    #[test]
    fn test_start_corners() {
        assert_eq!(Color::Blue.start_corner(), (0, 0));
        assert_eq!(Color::Yellow.start_corner(), (0, 19));
        assert_eq!(Color::Red.start_corner(), (19, 0));
        assert_eq!(Color::Green.start_corner(), (19, 19));
    }

    #[test]
    fn test_color_display() {
        assert_eq!(Color::Yellow.to_string(), "yellow");
    }
}
