//! Authoritative placement rules for one board.
//!
//! [`RuleEngine`] owns the grid, the per-color piece inventory and the turn
//! cursor. Legality checks never mutate; `place` mutates only when the full
//! check passes.

use crate::piece::{Flip, Orientation, PieceKind, Rotation};
use crate::{
    Color, Position, ALL_PIECES_BONUS, BOARD_SIZE, PIECES_PER_COLOR, SINGLE_LAST_BONUS,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

const SIDE: usize = BOARD_SIZE as usize;
const ORTHOGONAL: [Position; 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
const DIAGONAL: [Position; 4] = [(-1, -1), (-1, 1), (1, -1), (1, 1)];

/// A piece dropped at `(row, col)`: the normalized origin of the oriented
/// shape lands on that cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Placement {
    pub piece: PieceKind,
    pub row: i32,
    pub col: i32,
    pub orientation: Orientation,
    pub color: Color,
}

impl Placement {
    pub fn new(
        piece: PieceKind,
        (row, col): Position,
        rotation: Rotation,
        flip: Flip,
        color: Color,
    ) -> Self {
        Self {
            piece,
            row,
            col,
            orientation: Orientation::new(rotation, flip),
            color,
        }
    }

    /// Base orientation at the given cell.
    pub fn at(piece: PieceKind, position: Position, color: Color) -> Self {
        Self::new(piece, position, Rotation::Deg0, Flip::Normal, color)
    }

    /// Absolute board cells covered by this placement.
    pub fn cells(&self) -> Vec<Position> {
        self.orientation
            .apply(self.piece.base_cells())
            .into_iter()
            .map(|(r, c)| (r + self.row, c + self.col))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PlacementError {
    #[error("piece extends outside the board")]
    OutOfBounds,
    #[error("piece overlaps an occupied cell")]
    Overlap,
    #[error("piece has already been used")]
    PieceUsed,
    #[error("first piece must cover the {0} starting corner")]
    MissingStartCorner(Color),
    #[error("piece must touch a same-color piece at a corner")]
    NoCornerContact,
    #[error("piece may not share an edge with a same-color piece")]
    EdgeContact,
}

#[derive(Debug, Clone)]
pub struct RuleEngine {
    board: [[Option<Color>; SIDE]; SIDE],
    used: [BTreeSet<PieceKind>; 4],
    placed_first: [bool; 4],
    last_piece: [Option<PieceKind>; 4],
    turn_order: Vec<Color>,
    current_turn: Option<Color>,
    turn_number: u32,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            board: [[None; SIDE]; SIDE],
            used: Default::default(),
            placed_first: [false; 4],
            last_piece: [None; 4],
            turn_order: Vec::new(),
            current_turn: None,
            turn_number: 0,
        }
    }

    /// Clears the board, inventories and turn state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Resets and hands the first turn to the head of `turn_order`.
    pub fn start(&mut self, turn_order: &[Color]) {
        self.reset();
        self.turn_order = turn_order.to_vec();
        self.current_turn = self.turn_order.first().copied();
        self.turn_number = u32::from(self.current_turn.is_some());
    }

    pub fn cell(&self, (row, col): Position) -> Option<Color> {
        if in_bounds((row, col)) {
            self.board[row as usize][col as usize]
        } else {
            None
        }
    }

    /// Runs every legality check in order and returns the covered cells.
    pub fn check(&self, placement: &Placement) -> Result<Vec<Position>, PlacementError> {
        let cells = placement.cells();
        let color = placement.color;

        if !cells.iter().all(|&cell| in_bounds(cell)) {
            return Err(PlacementError::OutOfBounds);
        }
        if cells.iter().any(|&cell| self.cell(cell).is_some()) {
            return Err(PlacementError::Overlap);
        }
        if self.used[color.index()].contains(&placement.piece) {
            return Err(PlacementError::PieceUsed);
        }

        if !self.placed_first[color.index()] {
            if !cells.contains(&color.start_corner()) {
                return Err(PlacementError::MissingStartCorner(color));
            }
            return Ok(cells);
        }

        if !cells.iter().any(|&cell| self.touches(cell, color, &DIAGONAL)) {
            return Err(PlacementError::NoCornerContact);
        }
        if cells.iter().any(|&cell| self.touches(cell, color, &ORTHOGONAL)) {
            return Err(PlacementError::EdgeContact);
        }
        Ok(cells)
    }

    pub fn can_place(&self, placement: &Placement) -> bool {
        self.check(placement).is_ok()
    }

    /// Applies the placement if legal; the board is untouched otherwise.
    pub fn try_place(&mut self, placement: &Placement) -> Result<Vec<Position>, PlacementError> {
        let cells = self.check(placement)?;
        let idx = placement.color.index();

        for &(row, col) in &cells {
            self.board[row as usize][col as usize] = Some(placement.color);
        }
        self.used[idx].insert(placement.piece);
        self.placed_first[idx] = true;
        self.last_piece[idx] = Some(placement.piece);
        Ok(cells)
    }

    pub fn place(&mut self, placement: &Placement) -> bool {
        self.try_place(placement).is_ok()
    }

    pub fn available_pieces(&self, color: Color) -> BTreeSet<PieceKind> {
        PieceKind::ALL
            .into_iter()
            .filter(|piece| !self.used[color.index()].contains(piece))
            .collect()
    }

    pub fn remaining_count(&self, color: Color) -> usize {
        PIECES_PER_COLOR - self.used[color.index()].len()
    }

    pub fn has_placed_first(&self, color: Color) -> bool {
        self.placed_first[color.index()]
    }

    pub fn last_piece(&self, color: Color) -> Option<PieceKind> {
        self.last_piece[color.index()]
    }

    /// Cells currently owned by `color`.
    pub fn placed_cells(&self, color: Color) -> usize {
        self.board
            .iter()
            .flatten()
            .filter(|owner| **owner == Some(color))
            .count()
    }

    /// True once no unused piece fits anywhere in any orientation.
    pub fn is_stuck(&self, color: Color) -> bool {
        self.first_legal_placement(color).is_none()
    }

    /// Every color on the board is stuck.
    pub fn is_finished(&self) -> bool {
        Color::ALL.into_iter().all(|color| self.is_stuck(color))
    }

    /// First legal placement found, trying the largest unused pieces first.
    pub fn first_legal_placement(&self, color: Color) -> Option<Placement> {
        let anchors = self.anchors(color);
        if anchors.is_empty() {
            return None;
        }

        let mut pieces: Vec<PieceKind> = self.available_pieces(color).into_iter().collect();
        pieces.sort_by_key(|piece| std::cmp::Reverse(piece.size()));

        for piece in pieces {
            for orientation in Orientation::all() {
                let shape = orientation.apply(piece.base_cells());
                for &(anchor_row, anchor_col) in &anchors {
                    for &(dr, dc) in &shape {
                        let candidate = Placement {
                            piece,
                            row: anchor_row - dr,
                            col: anchor_col - dc,
                            orientation,
                            color,
                        };
                        if self.can_place(&candidate) {
                            return Some(candidate);
                        }
                    }
                }
            }
        }
        None
    }

    /// Final score: unused cells count against the color; finishing every
    /// piece earns a bonus, and a larger one if the single went down last.
    pub fn score(&self, color: Color) -> i32 {
        let remaining: usize = self
            .available_pieces(color)
            .into_iter()
            .map(PieceKind::size)
            .sum();

        if remaining > 0 {
            return -(remaining as i32);
        }
        if self.last_piece(color) == Some(PieceKind::Single) {
            ALL_PIECES_BONUS + SINGLE_LAST_BONUS
        } else {
            ALL_PIECES_BONUS
        }
    }

    pub fn scores(&self) -> BTreeMap<Color, i32> {
        Color::ALL
            .into_iter()
            .map(|color| (color, self.score(color)))
            .collect()
    }

    pub fn turn_order(&self) -> &[Color] {
        &self.turn_order
    }

    pub fn current_turn(&self) -> Option<Color> {
        self.current_turn
    }

    pub fn turn_number(&self) -> u32 {
        self.turn_number
    }

    /// Moves the cursor to the next color in the turn order.
    pub fn advance_turn(&mut self) -> Option<Color> {
        let current = self.current_turn?;
        let pos = self.turn_order.iter().position(|&c| c == current)?;
        let next = self.turn_order[(pos + 1) % self.turn_order.len()];
        self.current_turn = Some(next);
        self.turn_number += 1;
        Some(next)
    }

    /// Drops a color from the rotation. If it held the turn, the turn passes
    /// to the color that followed it.
    pub fn remove_from_turn_order(&mut self, color: Color) -> Option<Color> {
        let Some(pos) = self.turn_order.iter().position(|&c| c == color) else {
            return self.current_turn;
        };
        self.turn_order.remove(pos);

        if self.turn_order.is_empty() {
            self.current_turn = None;
        } else if self.current_turn == Some(color) {
            self.current_turn = Some(self.turn_order[pos % self.turn_order.len()]);
            self.turn_number += 1;
        }
        self.current_turn
    }

    /// Empty cells where a new piece for `color` could legally begin.
    fn anchors(&self, color: Color) -> Vec<Position> {
        if !self.has_placed_first(color) {
            let corner = color.start_corner();
            return if self.cell(corner).is_none() {
                vec![corner]
            } else {
                Vec::new()
            };
        }

        let mut anchors = Vec::new();
        for row in 0..BOARD_SIZE {
            for col in 0..BOARD_SIZE {
                let cell = (row, col);
                if self.cell(cell).is_none()
                    && self.touches(cell, color, &DIAGONAL)
                    && !self.touches(cell, color, &ORTHOGONAL)
                {
                    anchors.push(cell);
                }
            }
        }
        anchors
    }

    fn touches(&self, (row, col): Position, color: Color, offsets: &[Position]) -> bool {
        offsets
            .iter()
            .any(|&(dr, dc)| self.cell((row + dr, col + dc)) == Some(color))
    }
}

fn in_bounds((row, col): Position) -> bool {
    (0..BOARD_SIZE).contains(&row) && (0..BOARD_SIZE).contains(&col)
}
