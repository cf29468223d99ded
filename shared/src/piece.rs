//! Piece catalogue and orientation transforms.
//!
//! Every piece is a fixed set of cells relative to its own origin. An
//! orientation is applied as a flip followed by a clockwise rotation, and the
//! result is normalized so the smallest row and column sit at zero.

use crate::Position;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PieceKind {
    Single = 1,
    Domino,
    TrioLine,
    TrioAngle,
    TetroI,
    TetroO,
    TetroT,
    TetroL,
    TetroS,
    PentoF,
    PentoI,
    PentoL,
    PentoN,
    PentoP,
    PentoT,
    PentoU,
    PentoV,
    PentoW,
    PentoX,
    PentoY,
    PentoZ,
}

impl PieceKind {
    pub const ALL: [PieceKind; 21] = [
        PieceKind::Single,
        PieceKind::Domino,
        PieceKind::TrioLine,
        PieceKind::TrioAngle,
        PieceKind::TetroI,
        PieceKind::TetroO,
        PieceKind::TetroT,
        PieceKind::TetroL,
        PieceKind::TetroS,
        PieceKind::PentoF,
        PieceKind::PentoI,
        PieceKind::PentoL,
        PieceKind::PentoN,
        PieceKind::PentoP,
        PieceKind::PentoT,
        PieceKind::PentoU,
        PieceKind::PentoV,
        PieceKind::PentoW,
        PieceKind::PentoX,
        PieceKind::PentoY,
        PieceKind::PentoZ,
    ];

    /// Wire id, 1 through 21.
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(usize::from(id).checked_sub(1)?).copied()
    }

    /// Cells of the piece in its base orientation.
    pub fn base_cells(self) -> &'static [Position] {
        match self {
            PieceKind::Single => &[(0, 0)],
            PieceKind::Domino => &[(0, 0), (0, 1)],
            PieceKind::TrioLine => &[(0, 0), (0, 1), (0, 2)],
            PieceKind::TrioAngle => &[(0, 0), (0, 1), (1, 1)],
            PieceKind::TetroI => &[(0, 0), (0, 1), (0, 2), (0, 3)],
            PieceKind::TetroO => &[(0, 0), (0, 1), (1, 0), (1, 1)],
            PieceKind::TetroT => &[(0, 0), (0, 1), (0, 2), (1, 1)],
            PieceKind::TetroL => &[(0, 0), (0, 1), (0, 2), (1, 0)],
            PieceKind::TetroS => &[(0, 0), (0, 1), (1, 1), (1, 2)],
            PieceKind::PentoF => &[(0, 1), (0, 2), (1, 0), (1, 1), (2, 1)],
            PieceKind::PentoI => &[(0, 0), (0, 1), (0, 2), (0, 3), (0, 4)],
            PieceKind::PentoL => &[(0, 0), (0, 1), (0, 2), (0, 3), (1, 0)],
            PieceKind::PentoN => &[(0, 0), (0, 1), (0, 2), (1, 2), (1, 3)],
            PieceKind::PentoP => &[(0, 0), (0, 1), (1, 0), (1, 1), (2, 0)],
            PieceKind::PentoT => &[(0, 0), (0, 1), (0, 2), (1, 1), (2, 1)],
            PieceKind::PentoU => &[(0, 0), (0, 2), (1, 0), (1, 1), (1, 2)],
            PieceKind::PentoV => &[(0, 0), (1, 0), (2, 0), (2, 1), (2, 2)],
            PieceKind::PentoW => &[(0, 0), (1, 0), (1, 1), (2, 1), (2, 2)],
            PieceKind::PentoX => &[(0, 1), (1, 0), (1, 1), (1, 2), (2, 1)],
            PieceKind::PentoY => &[(0, 0), (0, 1), (0, 2), (0, 3), (1, 1)],
            PieceKind::PentoZ => &[(0, 0), (0, 1), (1, 1), (2, 1), (2, 2)],
        }
    }

    /// Number of cells, which is also the piece's score value.
    pub fn size(self) -> usize {
        self.base_cells().len()
    }

    pub fn name(self) -> &'static str {
        match self {
            PieceKind::Single => "single",
            PieceKind::Domino => "domino",
            PieceKind::TrioLine => "trio_line",
            PieceKind::TrioAngle => "trio_angle",
            PieceKind::TetroI => "tetro_i",
            PieceKind::TetroO => "tetro_o",
            PieceKind::TetroT => "tetro_t",
            PieceKind::TetroL => "tetro_l",
            PieceKind::TetroS => "tetro_s",
            PieceKind::PentoF => "pento_f",
            PieceKind::PentoI => "pento_i",
            PieceKind::PentoL => "pento_l",
            PieceKind::PentoN => "pento_n",
            PieceKind::PentoP => "pento_p",
            PieceKind::PentoT => "pento_t",
            PieceKind::PentoU => "pento_u",
            PieceKind::PentoV => "pento_v",
            PieceKind::PentoW => "pento_w",
            PieceKind::PentoX => "pento_x",
            PieceKind::PentoY => "pento_y",
            PieceKind::PentoZ => "pento_z",
        }
    }

    /// Every distinct cell layout this piece can take, sorted and deduplicated.
    pub fn distinct_orientations(self) -> Vec<Vec<Position>> {
        let mut shapes: Vec<Vec<Position>> = Orientation::all()
            .map(|orientation| {
                let mut cells = orientation.apply(self.base_cells());
                cells.sort_unstable();
                cells
            })
            .collect();
        shapes.sort();
        shapes.dedup();
        shapes
    }
}

impl fmt::Display for PieceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Clockwise rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub const ALL: [Rotation; 4] = [
        Rotation::Deg0,
        Rotation::Deg90,
        Rotation::Deg180,
        Rotation::Deg270,
    ];

    /// Quarter turns on the wire: 0 through 3.
    pub fn from_wire(value: u16) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    fn apply(self, (row, col): Position) -> Position {
        match self {
            Rotation::Deg0 => (row, col),
            Rotation::Deg90 => (col, -row),
            Rotation::Deg180 => (-row, -col),
            Rotation::Deg270 => (-col, row),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Flip {
    #[default]
    Normal,
    Horizontal,
    Vertical,
    Both,
}

impl Flip {
    pub const ALL: [Flip; 4] = [Flip::Normal, Flip::Horizontal, Flip::Vertical, Flip::Both];

    pub fn from_wire(value: u16) -> Option<Self> {
        Self::ALL.get(usize::from(value)).copied()
    }

    pub fn index(self) -> u8 {
        self as u8
    }

    fn apply(self, (row, col): Position) -> Position {
        match self {
            Flip::Normal => (row, col),
            Flip::Horizontal => (row, -col),
            Flip::Vertical => (-row, col),
            Flip::Both => (-row, -col),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Orientation {
    pub rotation: Rotation,
    pub flip: Flip,
}

impl Orientation {
    pub fn new(rotation: Rotation, flip: Flip) -> Self {
        Self { rotation, flip }
    }

    /// All sixteen rotation/flip combinations. Several coincide for
    /// symmetric pieces; see [`PieceKind::distinct_orientations`].
    pub fn all() -> impl Iterator<Item = Orientation> {
        Flip::ALL.into_iter().flat_map(|flip| {
            Rotation::ALL
                .into_iter()
                .map(move |rotation| Orientation::new(rotation, flip))
        })
    }

    /// Flip, then rotate, then normalize.
    pub fn apply(self, cells: &[Position]) -> Vec<Position> {
        let moved: Vec<Position> = cells
            .iter()
            .map(|&cell| self.rotation.apply(self.flip.apply(cell)))
            .collect();
        normalize(&moved)
    }
}

/// Translates cells so the minimum row and column become zero.
pub fn normalize(cells: &[Position]) -> Vec<Position> {
    let min_row = cells.iter().map(|&(r, _)| r).min().unwrap_or(0);
    let min_col = cells.iter().map(|&(_, c)| c).min().unwrap_or(0);
    cells
        .iter()
        .map(|&(r, c)| (r - min_row, c - min_col))
        .collect()
}
