use thiserror::Error;

use crate::match_state::Color;

/// Errors from the rules engine; surfaced to the client as a rejected
/// move, never as a closed connection.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoardError {
    #[error("point ({col}, {row}) is off the board")]
    OutOfBounds { col: u8, row: u8 },

    #[error("point ({col}, {row}) is occupied")]
    Occupied { col: u8, row: u8 },

    #[error("bad board snapshot: {0}")]
    BadSnapshot(String),
}

/// Capability interface over the board-rules engine.
///
/// The session core never inspects board internals; it applies accepted
/// placements, ships opaque snapshots to clients and the presence store,
/// and asks for a score when both players pass. Full rules engines
/// (capture resolution, territory scoring) plug in behind this trait.
pub trait BoardEngine: Send + Sync {
    /// Place a stone. Must leave the board unchanged on rejection.
    fn apply(&mut self, color: Color, col: u8, row: u8) -> Result<(), BoardError>;

    /// Opaque snapshot of the current position.
    fn encode(&self) -> String;

    /// Restore a position previously produced by `encode`.
    fn load(&mut self, snapshot: &str) -> Result<(), BoardError>;

    /// (black, white) scores.
    fn score(&self) -> (f32, f32);
}

/// Constructs one engine per match.
pub trait BoardFactory: Send + Sync {
    fn create(&self, size: u8) -> Box<dyn BoardEngine>;
}

/// Minimal built-in engine: occupancy-only legality and stone-count
/// scoring. Stands in for an external engine in single-binary
/// deployments and in tests.
pub struct GridBoard {
    size: u8,
    cells: Vec<Option<Color>>,
}

impl GridBoard {
    pub fn new(size: u8) -> Self {
        Self {
            size,
            cells: vec![None; size as usize * size as usize],
        }
    }

    fn index(&self, col: u8, row: u8) -> Option<usize> {
        if col >= self.size || row >= self.size {
            return None;
        }
        Some(row as usize * self.size as usize + col as usize)
    }
}

impl BoardEngine for GridBoard {
    fn apply(&mut self, color: Color, col: u8, row: u8) -> Result<(), BoardError> {
        let idx = self
            .index(col, row)
            .ok_or(BoardError::OutOfBounds { col, row })?;
        if self.cells[idx].is_some() {
            return Err(BoardError::Occupied { col, row });
        }
        self.cells[idx] = Some(color);
        Ok(())
    }

    fn encode(&self) -> String {
        self.cells
            .iter()
            .map(|cell| match cell {
                Some(Color::Black) => 'b',
                Some(Color::White) => 'w',
                None => '.',
            })
            .collect()
    }

    fn load(&mut self, snapshot: &str) -> Result<(), BoardError> {
        if snapshot.chars().count() != self.cells.len() {
            return Err(BoardError::BadSnapshot(format!(
                "expected {} cells, got {}",
                self.cells.len(),
                snapshot.chars().count()
            )));
        }
        let mut cells = Vec::with_capacity(self.cells.len());
        for ch in snapshot.chars() {
            cells.push(match ch {
                'b' => Some(Color::Black),
                'w' => Some(Color::White),
                '.' => None,
                other => {
                    return Err(BoardError::BadSnapshot(format!("unknown cell '{other}'")));
                }
            });
        }
        self.cells = cells;
        Ok(())
    }

    fn score(&self) -> (f32, f32) {
        let black = self
            .cells
            .iter()
            .filter(|c| **c == Some(Color::Black))
            .count();
        let white = self
            .cells
            .iter()
            .filter(|c| **c == Some(Color::White))
            .count();
        (black as f32, white as f32)
    }
}

/// Factory for the built-in engine.
pub struct GridBoardFactory;

impl BoardFactory for GridBoardFactory {
    fn create(&self, size: u8) -> Box<dyn BoardEngine> {
        Box::new(GridBoard::new(size))
    }
}
