//! Level and Job State
//!
//! Each hierarchy level moves through
//! `UNPLANNED -> GRAPH_BUILT -> CATALOGS_RESOLVED -> ORDERED -> SUBMITTED`
//! and ends `COMPLETED`, `FAILED` or `CANCELLED`. A structural error may
//! fail a level from any non-terminal phase.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::Serialize;

/// Planning phase of one level.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LevelPhase {
    Unplanned,
    GraphBuilt,
    CatalogsResolved,
    Ordered,
    Submitted,
    Completed,
    Failed,
    Cancelled,
}

impl LevelPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_advance_to(self, next: LevelPhase) -> bool {
        use LevelPhase::*;

        if self.is_terminal() {
            return false;
        }
        match next {
            Failed | Cancelled => true,
            GraphBuilt => self == Unplanned,
            CatalogsResolved => self == GraphBuilt,
            Ordered => self == CatalogsResolved,
            Submitted => self == Ordered,
            Completed => self == Submitted,
            Unplanned => false,
        }
    }
}

/// Status of one job within its level.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for upstream jobs
    Pending,
    /// Dispatched, awaiting completion
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Phase tracker with a timestamped history.
#[derive(Serialize, Debug, Clone)]
pub struct LevelState {
    phase: LevelPhase,
    history: Vec<(LevelPhase, DateTime<Utc>)>,
}

impl LevelState {
    pub fn new() -> Self {
        Self {
            phase: LevelPhase::Unplanned,
            history: vec![(LevelPhase::Unplanned, Utc::now())],
        }
    }

    pub fn phase(&self) -> LevelPhase {
        self.phase
    }

    /// Moves to `next`. Illegal transitions are ignored and return false.
    pub fn advance(&mut self, next: LevelPhase) -> bool {
        if !self.phase.can_advance_to(next) {
            warn!("Ignoring illegal level transition {:?} -> {:?}", self.phase, next);
            return false;
        }
        debug!("Level phase {:?} -> {:?}", self.phase, next);
        self.phase = next;
        self.history.push((next, Utc::now()));
        true
    }

    pub fn history(&self) -> impl Iterator<Item = LevelPhase> + '_ {
        self.history.iter().map(|(phase, _)| *phase)
    }
}

impl Default for LevelState {
    fn default() -> Self {
        Self::new()
    }
}
