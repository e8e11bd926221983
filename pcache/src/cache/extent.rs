//! Per-range cache state and the merge rules between states.

use crate::interval::{IntervalMap, Segment};
use serde::{Deserialize, Serialize};

#[repr(u8)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheState {
    #[default]
    Hole = 0,
    Clean = 1,
    Dirty = 2,
    /// Just written back; always folds into `Clean`.
    Cleansed = 3,
}

impl CacheState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(CacheState::Hole),
            1 => Some(CacheState::Clean),
            2 => Some(CacheState::Dirty),
            3 => Some(CacheState::Cleansed),
            _ => None,
        }
    }

    /// State of a range after `incoming` lands on top of `self`, or `None`
    /// when the combination is forbidden.
    pub fn merge(self, incoming: CacheState) -> Option<CacheState> {
        use CacheState::*;
        match (self, incoming) {
            (Hole, s) => Some(s),
            (Clean, Clean | Cleansed) => Some(Clean),
            (Clean, Dirty) => Some(Dirty),
            (Clean, Hole) => Some(Clean),
            (Dirty, Dirty | Hole) => Some(Dirty),
            (Dirty, Cleansed) => Some(Clean),
            // dirty bytes must be written back before clean data replaces them
            (Dirty, Clean) => None,
            (Cleansed, _) => None,
        }
    }
}

impl Segment for CacheState {
    fn absorb(&mut self, incoming: &Self) {
        match self.merge(*incoming) {
            Some(next) => *self = next,
            None => panic!("cannot merge {incoming:?} into {self:?} extent"),
        }
    }

    fn is_neutral(&self) -> bool {
        *self == CacheState::Hole
    }
}

pub type ExtentMap = IntervalMap<CacheState>;
