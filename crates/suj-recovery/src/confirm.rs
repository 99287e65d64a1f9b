use std::fmt;

use serde::{Deserialize, Serialize};

/// Points at which recovery asks before going on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Before any recovery work.
    Recover,
    /// Before anything reaches the disk.
    WriteChanges,
}

impl Gate {
    #[must_use]
    pub fn prompt(self) -> &'static str {
        match self {
            Self::Recover => "RECOVER",
            Self::WriteChanges => "WRITE CHANGES",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prompt())
    }
}

/// Answers the yes/no questions recovery asks.
pub trait Confirm {
    fn confirm(&mut self, gate: Gate) -> bool;
}

impl<F: FnMut(Gate) -> bool> Confirm for F {
    fn confirm(&mut self, gate: Gate) -> bool {
        self(gate)
    }
}

/// Answers yes to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&mut self, _gate: Gate) -> bool {
        true
    }
}

/// Answers no to everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&mut self, _gate: Gate) -> bool {
        false
    }
}
