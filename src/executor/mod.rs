//! Seam towards the program under test.
//!
//! The engines only ever see this trait: one execution in, raw probe output
//! and an exit classification back.

pub mod command;

use std::time::Duration;

use libafl::executors::ExitKind;
use libafl_bolts::Error;
use serde_derive::{Deserialize, Serialize};

/// Raw bytes emitted by the coverage or taint probe for one execution.
#[derive(Clone, Debug, Default)]
pub struct PutFeedback {
    data: Vec<u8>,
}

impl PutFeedback {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// On-disk exit enumerant written into corpus file names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Ok = 0,
    Timeout = 1,
    Crash = 2,
    Error = 3,
}

impl ExitReason {
    #[must_use]
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitKind> for ExitReason {
    fn from(kind: ExitKind) -> Self {
        match kind {
            ExitKind::Ok => Self::Ok,
            ExitKind::Timeout => Self::Timeout,
            ExitKind::Crash | ExitKind::Oom => Self::Crash,
            _ => Self::Error,
        }
    }
}

/// Classification of one execution, filled in by the executor.
#[derive(Clone, Debug)]
pub struct ExitStatus {
    pub exit_kind: ExitKind,
    pub signal: Option<i32>,
    pub time: Duration,
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self {
            exit_kind: ExitKind::Ok,
            signal: None,
            time: Duration::ZERO,
        }
    }
}

pub trait PutExecutor {
    /// Run the PUT on `buf` under the coverage probe.
    fn run(&mut self, buf: &[u8], exit: &mut ExitStatus) -> Result<PutFeedback, Error>;

    /// Run the PUT on `buf` under the taint probe.
    fn run_taint(&mut self, buf: &[u8], exit: &mut ExitStatus) -> Result<PutFeedback, Error>;
}

#[cfg(test)]
mod tests {
    use libafl::executors::ExitKind;

    use super::ExitReason;

    #[test]
    fn exit_reason_codes_are_stable() {
        assert_eq!(ExitReason::from(ExitKind::Ok).code(), 0);
        assert_eq!(ExitReason::from(ExitKind::Timeout).code(), 1);
        assert_eq!(ExitReason::from(ExitKind::Crash).code(), 2);
    }
}
