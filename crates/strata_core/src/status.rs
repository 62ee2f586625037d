//! Status vocabulary shared by the sequencer subsystem.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome codes used across the sequencer subsystem.
///
/// The background reconfiguration path distinguishes intent, not origin:
/// benign codes drop a log from the pending set, transient codes keep it and
/// arm a retry, everything else is terminal for the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Ok,
    UpToDate,
    InProgress,
    NoSequencer,
    NotFound,
    Failed,
    NoBufs,
    TooMany,
    NotConn,
    Access,
    SysLimit,
    Aborted,
    Shutdown,
    TooBig,
    Internal,
}

impl Status {
    /// Failures worth retrying on a timer.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::NoBufs | Status::TooMany | Status::NotConn | Status::Access
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::UpToDate => "UPTODATE",
            Status::InProgress => "INPROGRESS",
            Status::NoSequencer => "NOSEQUENCER",
            Status::NotFound => "NOTFOUND",
            Status::Failed => "FAILED",
            Status::NoBufs => "NOBUFS",
            Status::TooMany => "TOOMANY",
            Status::NotConn => "NOTCONN",
            Status::Access => "ACCESS",
            Status::SysLimit => "SYSLIMIT",
            Status::Aborted => "ABORTED",
            Status::Shutdown => "SHUTDOWN",
            Status::TooBig => "TOOBIG",
            Status::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_set_matches_retry_policy() {
        for st in [
            Status::Failed,
            Status::NoBufs,
            Status::TooMany,
            Status::NotConn,
            Status::Access,
        ] {
            assert!(st.is_transient(), "{st} should be transient");
        }
        for st in [
            Status::Ok,
            Status::UpToDate,
            Status::InProgress,
            Status::NoSequencer,
            Status::NotFound,
            Status::SysLimit,
            Status::Aborted,
            Status::Shutdown,
            Status::TooBig,
            Status::Internal,
        ] {
            assert!(!st.is_transient(), "{st} should not be transient");
        }
    }
}
