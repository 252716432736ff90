//! Conflict resolution between a local and a remote copy of the same task
//!
//! Last-write-wins on `updated_at`; equal timestamps keep the local copy.
//! Reconciliation passes do not call this themselves: they only apply the
//! authority's per-item verdicts. It is offered to higher-level merge code.

use crate::tasks::Task;
use serde::{Deserialize, Serialize};

/// Which side a resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Winner {
    Local,
    Remote,
}

/// Decide which side wins
pub fn winner(local: &Task, remote: &Task) -> Winner {
    if local.updated_at >= remote.updated_at {
        Winner::Local
    } else {
        Winner::Remote
    }
}

/// Return the version to keep
pub fn resolve<'a>(local: &'a Task, remote: &'a Task) -> &'a Task {
    match winner(local, remote) {
        Winner::Local => local,
        Winner::Remote => remote,
    }
}
