//! Log replay: rebuilding committed state from a physical change stream
//!
//! The physical log reader is an external collaborator behind
//! [`ChangeSource`]; this loop consumes its parsed changes in log order and
//! applies them mechanically. Constraint checks are suppressed throughout:
//! committed history is trusted, so replaying an insert whose key already
//! exists must not raise the way it would inside a live transaction.
//!
//! A corrupt entry follows [`ReplayPolicy`]: the default stops the replay
//! with the read error; `SkipCorrupt` logs a warning and continues,
//! trading one lost entry for a completed scan. Entries applied before a
//! failing one stay applied.

use tracing::{debug, warn};

use crate::catalog::{Database, LoggedChange};
use crate::core::{ReplayConfig, ReplayPolicy, Result};
use crate::txn::physical::Change;

/// A parsed-change stream, usually wrapping a physical log reader
pub trait ChangeSource {
    /// Next change in log order; None at end of log. A parse or I/O
    /// failure for one entry is an `Err` item, not the end of the stream.
    fn next_change(&mut self) -> Option<Result<Change>>;
}

impl<I> ChangeSource for I
where
    I: Iterator<Item = Result<Change>>,
{
    fn next_change(&mut self) -> Option<Result<Change>> {
        self.next()
    }
}

/// Outcome counts of a replay pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: usize,
    pub skipped: usize,
}

/// Replays a change stream into the database's committed state
pub fn replay<S: ChangeSource>(
    db: &Database,
    source: &mut S,
    config: &ReplayConfig,
) -> Result<ReplayStats> {
    let _guard = db.commit_lock.lock();
    let mut shared = db.shared.write();
    let mut stats = ReplayStats::default();

    while let Some(entry) = source.next_change() {
        match entry {
            Ok(change) => {
                let position = shared.position;
                shared.catalog.apply(position, &change)?;
                shared.log.push(LoggedChange { position, change });
                shared.position += 1;
                stats.applied += 1;
            }
            Err(err) => match config.on_corrupt_entry {
                ReplayPolicy::Fail => {
                    debug!(applied = stats.applied, "replay stopped on corrupt entry");
                    return Err(err);
                }
                ReplayPolicy::SkipCorrupt => {
                    warn!(position = shared.position, %err, "skipping corrupt log entry");
                    stats.skipped += 1;
                }
            },
        }
    }

    debug!(
        applied = stats.applied,
        skipped = stats.skipped,
        position = shared.position,
        "replay complete"
    );
    Ok(stats)
}
