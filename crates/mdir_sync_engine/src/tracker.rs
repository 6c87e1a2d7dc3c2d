//! Command tracker.
//!
//! Correlates outgoing requests with sequence-numbered responses. Commands
//! are indexed by sequence number (to match responses) and by
//! `(kind, path)` (so a second attempt is only made once the first has
//! timed out).
//!
//! ```text
//! PENDING ──200──────────▶ ACKNOWLEDGED (finalizer on_success)
//!    │ ──other status────▶ REJECTED     (finalizer on_failure)
//!    └─age > timeout─────▶ TIMED_OUT    (try_issue may supersede)
//! ```

use mdir_core::DirId;
use mdir_protocol::{CommandKind, Response, Seq};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// State of a tracked command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Sent and waiting for a response.
    Pending,
    /// Waited too long; eligible for re-issue.
    TimedOut,
}

/// An outstanding command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Sequence number.
    pub seq: Seq,
    /// Command type.
    pub kind: CommandKind,
    /// Folder addressed.
    pub dir_id: DirId,
    /// Discriminant path (staged file, folder path, ...).
    pub path: String,
    /// When the command was issued.
    pub issued_at: Instant,
    /// Current state.
    pub state: CommandState,
}

/// Result of [`CommandTracker::try_issue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOutcome {
    /// A new command was recorded; send the request with this number.
    Issued(Seq),
    /// An equivalent command is still outstanding.
    InProgress(Seq),
}

impl IssueOutcome {
    /// The sequence number to send, if a new command was recorded.
    #[must_use]
    pub fn issued(self) -> Option<Seq> {
        match self {
            IssueOutcome::Issued(seq) => Some(seq),
            IssueOutcome::InProgress(_) => None,
        }
    }
}

/// Type-specific completion handlers.
///
/// Failures are never escalated: implementations record them and leave the
/// work for the next pass.
pub trait Finalizer {
    /// A SUB completed.
    fn on_sub(&mut self, command: &Command, response: &Response);
    /// An UNSUB completed.
    fn on_unsub(&mut self, command: &Command, response: &Response);
    /// A PUT completed.
    fn on_put(&mut self, command: &Command, response: &Response);
    /// A REM completed.
    fn on_rem(&mut self, command: &Command, response: &Response);
    /// A QUIT completed.
    fn on_quit(&mut self, command: &Command, response: &Response);
}

#[derive(Debug, Default)]
struct TrackerTables {
    by_seq: HashMap<Seq, Command>,
    by_path: HashMap<(CommandKind, String), Seq>,
}

/// Tracks outstanding commands for one client.
#[derive(Debug)]
pub struct CommandTracker {
    timeout: Duration,
    next_seq: AtomicU64,
    tables: RwLock<TrackerTables>,
}

impl CommandTracker {
    /// Creates a tracker timing commands out after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_seq: AtomicU64::new(1),
            tables: RwLock::new(TrackerTables::default()),
        }
    }

    /// Timeout in use.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Records a new command unless an equivalent one is still outstanding.
    pub fn try_issue(&self, kind: CommandKind, dir_id: &DirId, path: &str) -> IssueOutcome {
        self.try_issue_at(kind, dir_id, path, Instant::now())
    }

    /// [`try_issue`](Self::try_issue) with an explicit clock.
    pub fn try_issue_at(
        &self,
        kind: CommandKind,
        dir_id: &DirId,
        path: &str,
        now: Instant,
    ) -> IssueOutcome {
        let mut tables = self.tables.write();
        let key = (kind, path.to_string());

        if let Some(&seq) = tables.by_path.get(&key) {
            match tables.by_seq.get(&seq) {
                Some(command) if !self.is_expired(command, now) => {
                    return IssueOutcome::InProgress(seq);
                }
                Some(_) => {
                    // superseded; a late answer for it is ignored
                    tables.by_seq.remove(&seq);
                    debug!(seq, %kind, path, "re-issuing timed out command");
                }
                None => {}
            }
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        tables.by_seq.insert(
            seq,
            Command {
                seq,
                kind,
                dir_id: dir_id.clone(),
                path: path.to_string(),
                issued_at: now,
                state: CommandState::Pending,
            },
        );
        tables.by_path.insert(key, seq);
        IssueOutcome::Issued(seq)
    }

    /// Matches a response to its command, removes the command and runs the
    /// finalizer for its type. Returns the command, or `None` for a response
    /// nobody is waiting for.
    pub fn resolve(&self, response: &Response, finalizer: &mut impl Finalizer) -> Option<Command> {
        let command = {
            let mut tables = self.tables.write();
            let command = tables.by_seq.remove(&response.seq)?;
            let key = (command.kind, command.path.clone());
            if tables.by_path.get(&key) == Some(&command.seq) {
                tables.by_path.remove(&key);
            }
            command
        };

        if !response.is_success() {
            warn!(
                seq = command.seq,
                kind = %command.kind,
                dir_id = %command.dir_id,
                status = response.status,
                text = response.text.as_deref().unwrap_or(""),
                "command rejected"
            );
        }
        match command.kind {
            CommandKind::Sub => finalizer.on_sub(&command, response),
            CommandKind::Unsub => finalizer.on_unsub(&command, response),
            CommandKind::Put => finalizer.on_put(&command, response),
            CommandKind::Rem => finalizer.on_rem(&command, response),
            CommandKind::Quit => finalizer.on_quit(&command, response),
        }
        Some(command)
    }

    /// Marks commands older than the timeout as timed out. Returns how many
    /// changed state.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// [`sweep`](Self::sweep) with an explicit clock.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut tables = self.tables.write();
        let mut swept = 0;
        for command in tables.by_seq.values_mut() {
            if command.state == CommandState::Pending
                && now.saturating_duration_since(command.issued_at) > self.timeout
            {
                command.state = CommandState::TimedOut;
                swept += 1;
            }
        }
        swept
    }

    /// Marks every command timed out; used after a reconnect, when no
    /// response from the old connection can arrive.
    pub fn invalidate_all(&self) -> usize {
        let mut tables = self.tables.write();
        for command in tables.by_seq.values_mut() {
            command.state = CommandState::TimedOut;
        }
        tables.by_seq.len()
    }

    /// The command tracked for `(kind, path)`, timed out or not.
    #[must_use]
    pub fn outstanding(&self, kind: CommandKind, path: &str) -> Option<Command> {
        let tables = self.tables.read();
        let seq = tables.by_path.get(&(kind, path.to_string()))?;
        tables.by_seq.get(seq).cloned()
    }

    /// The command with sequence number `seq`.
    #[must_use]
    pub fn get(&self, seq: Seq) -> Option<Command> {
        self.tables.read().by_seq.get(&seq).cloned()
    }

    /// Number of tracked commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().by_seq.len()
    }

    /// Returns true if nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().by_seq.is_empty()
    }

    fn is_expired(&self, command: &Command, now: Instant) -> bool {
        command.state == CommandState::TimedOut
            || now.saturating_duration_since(command.issued_at) > self.timeout
    }
}
