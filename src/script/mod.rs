//! Scripts: ordered, replayable logs of stage invocations.
//!
//! A script file looks like this:
//! ```text
//! # Monthly letters
//! SCRIPT AUTOPLAY
//! 1 INPUT open path="people.tab" delimiter="tab"
//! 2 FILTER apply expr="dept = 'SALES'"
//! 3 HOLD SORT apply keys="last asc, first desc"
//! 4 NOTIFY call channel="ops"
//! ```
//!
//! - `SCRIPT` (optionally `SCRIPT AUTOPLAY`) is an optional first directive
//! - every command line starts with its sequence number
//! - `HOLD` keeps a command from running during autoplay
//! - identifiers other than the five built-in stages go to the host's
//!   `ScriptExecutor`
//! - lines starting with `#` are comments

pub mod engine;
pub mod format;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{MergeError, Result};
use crate::stage::{Params, StageId};

pub use engine::{PlayReport, PlayStatus, ScriptEngine};
pub use format::{parse_script, render_script};

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptCommand {
    /// Position in the script; strictly increasing.
    pub seq: u32,
    pub target: StageId,
    pub operation: String,
    pub params: Params,
    /// Whether autoplay may run this command without a human present.
    pub eligible: bool,
}

impl ScriptCommand {
    pub fn new(target: StageId, operation: impl Into<String>, params: Params) -> Self {
        Self {
            seq: 0,
            target,
            operation: operation.into(),
            params,
            eligible: true,
        }
    }

    /// Mark the command as needing a human during autoplay.
    pub fn held(mut self) -> Self {
        self.eligible = false;
        self
    }
}

impl fmt::Display for ScriptCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} {}", self.seq, self.target, self.operation)
    }
}

/// An ordered list of commands plus script-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    commands: Vec<ScriptCommand>,
    /// Play this script on startup when the host allows autoplay.
    pub autoplay: bool,
    /// File the script was loaded from or last saved to.
    pub source: Option<PathBuf>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[ScriptCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ScriptCommand> {
        self.commands.get(index)
    }

    /// Sequence number the next appended command receives, or `None` once
    /// the last command holds `u32::MAX`.
    pub fn next_seq(&self) -> Option<u32> {
        self.commands.last().map_or(Some(1), |c| c.seq.checked_add(1))
    }

    /// Append a command, assigning it the next sequence number.
    pub fn push(&mut self, mut command: ScriptCommand) -> Result<u32> {
        let Some(seq) = self.next_seq() else {
            return Err(MergeError::ScriptFormat {
                line: 0,
                reason: format!("no sequence number follows {}", u32::MAX),
            });
        };
        command.seq = seq;
        self.commands.push(command);
        Ok(seq)
    }

    /// Append a command keeping its own sequence number. Fails when the
    /// number does not increase.
    pub(crate) fn push_numbered(
        &mut self,
        command: ScriptCommand,
    ) -> std::result::Result<(), String> {
        if let Some(last) = self.commands.last()
            && command.seq <= last.seq
        {
            return Err(format!(
                "sequence {} does not follow {}",
                command.seq, last.seq
            ));
        }
        if command.seq == 0 {
            return Err("sequence numbers start at 1".to_string());
        }
        self.commands.push(command);
        Ok(())
    }

    /// A copy holding only the first `n` commands.
    pub fn truncated(&self, n: usize) -> Script {
        Script {
            commands: self.commands.iter().take(n).cloned().collect(),
            autoplay: self.autoplay,
            source: self.source.clone(),
        }
    }

    /// Same commands and flags, ignoring where the script lives on disk.
    pub fn same_content(&self, other: &Script) -> bool {
        self.commands == other.commands && self.autoplay == other.autoplay
    }
}

/// What the script engine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineMode {
    #[default]
    Idle,
    Recording,
    Playing,
}

impl fmt::Display for EngineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineMode::Idle => "idle",
            EngineMode::Recording => "recording",
            EngineMode::Playing => "playing",
        })
    }
}

/// Cancellation flag for a playback, checked between commands.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::params;

    #[test]
    fn test_push_assigns_increasing_seq() {
        let mut script = Script::new();
        assert_eq!(script.next_seq(), Some(1));
        script
            .push(ScriptCommand::new(StageId::Input, "open", params([("path", "a")])))
            .unwrap();
        let seq = script
            .push(ScriptCommand::new(StageId::Sort, "apply", Params::new()).held())
            .unwrap();
        assert_eq!(seq, 2);
        assert!(!script.get(1).unwrap().eligible);
    }

    #[test]
    fn test_push_numbered_rejects_non_increasing() {
        let mut script = Script::new();
        let mut cmd = ScriptCommand::new(StageId::Input, "open", Params::new());
        cmd.seq = 5;
        script.push_numbered(cmd.clone()).unwrap();
        assert!(script.push_numbered(cmd.clone()).is_err());
        cmd.seq = 9;
        script.push_numbered(cmd).unwrap();
        assert_eq!(script.next_seq(), Some(10));
    }

    #[test]
    fn test_push_after_last_sequence_number() {
        let mut script = Script::new();
        let mut cmd = ScriptCommand::new(StageId::Sort, "apply", Params::new());
        cmd.seq = u32::MAX - 1;
        script.push_numbered(cmd.clone()).unwrap();
        assert_eq!(script.push(cmd.clone()).unwrap(), u32::MAX);
        assert_eq!(script.next_seq(), None);
        assert!(matches!(
            script.push(cmd),
            Err(MergeError::ScriptFormat { line: 0, .. })
        ));
        assert_eq!(script.len(), 2);
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(EngineMode::Recording.to_string(), "recording");
    }
}
