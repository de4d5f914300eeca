//! Record/replay state machine.
//!
//! ```text
//! Idle --start_recording--> Recording --stop_recording--> Idle
//! Idle --play--> Playing --(end | halt | cancel | abort)--> Idle
//! ```
//!
//! A playback paused before a `HOLD` command stays in `Playing` until
//! `continue_play` or `abort`.

use std::path::Path;

use tracing::debug;

use crate::callback::{Invocation, ScriptExecutor, describe_output};
use crate::error::{MergeError, Result};
use crate::log::{LogSink, Severity};
use crate::script::{CancelToken, EngineMode, Script, ScriptCommand};
use crate::stage::{StageId, StageSet};
use crate::store::RecordStore;

/// How a call to `play` or `continue_play` ended.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayStatus {
    /// Every command ran.
    Completed,
    /// Autoplay stopped before the command at index `next`, which is held.
    Paused { next: usize },
    /// A fatal error at index `position` ended the playback.
    Halted { position: usize, cause: MergeError },
    /// Cancelled after `completed` commands.
    Cancelled { completed: usize },
}

/// Outcome of one `play`/`continue_play` call.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayReport {
    pub status: PlayStatus,
    /// Commands dispatched by this call, failed ones included.
    pub executed: usize,
    /// Commands that failed and were skipped, by sequence number.
    pub failures: Vec<(u32, MergeError)>,
}

impl PlayReport {
    fn new() -> Self {
        Self {
            status: PlayStatus::Completed,
            executed: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.status, PlayStatus::Paused { .. })
    }

    /// `Err` for a halted or cancelled playback.
    pub fn into_result(self) -> Result<PlayReport> {
        match &self.status {
            PlayStatus::Halted { cause, .. } => Err(cause.clone()),
            PlayStatus::Cancelled { completed } => Err(MergeError::Cancelled {
                completed: *completed,
            }),
            PlayStatus::Completed | PlayStatus::Paused { .. } => Ok(self),
        }
    }
}

/// Records stage invocations into a script and plays scripts back.
#[derive(Debug)]
pub struct ScriptEngine {
    mode: EngineMode,
    script: Script,
    cursor: usize,
    autoplay: bool,
    failure_severity: Severity,
    cancel: CancelToken,
    dirty: bool,
}

impl ScriptEngine {
    /// With autoplay on, failures are never logged below `Medium`.
    pub fn new(autoplay: bool, failure_severity: Severity) -> Self {
        let failure_severity = if autoplay {
            failure_severity.max(Severity::Medium)
        } else {
            failure_severity
        };
        Self {
            mode: EngineMode::Idle,
            script: Script::new(),
            cursor: 0,
            autoplay,
            failure_severity,
            cancel: CancelToken::new(),
            dirty: false,
        }
    }

    pub fn mode(&self) -> EngineMode {
        self.mode
    }

    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Whether the host lets playback run held-free stretches unattended.
    pub fn autoplay(&self) -> bool {
        self.autoplay
    }

    /// Whether recorded commands have not been saved yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn require_idle(&self, requested: EngineMode) -> Result<()> {
        match self.mode {
            EngineMode::Idle => Ok(()),
            active => Err(MergeError::ConflictingMode { active, requested }),
        }
    }

    /// Start a fresh recording, discarding the current script.
    pub fn start_recording(&mut self) -> Result<()> {
        self.require_idle(EngineMode::Recording)?;
        self.script = Script::new();
        self.cursor = 0;
        self.dirty = false;
        self.mode = EngineMode::Recording;
        debug!("recording started");
        Ok(())
    }

    /// Stop recording. Stopping while idle does nothing.
    pub fn stop_recording(&mut self) -> Result<()> {
        match self.mode {
            EngineMode::Recording => {
                self.mode = EngineMode::Idle;
                debug!(commands = self.script.len(), "recording stopped");
                Ok(())
            }
            EngineMode::Idle => Ok(()),
            EngineMode::Playing => Err(MergeError::ConflictingMode {
                active: EngineMode::Playing,
                requested: EngineMode::Idle,
            }),
        }
    }

    /// Append a command while recording. Returns its sequence number, or
    /// `None` when not recording.
    pub fn record(&mut self, command: ScriptCommand) -> Result<Option<u32>> {
        if self.mode != EngineMode::Recording {
            return Ok(None);
        }
        let seq = self.script.push(command)?;
        self.dirty = true;
        Ok(Some(seq))
    }

    /// Replace the current script. Never executes anything.
    pub fn set_script(&mut self, script: Script) -> Result<()> {
        self.require_idle(EngineMode::Playing)?;
        self.script = script;
        self.cursor = 0;
        self.dirty = false;
        Ok(())
    }

    /// Load the script at `path`. Never executes anything.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        self.require_idle(EngineMode::Playing)?;
        let script = Script::load(path)?;
        debug!(path = %path.display(), commands = script.len(), "script loaded");
        self.set_script(script)
    }

    /// Save the current script to `path`.
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.script.save(path)?;
        self.script.source = Some(path.to_path_buf());
        self.dirty = false;
        Ok(())
    }

    /// Play the current script from its first command.
    pub fn play<'e>(
        &mut self,
        stages: &mut StageSet,
        store: &mut RecordStore,
        executor: Option<&mut (dyn ScriptExecutor + 'e)>,
        log: &dyn LogSink,
    ) -> Result<PlayReport> {
        self.require_idle(EngineMode::Playing)?;
        self.mode = EngineMode::Playing;
        self.cursor = 0;
        self.cancel.reset();
        let name = self
            .script
            .source
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recorded script".to_string());
        log.record(
            Severity::Normal,
            &format!("Playing {name} ({} command(s))", self.script.len()),
            false,
        );
        Ok(self.run(stages, store, executor, log, false))
    }

    /// Resume a paused playback, running the held command it stopped at.
    pub fn continue_play<'e>(
        &mut self,
        stages: &mut StageSet,
        store: &mut RecordStore,
        executor: Option<&mut (dyn ScriptExecutor + 'e)>,
        log: &dyn LogSink,
    ) -> Result<PlayReport> {
        if self.mode != EngineMode::Playing {
            return Err(MergeError::ConflictingMode {
                active: self.mode,
                requested: EngineMode::Playing,
            });
        }
        Ok(self.run(stages, store, executor, log, true))
    }

    /// Drop a paused playback. Returns whether one was active.
    pub fn abort(&mut self) -> bool {
        let was_playing = self.mode == EngineMode::Playing;
        self.finish();
        was_playing
    }

    fn finish(&mut self) {
        self.mode = EngineMode::Idle;
        self.cursor = 0;
    }

    fn run<'e>(
        &mut self,
        stages: &mut StageSet,
        store: &mut RecordStore,
        mut executor: Option<&mut (dyn ScriptExecutor + 'e)>,
        log: &dyn LogSink,
        mut resume_past_hold: bool,
    ) -> PlayReport {
        let mut report = PlayReport::new();

        while let Some(command) = self.script.get(self.cursor).cloned() {
            if self.cancel.is_cancelled() {
                let completed = self.cursor;
                log.record(
                    self.failure_severity,
                    &format!("Script cancelled after {completed} command(s)"),
                    true,
                );
                self.finish();
                report.status = PlayStatus::Cancelled { completed };
                return report;
            }

            if self.autoplay && !command.eligible && !resume_past_hold {
                log.record(
                    Severity::Normal,
                    &format!("Autoplay paused before command {command}; waiting to continue"),
                    false,
                );
                report.status = PlayStatus::Paused { next: self.cursor };
                return report;
            }
            resume_past_hold = false;

            let outcome = execute(&command, stages, store, executor.as_deref_mut());
            report.executed += 1;
            match outcome {
                Ok(detail) => {
                    log.record(Severity::Minor, &format!("Command {command}: {detail}"), false);
                }
                Err(err) if command.target == StageId::Input && err.is_fatal_to_playback() => {
                    log.record(
                        Severity::Major,
                        &format!("Command {command} failed, playback halted: {err}"),
                        true,
                    );
                    let position = self.cursor;
                    self.finish();
                    report.status = PlayStatus::Halted {
                        position,
                        cause: err,
                    };
                    return report;
                }
                Err(err) => {
                    log.record(
                        self.failure_severity,
                        &format!("Command {command} failed: {err}"),
                        true,
                    );
                    report.failures.push((command.seq, err));
                }
            }
            self.cursor += 1;
        }

        log.record(
            Severity::Normal,
            &format!(
                "Script finished: {} command(s), {} failure(s)",
                self.cursor,
                report.failures.len()
            ),
            false,
        );
        self.finish();
        report
    }
}

/// Dispatch one command to its stage or to the host executor.
fn execute<'e>(
    command: &ScriptCommand,
    stages: &mut StageSet,
    store: &mut RecordStore,
    executor: Option<&mut (dyn ScriptExecutor + 'e)>,
) -> Result<String> {
    match &command.target {
        StageId::Custom(name) => {
            let Some(executor) = executor else {
                return Err(MergeError::UnhandledCommand {
                    command: name.clone(),
                });
            };
            let call = Invocation {
                command: name,
                operation: &command.operation,
                params: &command.params,
            };
            let output = executor
                .invoke(&call)
                .map_err(|cause| MergeError::execution(name, None, cause))?;
            Ok(if output.is_empty() {
                "handled by host".to_string()
            } else {
                format!("handled by host ({})", describe_output(&output))
            })
        }
        id => {
            let (report, _) = stages.run(id, &command.operation, &command.params, store)?;
            Ok(report.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{CallbackOutput, RecordingExecutor};
    use crate::log::MemorySink;
    use crate::script::parse_script;
    use crate::stage::{Params, params};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    fn workspace() -> TempDir {
        let dir = tempdir().unwrap();
        let fixture = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs/people.tab");
        fs::copy(fixture, dir.path().join("people.tab")).unwrap();
        dir
    }

    fn column(store: &RecordStore, field: &str) -> Vec<String> {
        store
            .iter()
            .map(|r| r.get(field).unwrap_or("").to_string())
            .collect()
    }

    struct Rig {
        dir: TempDir,
        stages: StageSet,
        store: RecordStore,
        log: MemorySink,
    }

    impl Rig {
        fn new() -> Self {
            let dir = workspace();
            let stages = StageSet::new(Some(dir.path().to_path_buf()));
            let mut store = RecordStore::new();
            stages.subscribe(&mut store);
            Self {
                dir,
                stages,
                store,
                log: MemorySink::new(Severity::Minor),
            }
        }

        fn play(&mut self, engine: &mut ScriptEngine) -> PlayReport {
            engine
                .play(&mut self.stages, &mut self.store, None, &self.log)
                .unwrap()
        }
    }

    fn engine_with(text: &str, autoplay: bool) -> ScriptEngine {
        let mut engine = ScriptEngine::new(autoplay, Severity::Medium);
        engine.set_script(parse_script(text).unwrap()).unwrap();
        engine
    }

    #[test]
    fn test_recording_and_playing_are_exclusive() {
        let mut rig = Rig::new();
        let mut engine = engine_with("1 HOLD INPUT open path=\"people.tab\"\n", true);
        assert!(rig.play(&mut engine).is_paused());
        assert_eq!(engine.mode(), EngineMode::Playing);
        assert_eq!(
            engine.start_recording().unwrap_err(),
            MergeError::ConflictingMode {
                active: EngineMode::Playing,
                requested: EngineMode::Recording,
            }
        );
        assert_eq!(
            engine.stop_recording().unwrap_err().to_string(),
            "cannot stop recording while playing"
        );
        assert!(engine.abort());

        engine.start_recording().unwrap();
        let err = engine
            .play(&mut rig.stages, &mut rig.store, None, &rig.log)
            .unwrap_err();
        assert!(matches!(err, MergeError::ConflictingMode { .. }));
        assert!(engine.load(Path::new("x.script")).is_err());
    }

    #[test]
    fn test_record_only_while_recording() {
        let mut engine = ScriptEngine::new(false, Severity::Medium);
        let command = ScriptCommand::new(StageId::Sort, "apply", params([("keys", "last")]));
        assert_eq!(engine.record(command.clone()), Ok(None));
        engine.start_recording().unwrap();
        assert_eq!(engine.record(command.clone()), Ok(Some(1)));
        assert_eq!(engine.record(command), Ok(Some(2)));
        assert!(engine.is_dirty());
        engine.stop_recording().unwrap();
        assert_eq!(engine.mode(), EngineMode::Idle);
        assert_eq!(engine.script().len(), 2);
    }

    #[test]
    fn test_fully_eligible_script_runs_unattended() {
        let mut rig = Rig::new();
        let text = fs::read_to_string(
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("specs/sales_letters.script"),
        )
        .unwrap();
        let mut engine = engine_with(&text, true);
        let report = rig.play(&mut engine);
        assert_eq!(report.status, PlayStatus::Completed);
        assert_eq!(report.executed, 5);
        assert!(report.failures.is_empty());
        assert_eq!(engine.mode(), EngineMode::Idle);

        let letters = fs::read_to_string(rig.dir.path().join("sales_letters.txt")).unwrap();
        assert_eq!(
            letters,
            "Dear Fred Baker,\nyour salary is 52000.\n\
             Dear Jane Doe,\nyour salary is 52000.\n\
             Dear Carl Brown,\nyour salary is 48000.\n"
        );
    }

    #[test]
    fn test_autoplay_halts_before_each_held_command() {
        for held in 0..4 {
            let mut rig = Rig::new();
            let commands = [
                ScriptCommand::new(StageId::Input, "open", params([("path", "people.tab")])),
                ScriptCommand::new(StageId::Filter, "apply", params([("expr", "dept != support")])),
                ScriptCommand::new(StageId::Sort, "apply", params([("keys", "last")])),
                ScriptCommand::new(StageId::Output, "write", params([("path", "out.tab")])),
            ];
            let mut held_script = Script::new();
            for (i, command) in commands.into_iter().enumerate() {
                let command = if i == held { command.held() } else { command };
                held_script.push(command).unwrap();
            }

            let mut engine = ScriptEngine::new(true, Severity::Medium);
            engine.set_script(held_script).unwrap();
            let report = rig.play(&mut engine);
            assert_eq!(report.status, PlayStatus::Paused { next: held });
            assert_eq!(report.executed, held);

            let report = engine
                .continue_play(&mut rig.stages, &mut rig.store, None, &rig.log)
                .unwrap();
            assert_eq!(report.status, PlayStatus::Completed);
            assert_eq!(report.executed, 4 - held);
            assert!(rig.dir.path().join("out.tab").is_file());
        }
    }

    #[test]
    fn test_held_commands_run_when_autoplay_is_off() {
        let mut rig = Rig::new();
        let mut engine = engine_with(
            "1 INPUT open path=\"people.tab\"\n2 HOLD SORT apply keys=\"last\"\n",
            false,
        );
        let report = rig.play(&mut engine);
        assert_eq!(report.status, PlayStatus::Completed);
        assert_eq!(column(&rig.store, "last")[0], "Avery");
    }

    #[test]
    fn test_failures_are_logged_and_skipped() {
        let mut rig = Rig::new();
        let mut engine = engine_with(
            "1 INPUT open path=\"people.tab\"\n\
             2 SORT apply keys=\"nosuch\"\n\
             3 NOTIFY call\n\
             4 FILTER apply expr=\"dept = sales\"\n",
            true,
        );
        let report = rig.play(&mut engine);
        assert_eq!(report.status, PlayStatus::Completed);
        assert_eq!(report.executed, 4);
        let failed: Vec<_> = report.failures.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(failed, vec![2, 3]);
        assert_eq!(
            report.failures[1].1,
            MergeError::UnhandledCommand {
                command: "NOTIFY".to_string()
            }
        );
        assert_eq!(rig.store.size(), 3);
        let errors = rig.log.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.severity == Severity::Medium));
    }

    #[test]
    fn test_autoplay_failures_logged_at_least_medium() {
        let text = "1 INPUT open path=\"people.tab\"\n2 SORT apply keys=\"nosuch\"\n";
        for (autoplay, logged) in [(true, Severity::Medium), (false, Severity::Minor)] {
            let mut rig = Rig::new();
            let mut engine = ScriptEngine::new(autoplay, Severity::Minor);
            engine.set_script(parse_script(text).unwrap()).unwrap();
            let report = rig.play(&mut engine);
            assert_eq!(report.failures.len(), 1);
            let errors = rig.log.errors();
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].severity, logged);
        }
    }

    #[test]
    fn test_missing_input_source_halts() {
        let mut rig = Rig::new();
        let mut engine = engine_with(
            "1 INPUT open path=\"missing.tab\"\n2 OUTPUT write path=\"out.tab\"\n",
            true,
        );
        let report = rig.play(&mut engine);
        match &report.status {
            PlayStatus::Halted { position, cause } => {
                assert_eq!(*position, 0);
                assert!(matches!(cause, MergeError::SourceNotFound { .. }));
            }
            other => panic!("Expected Halted, got {other:?}"),
        }
        assert_eq!(report.executed, 1);
        assert!(!rig.dir.path().join("out.tab").exists());
        assert!(report.into_result().is_err());
        assert_eq!(engine.mode(), EngineMode::Idle);
    }

    #[test]
    fn test_cancel_matches_truncated_script() {
        let text = "1 INPUT open path=\"people.tab\"\n\
                    2 FILTER apply expr=\"dept = sales\"\n\
                    3 STOPPER call\n\
                    4 SORT apply keys=\"last\"\n\
                    5 OUTPUT write path=\"out.tab\"\n";

        let mut rig = Rig::new();
        let mut engine = engine_with(text, true);
        let token = engine.cancel_token();
        let mut stopper = |_: &Invocation<'_>| -> std::result::Result<CallbackOutput, String> {
            token.cancel();
            Ok(CallbackOutput::new())
        };
        let report = engine
            .play(&mut rig.stages, &mut rig.store, Some(&mut stopper), &rig.log)
            .unwrap();
        assert_eq!(report.status, PlayStatus::Cancelled { completed: 3 });
        assert_eq!(
            report.clone().into_result().unwrap_err(),
            MergeError::Cancelled { completed: 3 }
        );
        assert!(!rig.dir.path().join("out.tab").exists());

        let mut truncated_rig = Rig::new();
        let mut truncated = ScriptEngine::new(true, Severity::Medium);
        truncated
            .set_script(parse_script(text).unwrap().truncated(3))
            .unwrap();
        let mut executor = RecordingExecutor::default();
        let report = truncated
            .play(
                &mut truncated_rig.stages,
                &mut truncated_rig.store,
                Some(&mut executor),
                &truncated_rig.log,
            )
            .unwrap();
        assert_eq!(report.status, PlayStatus::Completed);
        assert_eq!(column(&rig.store, "last"), column(&truncated_rig.store, "last"));
        assert_eq!(rig.store.schema(), truncated_rig.store.schema());
    }

    #[test]
    fn test_cancel_while_paused() {
        let mut rig = Rig::new();
        let mut engine = engine_with(
            "1 INPUT open path=\"people.tab\"\n2 HOLD FILTER apply expr=\"dept = sales\"\n",
            true,
        );
        assert!(rig.play(&mut engine).is_paused());
        engine.cancel_token().cancel();
        let report = engine
            .continue_play(&mut rig.stages, &mut rig.store, None, &rig.log)
            .unwrap();
        assert_eq!(report.status, PlayStatus::Cancelled { completed: 1 });
        assert_eq!(rig.store.size(), 6);
        assert_eq!(engine.mode(), EngineMode::Idle);
    }

    #[test]
    fn test_executor_receives_custom_commands() {
        let mut rig = Rig::new();
        let mut engine = engine_with("1 NOTIFY send channel=\"ops\"\n", true);
        let mut executor = RecordingExecutor::default();
        let report = engine
            .play(&mut rig.stages, &mut rig.store, Some(&mut executor), &rig.log)
            .unwrap();
        assert!(report.failures.is_empty());
        let expected: Params = params([("channel", "ops")]);
        assert_eq!(
            executor.calls,
            vec![("NOTIFY".to_string(), "send".to_string(), expected)]
        );
    }

    #[test]
    fn test_continue_without_pause_is_conflict() {
        let mut rig = Rig::new();
        let mut engine = ScriptEngine::new(true, Severity::Medium);
        assert!(
            engine
                .continue_play(&mut rig.stages, &mut rig.store, None, &rig.log)
                .is_err()
        );
    }

    #[test]
    fn test_save_clears_dirty() {
        let dir = tempdir().unwrap();
        let mut engine = ScriptEngine::new(false, Severity::Medium);
        engine.start_recording().unwrap();
        engine
            .record(ScriptCommand::new(StageId::Sort, "apply", params([("keys", "a")])))
            .unwrap();
        engine.stop_recording().unwrap();
        let path = dir.path().join("rec.script");
        engine.save(&path).unwrap();
        assert!(!engine.is_dirty());
        assert_eq!(engine.script().source.as_deref(), Some(path.as_path()));

        let mut other = ScriptEngine::new(false, Severity::Medium);
        other.load(&path).unwrap();
        assert!(other.script().same_content(engine.script()));
        assert_eq!(other.mode(), EngineMode::Idle);
    }
}
