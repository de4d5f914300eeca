//! Controller: one entry point per stage, plus script lifecycle.
//!
//! Every stage invocation goes through `Controller::invoke`, so recording
//! sees all mutations of the store in one place. The controller owns the
//! store exclusively; `&mut self` on every pipeline operation keeps at most
//! one of them in flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::info;

use crate::callback::{CallbackOutput, Invocation, ScriptExecutor, describe_output};
use crate::config::MergeConfig;
use crate::error::{MergeError, Result};
use crate::log::{LogSink, Severity};
use crate::script::format::unrepresentable;
use crate::script::{CancelToken, EngineMode, PlayReport, PlayStatus, ScriptCommand, ScriptEngine};
use crate::stage::{Params, StageId, StageReport, StageSet};
use crate::store::{ObserverHandle, RecordStore};

const PROGRAM: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct Controller {
    config: MergeConfig,
    store: RecordStore,
    stages: StageSet,
    engine: ScriptEngine,
    executor: Option<Box<dyn ScriptExecutor>>,
    log: Arc<dyn LogSink>,
    record_to: Option<PathBuf>,
    last_error: Option<MergeError>,
}

impl Controller {
    /// Without a presentation layer (`quiet`), failures are never logged
    /// below `Medium`.
    pub fn new(mut config: MergeConfig, log: Arc<dyn LogSink>) -> Self {
        if config.quiet {
            config.failure_severity = config.failure_severity.max(Severity::Medium);
        }
        let stages = StageSet::new(config.normalizer_path.clone());
        let mut store = RecordStore::new();
        stages.subscribe(&mut store);
        let engine = ScriptEngine::new(config.autoplay, config.failure_severity);
        Self {
            config,
            store,
            stages,
            engine,
            executor: None,
            log,
            record_to: None,
            last_error: None,
        }
    }

    /// Register the host's handler for custom script commands.
    pub fn with_executor(mut self, executor: Box<dyn ScriptExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn set_executor(&mut self, executor: Option<Box<dyn ScriptExecutor>>) {
        self.executor = executor;
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn set_normalizer_path(&mut self, path: Option<PathBuf>) {
        self.stages.set_normalizer_path(path.as_deref());
        self.config.normalizer_path = path;
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn engine(&self) -> &ScriptEngine {
        &self.engine
    }

    pub fn mode(&self) -> EngineMode {
        self.engine.mode()
    }

    /// Whether a record set is currently loaded.
    pub fn is_loaded(&self) -> bool {
        self.store.is_loaded()
    }

    /// Register a host view for the store's "list changed" signal.
    pub fn subscribe(&mut self, observer: &ObserverHandle) {
        self.store.subscribe(observer);
    }

    /// The most recent error of a stage invocation or playback.
    pub fn last_error(&self) -> Option<&MergeError> {
        self.last_error.as_ref()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.engine.cancel_token()
    }

    pub fn input(&mut self, params: &Params) -> Result<StageReport> {
        self.invoke(StageId::Input, "open", params)
    }

    pub fn filter(&mut self, params: &Params) -> Result<StageReport> {
        self.invoke(StageId::Filter, "apply", params)
    }

    pub fn sort(&mut self, params: &Params) -> Result<StageReport> {
        self.invoke(StageId::Sort, "apply", params)
    }

    pub fn template(&mut self, params: &Params) -> Result<StageReport> {
        self.invoke(StageId::Template, "merge", params)
    }

    pub fn output(&mut self, params: &Params) -> Result<StageReport> {
        self.invoke(StageId::Output, "write", params)
    }

    /// Run a host-defined command through the registered executor.
    pub fn call_custom(
        &mut self,
        command: &str,
        operation: &str,
        params: &Params,
    ) -> Result<StageReport> {
        self.invoke(StageId::Custom(command.to_string()), operation, params)
    }

    /// Configure and apply one stage, recording it when recording is on.
    ///
    /// A command that could not be written back into a script file is
    /// refused before it runs.
    pub fn invoke(
        &mut self,
        target: StageId,
        operation: &str,
        params: &Params,
    ) -> Result<StageReport> {
        let outcome = match (&target, unrepresentable(&target, operation, params)) {
            (_, Some((part, reason))) => Err(MergeError::config(target.name(), &part, reason)),
            (StageId::Custom(name), None) => self.invoke_custom(name, operation, params),
            (id, None) => self.stages.run(id, operation, params, &mut self.store),
        };
        let outcome = outcome.and_then(|(report, snapshot)| {
            self.log
                .record(Severity::Normal, &report.to_string(), false);
            if target == StageId::Input {
                self.log_loaded_records();
            }
            let operation = if target.is_builtin() {
                operation.to_ascii_lowercase()
            } else {
                operation.to_string()
            };
            let command = ScriptCommand::new(target.clone(), operation, snapshot);
            if let Some(seq) = self.engine.record(command)? {
                info!(seq, "command recorded");
            }
            Ok(report)
        });
        outcome.inspect_err(|err| {
            self.log.record(
                self.config.failure_severity,
                &format!("{target} {operation} failed: {err}"),
                true,
            );
            self.last_error = Some(err.clone());
        })
    }

    fn invoke_custom(
        &mut self,
        name: &str,
        operation: &str,
        params: &Params,
    ) -> Result<(StageReport, Params)> {
        let Some(executor) = self.executor.as_mut() else {
            return Err(MergeError::UnhandledCommand {
                command: name.to_string(),
            });
        };
        let output: CallbackOutput = executor
            .invoke(&Invocation {
                command: name,
                operation,
                params,
            })
            .map_err(|cause| MergeError::execution(name, None, cause))?;
        let size = self.store.size();
        let mut report = StageReport::new(StageId::Custom(name.to_string()), size, size);
        if !output.is_empty() {
            report = report.with_detail(describe_output(&output));
        }
        Ok((report, params.clone()))
    }

    fn log_loaded_records(&self) {
        if !self.log.log_all_data() {
            return;
        }
        for (i, record) in self.store.iter().enumerate() {
            let values = record
                .iter()
                .map(|(field, value)| format!("{}={value}", field.name))
                .collect::<Vec<_>>()
                .join(", ");
            self.log
                .record(Severity::Minor, &format!("Record {}: {values}", i + 1), false);
        }
    }

    /// Start recording. With `destination`, the script is saved there when
    /// recording stops or the controller shuts down.
    pub fn start_recording(&mut self, destination: Option<PathBuf>) -> Result<()> {
        self.engine.start_recording()?;
        self.record_to = destination;
        self.log.record(Severity::Normal, "Recording started", false);
        Ok(())
    }

    pub fn stop_recording(&mut self) -> Result<()> {
        self.engine.stop_recording()?;
        self.flush_recording()
    }

    fn flush_recording(&mut self) -> Result<()> {
        let Some(destination) = self.record_to.clone() else {
            return Ok(());
        };
        if !self.engine.is_dirty() {
            return Ok(());
        }
        let path = self.config.resolve(&destination);
        self.engine.save(&path).inspect_err(|e| {
            self.last_error = Some(e.clone());
        })?;
        self.log.record(
            Severity::Normal,
            &format!("Recorded script saved to {}", path.display()),
            false,
        );
        Ok(())
    }

    pub fn save_script(&mut self, path: &Path) -> Result<()> {
        let path = self.config.resolve(path);
        self.engine.save(&path)
    }

    /// Load a script without running it. A path that does not name a file
    /// is retried against the normalizer path.
    pub fn load_script(&mut self, path: &Path) -> Result<()> {
        let Some(resolved) = self.resolve_script(path) else {
            let err = MergeError::SourceNotFound {
                path: path.to_path_buf(),
            };
            self.last_error = Some(err.clone());
            return Err(err);
        };
        self.load_resolved(&resolved)
    }

    fn load_resolved(&mut self, path: &Path) -> Result<()> {
        self.engine.load(path).inspect_err(|e| {
            self.log.record(
                self.config.failure_severity,
                &format!("{} could not be loaded: {e}", path.display()),
                true,
            );
            self.last_error = Some(e.clone());
        })
    }

    fn resolve_script(&self, path: &Path) -> Option<PathBuf> {
        let mut candidates = vec![path.to_path_buf()];
        if path.is_relative()
            && let Some(base) = &self.config.normalizer_path
        {
            candidates.push(base.join(path));
        }
        for candidate in candidates {
            if candidate.is_file() {
                return Some(candidate);
            }
            self.log.record(
                Severity::Medium,
                &format!(
                    "{} could not be opened as a valid Script File",
                    candidate.display()
                ),
                true,
            );
        }
        None
    }

    /// Play the current script from the start.
    pub fn play(&mut self) -> Result<PlayReport> {
        let result = self.engine.play(
            &mut self.stages,
            &mut self.store,
            self.executor.as_deref_mut(),
            self.log.as_ref(),
        );
        self.note_outcome(result)
    }

    /// Resume a playback paused before a held command.
    pub fn continue_play(&mut self) -> Result<PlayReport> {
        let result = self.engine.continue_play(
            &mut self.stages,
            &mut self.store,
            self.executor.as_deref_mut(),
            self.log.as_ref(),
        );
        self.note_outcome(result)
    }

    /// Abandon a paused playback.
    pub fn abort_play(&mut self) -> bool {
        self.engine.abort()
    }

    /// Load a script and play it.
    pub fn load_and_play(&mut self, path: &Path) -> Result<PlayReport> {
        self.load_script(path)?;
        self.play()
    }

    fn note_outcome(&mut self, result: Result<PlayReport>) -> Result<PlayReport> {
        match &result {
            Ok(report) => match &report.status {
                PlayStatus::Halted { cause, .. } => self.last_error = Some(cause.clone()),
                PlayStatus::Cancelled { completed } => {
                    self.last_error = Some(MergeError::Cancelled {
                        completed: *completed,
                    })
                }
                PlayStatus::Completed | PlayStatus::Paused { .. } => {
                    if let Some((_, err)) = report.failures.last() {
                        self.last_error = Some(err.clone());
                    }
                }
            },
            Err(err) => self.last_error = Some(err.clone()),
        }
        result
    }

    /// Startup hook: play the configured starting script, or a loaded
    /// script flagged for autoplay when the host allows it.
    ///
    /// A starting script replaces whatever was loaded, so the autoplay check
    /// is skipped after it; the script plays once.
    pub fn start(&mut self) -> Result<Option<PlayReport>> {
        if let Some(path) = self.config.starting_script.clone() {
            let Some(resolved) = self.resolve_script(&path) else {
                return Ok(None);
            };
            self.load_resolved(&resolved)?;
            return self.play().map(Some);
        }
        let script = self.engine.script();
        if self.config.autoplay && script.autoplay && !script.is_empty() {
            return self.play().map(Some);
        }
        Ok(None)
    }

    /// Shutdown hook: drop a paused playback, stop recording and flush the
    /// recorded script.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.engine.abort() {
            self.log
                .record(Severity::Normal, "Paused playback abandoned", false);
        }
        self.stop_recording()
    }
}

/// Load the script at `path` and play it without a presentation layer.
pub fn run_script(path: impl AsRef<Path>, log: Arc<dyn LogSink>) -> Result<PlayReport> {
    run_script_with_config(MergeConfig::headless(), path.as_ref(), log, None)
}

/// As `run_script`, routing custom commands to `executor`.
pub fn run_script_with(
    path: impl AsRef<Path>,
    log: Arc<dyn LogSink>,
    executor: Box<dyn ScriptExecutor>,
) -> Result<PlayReport> {
    run_script_with_config(MergeConfig::headless(), path.as_ref(), log, Some(executor))
}

/// Headless run with an explicit configuration. The run is quiet, so
/// failures are logged at `Medium` or above whatever `config` says.
///
/// A playback that pauses before a held command is abandoned, since nobody
/// is there to continue it; the returned report says where it stopped.
pub fn run_script_with_config(
    mut config: MergeConfig,
    path: &Path,
    log: Arc<dyn LogSink>,
    executor: Option<Box<dyn ScriptExecutor>>,
) -> Result<PlayReport> {
    config.quiet = true;
    config.failure_severity = config.failure_severity.max(Severity::Medium);
    let severity = if executor.is_some() {
        Severity::Medium
    } else {
        Severity::Normal
    };
    log.record(
        severity,
        &format!("{PROGRAM} {VERSION} invoked by another program"),
        false,
    );

    let failure_severity = config.failure_severity;
    let mut controller = Controller::new(config, log.clone());
    controller.set_executor(executor);
    let report = controller.load_and_play(path)?;
    if let PlayStatus::Paused { next } = report.status {
        controller.abort_play();
        log.record(
            failure_severity,
            &format!("Playback stopped before held command {}; nobody to continue", next + 1),
            true,
        );
    }
    report.into_result()
}
