//! Run configuration for a controller.

use std::path::{Path, PathBuf};

use crate::log::Severity;

/// Settings that stay fixed for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    /// Base directory for relative source, template and output paths.
    pub normalizer_path: Option<PathBuf>,
    /// Whether eligible scripts may play without a human confirming.
    pub autoplay: bool,
    /// Severity at which failed script commands are logged.
    pub failure_severity: Severity,
    /// No presentation layer is attached.
    pub quiet: bool,
    /// Script played by `Controller::start`.
    pub starting_script: Option<PathBuf>,
}

impl MergeConfig {
    /// Defaults for a human-driven session: autoplay disabled.
    pub fn interactive() -> Self {
        Self {
            normalizer_path: None,
            autoplay: false,
            failure_severity: Severity::Medium,
            quiet: false,
            starting_script: None,
        }
    }

    /// Defaults for a programmatic run: autoplay enabled, no presentation.
    pub fn headless() -> Self {
        Self {
            autoplay: true,
            quiet: true,
            ..Self::interactive()
        }
    }

    pub fn with_normalizer_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.normalizer_path = Some(path.into());
        self
    }

    pub fn with_autoplay(mut self, autoplay: bool) -> Self {
        self.autoplay = autoplay;
        self
    }

    /// Failures in headless runs are never logged below `Medium`.
    pub fn with_failure_severity(mut self, severity: Severity) -> Self {
        self.failure_severity = if self.quiet {
            severity.max(Severity::Medium)
        } else {
            severity
        };
        self
    }

    pub fn with_starting_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.starting_script = Some(path.into());
        self
    }

    /// Resolve `path` against the normalizer path when it is relative.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_against(self.normalizer_path.as_deref(), path)
    }
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self::interactive()
    }
}

/// Join a relative `path` onto `base`; absolute paths pass through.
pub fn resolve_against(base: Option<&Path>, path: &Path) -> PathBuf {
    match base {
        Some(base) if path.is_relative() => base.join(path),
        _ => path.to_path_buf(),
    }
}
