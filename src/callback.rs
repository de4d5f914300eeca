//! Execution callback interface for host programs.
//!
//! A script command whose stage identifier is not one of the built-in stages
//! is handed to the registered `ScriptExecutor`. This is how an embedding
//! program adds its own steps to an otherwise generic script.

use std::collections::BTreeMap;

use crate::stage::Params;

/// A custom command as seen by the host.
#[derive(Debug, Clone, Copy)]
pub struct Invocation<'a> {
    /// The custom stage identifier, e.g. `NOTIFY`.
    pub command: &'a str,
    /// The operation word written after the identifier.
    pub operation: &'a str,
    pub params: &'a Params,
}

/// Data a host hands back from a successful invocation. Logged, not
/// interpreted.
pub type CallbackOutput = BTreeMap<String, String>;

/// `key=value` pairs of a callback result, comma separated.
pub(crate) fn describe_output(output: &CallbackOutput) -> String {
    output
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Capability implemented by a host that drives the pipeline.
pub trait ScriptExecutor: Send {
    fn invoke(&mut self, call: &Invocation<'_>) -> Result<CallbackOutput, String>;
}

impl<F> ScriptExecutor for F
where
    F: FnMut(&Invocation<'_>) -> Result<CallbackOutput, String> + Send,
{
    fn invoke(&mut self, call: &Invocation<'_>) -> Result<CallbackOutput, String> {
        self(call)
    }
}

/// Executor that remembers every invocation and answers with an empty
/// result. Useful for dry runs of scripts with host commands.
#[derive(Debug, Default, Clone)]
pub struct RecordingExecutor {
    pub calls: Vec<(String, String, Params)>,
}

impl ScriptExecutor for RecordingExecutor {
    fn invoke(&mut self, call: &Invocation<'_>) -> Result<CallbackOutput, String> {
        self.calls.push((
            call.command.to_string(),
            call.operation.to_string(),
            call.params.clone(),
        ));
        Ok(CallbackOutput::new())
    }
}
