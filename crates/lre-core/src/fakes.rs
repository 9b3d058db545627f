//! Scripted command runner (testing only)
//!
//! `ScriptedRunner` answers commands from a list of rules instead of
//! spawning processes, and records every command it was asked to run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CommandError;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Side effect run when a rule matches, e.g. writing the files a tool would emit.
pub type CommandHook = Arc<dyn Fn(&CommandSpec) -> std::io::Result<()> + Send + Sync>;

/// One scripted response.
#[derive(Clone)]
pub struct Rule {
    program: String,
    arg_contains: Option<String>,
    output: CommandOutput,
    hook: Option<CommandHook>,
    delay: Option<Duration>,
}

impl Rule {
    /// Match every invocation of `program` and succeed with empty output.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            arg_contains: None,
            output: CommandOutput::ok(""),
            hook: None,
            delay: None,
        }
    }

    /// Only match when some argument contains `needle`.
    pub fn matching(mut self, needle: impl Into<String>) -> Self {
        self.arg_contains = Some(needle.into());
        self
    }

    pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
        self.output = CommandOutput::ok(stdout);
        self
    }

    pub fn fail(mut self, exit_code: i32, stderr: impl Into<String>) -> Self {
        self.output = CommandOutput::failed(exit_code, stderr);
        self
    }

    pub fn hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CommandSpec) -> std::io::Result<()> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Sleep before answering, to keep a command in flight.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn matches(&self, spec: &CommandSpec) -> bool {
        let program_matches = spec.program == self.program
            || spec.program.rsplit('/').next() == Some(self.program.as_str());
        program_matches
            && self
                .arg_contains
                .as_deref()
                .map_or(true, |needle| spec.has_arg(needle))
    }
}

/// Command runner answering from scripted rules. First matching rule wins;
/// unmatched commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(self, rule: Rule) -> Self {
        self.push(rule);
        self
    }

    pub fn push(&self, rule: Rule) {
        self.rules.lock().unwrap().push(rule);
    }

    /// Every command received, in order.
    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands whose program is `program`.
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| Rule::new(program).matches(c))
            .collect()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        if spec.program.is_empty() {
            return Err(CommandError::Empty);
        }
        self.calls.lock().unwrap().push(spec.clone());

        let rule = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.matches(spec))
            .cloned();
        let Some(rule) = rule else {
            return Ok(CommandOutput::ok(""));
        };

        if let Some(delay) = rule.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(hook) = &rule.hook {
            hook(spec).map_err(|e| CommandError::Spawn {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(rule.output)
    }
}
