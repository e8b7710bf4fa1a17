//! In-memory fakes (testing only)
//!
//! [`FakeRunner`] records every command it is asked to run and answers from
//! a list of scripted rules, so orchestration code can be exercised without
//! a hypervisor, an SSH server or a package manager.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Result, VmError};
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

/// Scripted reply for commands whose command line contains `pattern`.
#[derive(Debug, Clone)]
pub struct FakeResponse {
    pattern: String,
    exit_code: i32,
    stdout: String,
    spawn_error: bool,
    remaining: Option<usize>,
}

impl FakeResponse {
    /// Successful, empty output.
    pub fn ok(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            exit_code: 0,
            stdout: String::new(),
            spawn_error: false,
            remaining: None,
        }
    }

    /// Successful with the given stdout.
    pub fn stdout(pattern: impl Into<String>, stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::ok(pattern)
        }
    }

    /// Exits with `code`.
    pub fn exit(pattern: impl Into<String>, code: i32) -> Self {
        Self {
            exit_code: code,
            ..Self::ok(pattern)
        }
    }

    /// The program cannot be started at all.
    pub fn spawn_error(pattern: impl Into<String>) -> Self {
        Self {
            spawn_error: true,
            ..Self::ok(pattern)
        }
    }

    /// Only answer the next `n` matching calls.
    pub fn times(mut self, n: usize) -> Self {
        self.remaining = Some(n);
        self
    }
}

/// Recording [`CommandRunner`]. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<CommandSpec>>,
    rules: Mutex<Vec<FakeResponse>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule. Rules are tried in insertion order.
    pub fn on(self, response: FakeResponse) -> Self {
        self.rules.lock().unwrap().push(response);
        self
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Command lines of every recorded call, in order.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::command_line).collect()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }

    /// Index of the first call containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.command_lines()
            .iter()
            .position(|line| line.contains(pattern))
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.command_line();
        self.calls.lock().unwrap().push(spec.clone());

        let mut rules = self.rules.lock().unwrap();
        let rule = rules
            .iter_mut()
            .find(|r| line.contains(&r.pattern) && r.remaining != Some(0));
        let Some(rule) = rule else {
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration_ms: 0,
            });
        };
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        if rule.spawn_error {
            return Err(VmError::Spawn {
                program: spec.program.clone(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
            });
        }
        Ok(CommandOutput {
            exit_code: rule.exit_code,
            stdout: rule.stdout.clone(),
            stderr: if rule.exit_code == 0 {
                String::new()
            } else {
                format!("scripted failure of {}", spec.program)
            },
            duration_ms: 0,
        })
    }
}
