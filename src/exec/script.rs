//! Scripted subprocess fake for tests.
//!
//! Responses are queued per program name and popped in FIFO order; programs
//! without a queued response succeed with empty output, so tests only script
//! the calls they care about. Every invocation is recorded for assertions.

use super::{CommandOutput, Exec, LineStream};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// One recorded subprocess invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn arg_line(&self) -> String {
        self.args.join(" ")
    }
}

#[derive(Default)]
pub struct ScriptedExec {
    responses: Mutex<HashMap<String, VecDeque<Result<CommandOutput>>>>,
    lines: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a canned response for the next invocation of `program`.
    pub fn on(&self, program: &str, response: Result<CommandOutput>) -> &Self {
        self.responses
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(response);
        self
    }

    /// Queue a successful invocation of `program` with the given stdout.
    pub fn on_stdout(&self, program: &str, stdout: &str) -> &Self {
        self.on(
            program,
            Ok(CommandOutput {
                code: Some(0),
                stdout: stdout.to_string(),
                stderr: String::new(),
            }),
        )
    }

    /// Queue a failing invocation of `program`.
    pub fn on_failure(&self, program: &str, code: i32, output: &str) -> &Self {
        self.on(
            program,
            Ok(CommandOutput {
                code: Some(code),
                stdout: output.to_string(),
                stderr: String::new(),
            }),
        )
    }

    /// Set the stdout lines streamed for `program`.
    pub fn set_lines(&self, program: &str, lines: Vec<&str>) -> &Self {
        self.lines
            .lock()
            .unwrap()
            .insert(program.to_string(), lines.into_iter().map(String::from).collect());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn invocations_of(&self, program: &str) -> Vec<Invocation> {
        self.invocations()
            .into_iter()
            .filter(|i| i.program == program)
            .collect()
    }

    fn record(&self, program: &str, args: &[&str], stdin: Option<&str>) {
        self.calls.lock().unwrap().push(Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: stdin.map(String::from),
        });
    }

    fn pop(&self, program: &str) -> Result<CommandOutput> {
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(program).and_then(|q| q.pop_front()) {
            Some(response) => response,
            None => Ok(CommandOutput {
                code: Some(0),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Exec for ScriptedExec {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        self.record(program, args, None);
        self.pop(program)
    }

    async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        stdin: &str,
    ) -> Result<CommandOutput> {
        self.record(program, args, Some(stdin));
        self.pop(program)
    }

    async fn stream_lines(&self, program: &str, args: &[&str]) -> Result<LineStream> {
        self.record(program, args, None);
        let lines = self.lines.lock().unwrap().remove(program);
        match lines {
            Some(lines) => Ok(LineStream::scripted(lines)),
            None => Err(Error::Io(std::io::Error::other("no scripted lines"))),
        }
    }
}
