//! External command execution.
//!
//! Every interaction with the OS mount table goes through a [`CommandRunner`].
//! The runner never fails: launch errors are folded into a [`CommandOutput`]
//! with exit code `-1`, so callers only ever inspect an exit code and the
//! combined output text.

use std::process::{Command, Output, Stdio};

use tracing::debug;

/// Exit code reported when a command could not be launched at all.
pub const LAUNCH_FAILURE_CODE: i32 = -1;

/// Exit code and combined stdout/stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    /// Non-empty stdout lines followed by stderr lines, joined with `"; "`.
    pub output: String,
}

impl CommandOutput {
    pub fn new(code: i32, output: impl Into<String>) -> Self {
        Self {
            code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    fn from_output(output: Output) -> Self {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Self {
            code: output.status.code().unwrap_or(LAUNCH_FAILURE_CODE),
            output: combine_output(&stdout, &stderr),
        }
    }
}

/// Joins stdout and stderr into the single diagnostic line used in logs.
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Runs external programs on behalf of the mount executor.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput;

    /// Returns true if `program` can be found on `PATH`.
    fn is_installed(&self, program: &str) -> bool {
        self.run("which", &[program]).success()
    }
}

/// Runs commands directly on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
        debug!(program, ?args, "executing command");
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
        {
            Ok(output) => CommandOutput::from_output(output),
            Err(e) => CommandOutput::new(LAUNCH_FAILURE_CODE, e.to_string()),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted runner that records invocations instead of touching the host.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::{CommandOutput, CommandRunner};

    #[derive(Default)]
    pub struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
        responses: Mutex<HashMap<String, CommandOutput>>,
    }

    impl RecordingRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Scripts the result of every future call to `program`.
        pub fn respond(&self, program: &str, output: CommandOutput) {
            self.responses
                .lock()
                .unwrap()
                .insert(program.to_string(), output);
        }

        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
            self.calls()
                .into_iter()
                .filter(|c| c.first().is_some_and(|p| p == program))
                .collect()
        }
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> CommandOutput {
            let mut call = vec![program.to_string()];
            call.extend(args.iter().map(|a| a.to_string()));
            self.calls.lock().unwrap().push(call);

            self.responses
                .lock()
                .unwrap()
                .get(program)
                .cloned()
                .unwrap_or_else(|| CommandOutput::new(0, ""))
        }
    }
}
