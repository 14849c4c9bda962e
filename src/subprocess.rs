//! Abstraction over invoking external tools (`mksquashfs`, `mount`,
//! `grub-editenv`, hook scripts, ...), so the install pipeline and
//! bootloader backends can be tested without actually spawning processes.

use std::process::Command;

use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait Runner: Send + Sync {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput>;
}

/// Runs real processes via `std::process::Command`.
pub struct SystemRunner;

impl Runner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        use std::io::Write;
        use std::process::Stdio;

        debug!(program, ?args, "spawning subprocess");
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null());
        }

        let mut child = cmd.spawn().map_err(Error::Io)?;
        if let Some(input) = stdin {
            child
                .stdin
                .take()
                .expect("stdin was requested as piped")
                .write_all(input)
                .map_err(Error::Io)?;
        }
        let output = child.wait_with_output().map_err(Error::Io)?;

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}

/// Records calls and returns scripted responses, for unit tests that
/// exercise install/bootloader logic without touching the host.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct MockRunner {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        pub response: CommandOutput,
    }

    impl MockRunner {
        pub fn ok() -> Self {
            MockRunner {
                calls: Mutex::new(Vec::new()),
                response: CommandOutput {
                    exit_code: 0,
                    ..Default::default()
                },
            }
        }

        pub fn failing(code: i32) -> Self {
            MockRunner {
                calls: Mutex::new(Vec::new()),
                response: CommandOutput {
                    exit_code: code,
                    ..Default::default()
                },
            }
        }
    }

    impl Runner for MockRunner {
        fn run(&self, program: &str, args: &[&str], _stdin: Option<&[u8]>) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            Ok(self.response.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockRunner;
    use super::*;

    #[test]
    fn mock_runner_records_calls() {
        let runner = MockRunner::ok();
        runner.run("grub-editenv", &["list"], None).unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "grub-editenv");
    }
}
