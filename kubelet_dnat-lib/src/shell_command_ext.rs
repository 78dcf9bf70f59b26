use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use std::future::Future;
use std::io;
use std::process::{Output, Stdio};

#[derive(Debug, Error)]
pub enum Error {
    #[error("command execution failed")]
    CommandFailed,
    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

/// Controls whether a failing command logs its output as an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Logs {
    Print,
    Suppress,
}

pub trait ShellCommandExt {
    fn run_stdout(&mut self, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
    fn run_with_stdin(&mut self, input: &str, logs: Logs) -> impl Future<Output = Result<String, Error>> + Send;
}

impl ShellCommandExt for Command {
    /// Run the command and return its trimmed stdout.
    /// Unconditionally captures stdout and stderr regardless of command settings.
    /// See tokio's output behaviour: https://docs.rs/tokio/latest/tokio/process/struct.Command.html#method.output
    async fn run_stdout(&mut self, logs: Logs) -> Result<String, Error> {
        let output = self.output().await?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }

    /// Spawn the command, feed `input` through stdin and wait for it to exit.
    async fn run_with_stdin(&mut self, input: &str, logs: Logs) -> Result<String, Error> {
        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            // closing stdin signals end of input
            drop(stdin);
        }

        let output = child.wait_with_output().await?;
        let cmd_debug = format!("{:?}", self);
        stdout_from_output(cmd_debug, output, logs)
    }
}

pub fn stdout_from_output(cmd: String, output: Output, logs: Logs) -> Result<String, Error> {
    let stderrempty = output.stderr.is_empty();
    let stdout = String::from_utf8_lossy(&output.stdout);
    match (stderrempty, output.status) {
        (true, status) if status.success() => Ok(stdout.trim().to_string()),
        (false, status) if status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(cmd, %stderr, "Non empty stderr on successful command");
            Ok(stdout.trim().to_string())
        }
        (_, status) => {
            if logs == Logs::Print {
                let stderr = String::from_utf8_lossy(&output.stderr);
                tracing::error!(cmd, status_code = ?status.code(), %stdout, %stderr, "Error executing command");
            }
            Err(Error::CommandFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            // raw wait status carries the exit code in the second byte
            status: ExitStatus::from_raw(code << 8),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn successful_output_is_trimmed() -> anyhow::Result<()> {
        let res = stdout_from_output("cmd".into(), output(0, "  *nat\nCOMMIT\n", ""), Logs::Print)?;
        assert_eq!(res, "*nat\nCOMMIT");
        Ok(())
    }

    #[test]
    fn stderr_on_success_is_tolerated() -> anyhow::Result<()> {
        let res = stdout_from_output("cmd".into(), output(0, "ok", "warning: legacy tables"), Logs::Print)?;
        assert_eq!(res, "ok");
        Ok(())
    }

    #[test]
    fn non_zero_exit_fails() {
        let res = stdout_from_output("cmd".into(), output(1, "", "permission denied"), Logs::Suppress);
        assert!(matches!(res, Err(Error::CommandFailed)));
    }

    #[tokio::test]
    async fn stdin_is_piped_to_the_command() -> anyhow::Result<()> {
        let res = Command::new("cat").run_with_stdin("*nat\nCOMMIT\n", Logs::Print).await?;
        assert_eq!(res, "*nat\nCOMMIT");
        Ok(())
    }
}
