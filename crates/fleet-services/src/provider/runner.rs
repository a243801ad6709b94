//! Shell command execution.

use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use fleet_core::ProviderError;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// stderr if the command wrote any, otherwise stdout.
    pub fn diagnostic(&self) -> &str {
        if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        }
    }
}

/// Runs one shell command line. A non-zero exit is an `Ok` output;
/// only spawn failures and timeouts are errors.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str, timeout: Option<Duration>)
        -> Result<CommandOutput, ProviderError>;
}

/// Run `command` and turn a non-zero exit into `CommandFailed`.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    command: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutput, ProviderError> {
    let output = runner.run(command, timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ProviderError::CommandFailed {
            command: command.to_string(),
            code: output.code,
            output: output.diagnostic().to_string(),
        })
    }
}

/// Quote `arg` as one `sh` word. Plain words pass through unchanged.
pub fn quote(arg: &str) -> Cow<'_, str> {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_@%+=:,./-".contains(&b));
    if plain {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
    }
}

/// `sh -c` in a working directory.
pub struct ShellRunner {
    work_dir: PathBuf,
}

impl ShellRunner {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, ProviderError> {
        if let Err(e) = tokio::fs::create_dir_all(&self.work_dir).await {
            tracing::warn!(path = %self.work_dir.display(), error = %e, "failed to create work dir");
        }

        tracing::debug!(%command, "running");
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .kill_on_drop(true)
            .output();

        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, child).await.map_err(|_| {
                ProviderError::CommandTimeout {
                    command: command.to_string(),
                    secs: limit.as_secs(),
                }
            })?,
            None => child.await,
        }
        .map_err(|source| ProviderError::Spawn {
            command: command.to_string(),
            source,
        })?;

        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(quote("containerd.io-1.6.28"), "containerd.io-1.6.28");
        assert_eq!(quote("/var/lib/containerd"), "/var/lib/containerd");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a b"), "'a b'");
        assert_eq!(quote("x; rm -rf /"), "'x; rm -rf /'");
        assert_eq!(quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn quoted_argument_reaches_the_command_intact() {
        let runner = ShellRunner::new(std::env::temp_dir());
        let arg = "$(echo pwned) it's; true";
        let out = runner
            .run(&format!("printf %s {}", quote(arg)), None)
            .await
            .unwrap();
        assert_eq!(out.stdout, arg);
    }

    #[tokio::test]
    async fn shell_runner_captures_output_and_exit_code() {
        let runner = ShellRunner::new(std::env::temp_dir());
        let out = runner.run("echo hello; exit 3", None).await.unwrap();
        assert_eq!(out.code, 3);
        assert_eq!(out.stdout.trim(), "hello");

        let err = run_checked(&runner, "echo oops >&2; false", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn shell_runner_enforces_timeout() {
        let runner = ShellRunner::new(std::env::temp_dir());
        let err = runner
            .run("sleep 5", Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CommandTimeout { .. }));
    }
}
