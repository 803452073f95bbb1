use super::SshConfig;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// ssh exits with 255 when the connection itself failed
const SSH_CONNECTION_FAILURE: i32 = 255;

/// Failure of a remote command. The rendered text is what gets published back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShellError {
    /// The command ran and wrote to stderr
    #[error("SSH error: {0}")]
    Remote(String),

    #[error("SSH connection failed: {0}")]
    Connection(String),
}

/// Executes one shell command on the target machine and returns trimmed stdout
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn run(&self, command: &str) -> Result<String, ShellError>;
}

/// Runs commands through the system OpenSSH client in batch mode (key auth only)
#[derive(Clone, Debug)]
pub struct SshShell {
    config: SshConfig,
}

impl SshShell {
    pub fn new(config: SshConfig) -> Self {
        SshShell { config }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.connect_timeout_secs))
            .arg("-p")
            .arg(self.config.port.to_string());
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(self.config.destination())
            .arg(remote)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn run(&self, command: &str) -> Result<String, ShellError> {
        debug!("Running on {}: {}", self.config.destination(), command);
        let output = self
            .command(command)
            .output()
            .await
            .map_err(|e| ShellError::Connection(e.to_string()))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.code() == Some(SSH_CONNECTION_FAILURE) {
            return Err(ShellError::Connection(if stderr.is_empty() {
                format!("ssh exited with status {}", SSH_CONNECTION_FAILURE)
            } else {
                stderr
            }));
        }
        if !stderr.is_empty() {
            return Err(ShellError::Remote(stderr));
        }
        Ok(stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_with_their_prefixes() {
        assert_eq!(
            ShellError::Remote("ls: cannot open directory".into()).to_string(),
            "SSH error: ls: cannot open directory"
        );
        assert_eq!(
            ShellError::Connection("timed out".into()).to_string(),
            "SSH connection failed: timed out"
        );
    }

    #[tokio::test]
    async fn missing_ssh_binary_is_a_connection_failure() {
        let shell = SshShell::new(SshConfig {
            program: "/nonexistent/ssh".into(),
            ..SshConfig::default()
        });
        assert!(matches!(
            shell.run("ls").await,
            Err(ShellError::Connection(_))
        ));
    }
}
