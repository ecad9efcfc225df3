//! Remote command session on the swarm manager.
//!
//! A session is an OpenSSH control master: one authenticated connection is
//! held open by a background `ssh -M` process and every command is
//! multiplexed over its control socket. Closing the session asks the master
//! to exit and removes the socket.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::OrchestratorError;
use crate::config::{AppConfig, SshHostKeyChecking};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SshTarget {
    pub program: PathBuf,
    pub host: String,
    pub user: Option<String>,
    pub port: u16,
    pub identity_file: Option<PathBuf>,
    pub options: SshOptions,
}

#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout_secs: u16,
    pub command_timeout: Duration,
    pub host_key_checking: SshHostKeyChecking,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            command_timeout: Duration::from_secs(30),
            host_key_checking: SshHostKeyChecking::AcceptNew,
        }
    }
}

impl SshTarget {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            program: cfg.ssh_binary.clone(),
            host: cfg.swarm_host.clone(),
            user: cfg.swarm_username.clone(),
            port: cfg.swarm_port_ssh,
            identity_file: cfg.ssh_identity_file.clone(),
            options: SshOptions {
                connect_timeout_secs: cfg.ssh_connect_timeout_secs,
                command_timeout: cfg.ssh_command_timeout(),
                host_key_checking: cfg.ssh_host_key_checking,
            },
        }
    }

    pub fn destination(&self) -> String {
        match &self.user {
            Some(user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }

    fn ssh_base(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-p").arg(self.port.to_string());
        cmd.arg("-o").arg(format!(
            "ConnectTimeout={}",
            self.options.connect_timeout_secs
        ));
        cmd.arg("-o").arg("ConnectionAttempts=1");
        cmd.arg("-o").arg(format!(
            "StrictHostKeyChecking={}",
            self.options
                .host_key_checking
                .strict_host_key_checking_value()
        ));
        if self.options.host_key_checking == SshHostKeyChecking::Off {
            cmd.arg("-o").arg("UserKnownHostsFile=/dev/null");
        }
        cmd.arg("-o").arg("BatchMode=yes");
        cmd.arg("-o").arg("LogLevel=ERROR");

        if let Some(key) = &self.identity_file {
            cmd.arg("-i").arg(key);
            cmd.arg("-o").arg("IdentitiesOnly=yes");
        }
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);
        cmd
    }

    fn session_error(&self, message: impl Into<String>) -> OrchestratorError {
        let message = message.into();
        let message = if looks_like_ssh_host_key_failure(&message) {
            format!(
                "{}\n\nssh stderr:\n{}",
                render_ssh_host_key_failure_hint(self),
                message.trim_end()
            )
        } else {
            message
        };
        OrchestratorError::Session {
            destination: self.destination(),
            message,
        }
    }
}

/// An open control master connection.
#[derive(Debug)]
pub struct SshSession {
    target: SshTarget,
    control_path: PathBuf,
    master: Child,
}

impl SshSession {
    /// Starts the control master and waits until it accepts commands.
    pub async fn open(target: &SshTarget) -> Result<Self, OrchestratorError> {
        let control_path =
            std::env::temp_dir().join(format!("dockate-{}.sock", Uuid::new_v4().simple()));

        let mut cmd = target.ssh_base();
        cmd.arg("-M")
            .arg("-S")
            .arg(&control_path)
            .arg("-o")
            .arg("ControlPersist=no")
            .arg("-N")
            .arg("--")
            .arg(target.destination());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());
        let mut master = cmd.spawn().map_err(OrchestratorError::Spawn)?;

        let deadline =
            Instant::now() + Duration::from_secs(u64::from(target.options.connect_timeout_secs.max(1)));
        loop {
            if let Some(status) = master.try_wait().map_err(OrchestratorError::Spawn)? {
                let mut stderr = String::new();
                if let Some(mut pipe) = master.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                let message = if stderr.trim().is_empty() {
                    format!("ssh exited with {status}")
                } else {
                    stderr
                };
                return Err(target.session_error(message));
            }

            if control_check(target, &control_path).await? {
                break;
            }

            if Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(target.session_error(format!(
                    "control master not ready after {}s",
                    target.options.connect_timeout_secs
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        info!(
            destination = %target.destination(),
            control_path = %control_path.display(),
            "ssh session opened"
        );
        Ok(Self {
            target: target.clone(),
            control_path,
            master,
        })
    }

    /// Runs `command` through the shared connection and returns its stdout.
    pub async fn exec(&self, command: &str) -> Result<String, OrchestratorError> {
        let mut cmd = self.target.ssh_base();
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("--")
            .arg(self.target.destination())
            .arg(command);

        let timeout = self.target.options.command_timeout;
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| OrchestratorError::Timeout {
                command: command.to_string(),
                timeout,
            })?
            .map_err(OrchestratorError::Spawn)?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(command, status = %output.status, stdout = %stdout, "ssh command finished");

        if !output.status.success() {
            if looks_like_ssh_host_key_failure(&stderr) {
                return Err(self.target.session_error(stderr));
            }
            return Err(OrchestratorError::Command {
                destination: self.target.destination(),
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: stderr.trim_end().to_string(),
            });
        }
        Ok(stdout)
    }

    /// Asks the master to exit, then reaps it and removes the socket.
    pub async fn close(mut self) -> Result<(), OrchestratorError> {
        let mut cmd = self.target.ssh_base();
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg("--")
            .arg(self.target.destination());
        let exit = tokio::time::timeout(self.target.options.command_timeout, cmd.output()).await;
        match exit {
            Ok(Ok(output)) if output.status.success() => {}
            Ok(Ok(output)) => warn!(
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "ssh control master refused exit request"
            ),
            Ok(Err(err)) => warn!(error = %err, "failed to run ssh exit request"),
            Err(_) => warn!("ssh exit request timed out"),
        }

        if self
            .master
            .try_wait()
            .map_err(OrchestratorError::Spawn)?
            .is_none()
        {
            self.master.kill().await.map_err(OrchestratorError::Spawn)?;
        }
        match tokio::fs::remove_file(&self.control_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                error = %err,
                control_path = %self.control_path.display(),
                "failed to remove ssh control socket"
            ),
        }
        info!(destination = %self.target.destination(), "ssh session closed");
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        // `kill_on_drop` reaps the master; only the socket path is left.
        let _ = std::fs::remove_file(&self.control_path);
    }
}

async fn control_check(
    target: &SshTarget,
    control_path: &std::path::Path,
) -> Result<bool, OrchestratorError> {
    let mut cmd = target.ssh_base();
    cmd.arg("-S")
        .arg(control_path)
        .arg("-O")
        .arg("check")
        .arg("--")
        .arg(target.destination());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    let status = cmd.status().await.map_err(OrchestratorError::Spawn)?;
    Ok(status.success())
}

pub fn sh_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            out.push_str("'\"'\"'");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

fn looks_like_ssh_host_key_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
        || lower.contains("offending key")
        || lower.contains("man-in-the-middle")
}

fn render_ssh_host_key_failure_hint(target: &SshTarget) -> String {
    let dest = target.destination();
    let host = target.host.as_str();
    let port = target.port;

    format!(
        "ssh host key verification failed for {dest}.\n\
\n\
Fix: verify the manager's fingerprint, then add its host key to known_hosts:\n\
  ssh-keyscan -H -p {port} {host} >> ~/.ssh/known_hosts\n\
\n\
Override (less secure): set ssh_host_key_checking to accept-new or off."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{READY_MASTER, fake_ssh, fake_ssh_calls};
    use std::fs;

    #[tokio::test]
    async fn session_runs_commands_over_the_control_socket() {
        let (dir, target) = fake_ssh(READY_MASTER, "cat \"$root/stdout.txt\"");
        fs::write(dir.path().join("stdout.txt"), "ID   NAME\nabc  web.1\n").expect("write stdout");

        let session = SshSession::open(&target).await.expect("session opens");
        let output = session
            .exec(&format!("docker node ps {}", sh_quote("node-1")))
            .await
            .expect("command runs");
        assert_eq!(output, "ID   NAME\nabc  web.1\n");
        session.close().await.expect("session closes");

        let log = fake_ssh_calls(&dir);
        let master_line = log
            .lines()
            .find(|line| line.starts_with("master "))
            .expect("master started");
        assert!(master_line.contains("-p 2222"), "{master_line}");
        assert!(master_line.contains("-i /keys/id_ed25519"), "{master_line}");
        assert!(
            master_line.contains("StrictHostKeyChecking=accept-new"),
            "{master_line}"
        );
        assert!(master_line.ends_with("deploy@manager.local"), "{master_line}");

        let exec_line = log
            .lines()
            .find(|line| line.starts_with("exec "))
            .expect("command sent");
        assert!(exec_line.contains("ControlMaster=no"), "{exec_line}");
        assert!(exec_line.contains("-S "), "{exec_line}");
        assert!(
            exec_line.ends_with("deploy@manager.local docker node ps 'node-1'"),
            "{exec_line}"
        );

        assert!(
            log.lines()
                .any(|line| line.starts_with("control ") && line.contains("-O exit")),
            "exit request missing: {log}"
        );
    }

    #[tokio::test]
    async fn failed_master_reports_session_error_with_hint() {
        let (_dir, target) = fake_ssh(
            "echo 'Host key verification failed.' 1>&2; exit 255",
            "exit 0",
        );

        let err = SshSession::open(&target).await.expect_err("should fail");
        match err {
            OrchestratorError::Session {
                destination,
                message,
            } => {
                assert_eq!(destination, "deploy@manager.local");
                assert!(message.contains("ssh-keyscan -H -p 2222 manager.local"), "{message}");
                assert!(message.contains("Host key verification failed"), "{message}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn failing_command_reports_status_and_stderr() {
        let (_dir, target) = fake_ssh(READY_MASTER, "echo 'Error: No such node: n9' 1>&2; exit 1");

        let session = SshSession::open(&target).await.expect("session opens");
        let err = session
            .exec("docker node ps 'n9'")
            .await
            .expect_err("should fail");
        match &err {
            OrchestratorError::Command {
                command, stderr, ..
            } => {
                assert_eq!(command, "docker node ps 'n9'");
                assert_eq!(stderr, "Error: No such node: n9");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.kind(), "command");
        session.close().await.expect("session closes");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let (_dir, mut target) = fake_ssh(READY_MASTER, "sleep 5");
        target.options.command_timeout = Duration::from_millis(200);

        let session = SshSession::open(&target).await.expect("session opens");
        let err = session.exec("docker node ps 'n1'").await.expect_err("should time out");
        assert!(matches!(err, OrchestratorError::Timeout { .. }), "{err:?}");
        session.close().await.expect("session closes");
    }

    #[tokio::test]
    async fn dropped_session_removes_control_socket() {
        let (_dir, target) = fake_ssh(READY_MASTER, "exit 0");
        let session = SshSession::open(&target).await.expect("session opens");
        let control_path = session.control_path.clone();
        fs::write(&control_path, "").expect("stand-in socket");

        drop(session);
        assert!(!control_path.exists(), "control socket left behind");
    }

    #[test]
    fn sh_quote_handles_empty_and_quotes() {
        assert_eq!(sh_quote(""), "''");
        assert_eq!(sh_quote("simple"), "'simple'");
        assert_eq!(sh_quote("we're"), "'we'\"'\"'re'");
    }

    #[test]
    fn destination_without_user_uses_host() {
        let target = SshTarget {
            program: PathBuf::from("ssh"),
            host: "10.0.0.1".into(),
            user: None,
            port: 22,
            identity_file: None,
            options: SshOptions::default(),
        };
        assert_eq!(target.destination(), "10.0.0.1");
    }

    #[test]
    fn host_key_failure_detection_matches_expected_messages() {
        assert!(looks_like_ssh_host_key_failure(
            "Host key verification failed."
        ));
        assert!(looks_like_ssh_host_key_failure(
            "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!"
        ));
        assert!(!looks_like_ssh_host_key_failure("Permission denied (publickey)."));
    }
}
