use std::{path::PathBuf, process::Stdio, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    process::{Child, Command},
    time::timeout,
};

#[cfg(unix)]
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};

/// Starts a broker process when none answers on the port.
pub trait BrokerLauncher: Send + Sync {
    /// Start a broker listening on `port`. Returns the child when this
    /// process owns it, or `None` when the broker is managed elsewhere.
    fn launch(&self, port: u16) -> Result<Option<Child>>;
}

/// Runs `<program> serve --port <port>` in its own session, away from the
/// window's process group and terminal signals. The returned child is owned by
/// the caller, which terminates it on cleanup.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Launch the currently running executable.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().context("failed to resolve current executable")?;
        Ok(Self::new(program))
    }

    /// Arguments placed before the `serve` subcommand.
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args.extend(args.into_iter().map(Into::into));
        self
    }

    fn command(&self, port: u16) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg("serve")
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                if nix::libc::setsid() == -1 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(())
                }
            });
        }
        cmd
    }
}

impl BrokerLauncher for ProcessLauncher {
    fn launch(&self, port: u16) -> Result<Option<Child>> {
        let child = self
            .command(port)
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program.display()))?;
        tracing::info!(
            target = "ask_broker::launcher",
            program = %self.program.display(),
            port = port,
            pid = child.id().unwrap_or_default(),
            "launched broker process"
        );
        Ok(Some(child))
    }
}

/// For brokers started by something else, such as a test harness.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternalBroker;

impl BrokerLauncher for ExternalBroker {
    fn launch(&self, port: u16) -> Result<Option<Child>> {
        tracing::debug!(
            target = "ask_broker::launcher",
            port = port,
            "broker is managed externally, nothing to launch"
        );
        Ok(None)
    }
}

/// SIGTERM, then SIGKILL if the child has not exited within `grace`.
pub async fn terminate_child(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    if timeout(grace, child.wait()).await.is_err() {
        tracing::warn!(
            target = "ask_broker::launcher",
            grace_ms = grace.as_millis() as u64,
            "broker ignored SIGTERM, killing"
        );
        let _ = child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::process::Command;

    use super::{terminate_child, BrokerLauncher, ExternalBroker, ProcessLauncher};

    #[tokio::test]
    async fn terminate_stops_a_running_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate_child(&mut child, Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn launched_process_gets_its_own_session() {
        // the serve arguments become positional parameters of `sh -c`
        let launcher = ProcessLauncher::new("sh").with_leading_args(["-c", "sleep 30"]);
        let mut child = launcher.launch(0).unwrap().unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id().unwrap() as i32);
        // setsid makes the child its own session leader
        let sid = nix::unistd::getsid(Some(pid)).unwrap();
        assert_eq!(sid, pid);
        terminate_child(&mut child, Duration::from_millis(200)).await;
    }

    #[test]
    fn external_broker_launches_nothing() {
        assert!(ExternalBroker.launch(3890).unwrap().is_none());
    }
}
