//! Terminal process control
//!
//! Launches the configured terminal executables as child processes, stops
//! them (optionally through an operator-supplied stop command first) and
//! performs account logins through an external helper program.
//!
//! Stop and status look at the whole process table, not only at children
//! this controller spawned: a terminal started by an operator or left over
//! from a previous bridge run is found by its image path. Absolute
//! configured paths match the canonical executable path, bare names match
//! the executable file name.
//!
//! Helper contract: `<helper> --login <login> --server <server>` with the
//! password in `MT_LOGIN_PASSWORD`; exit code 0 means the terminal accepted
//! the login.

use async_trait::async_trait;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, Signal, System, UpdateKind};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinError;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::domain::entities::account::AccountRegistryEntry;
use crate::domain::entities::recovery_job::duration_ms;
use crate::domain::errors::ProcessControlError;
use crate::domain::repositories::terminal::{TerminalController, TerminalStatus};

/// Environment variable the login helper reads the password from
pub const LOGIN_PASSWORD_ENV: &str = "MT_LOGIN_PASSWORD";

const EXIT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct TerminalProcessConfig {
    pub executables: Vec<PathBuf>,
    pub args: Vec<String>,
    pub stop_command: Option<Vec<String>>,
    pub login_helper: Option<PathBuf>,
    /// Per-call bound on the login helper
    pub login_timeout: Duration,
    /// How long a fresh process must survive to count as started
    pub startup_check: Duration,
}

impl Default for TerminalProcessConfig {
    fn default() -> Self {
        Self {
            executables: Vec::new(),
            args: Vec::new(),
            stop_command: None,
            login_helper: None,
            login_timeout: Duration::from_secs(20),
            startup_check: Duration::from_secs(2),
        }
    }
}

impl From<&BridgeConfig> for TerminalProcessConfig {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            executables: config.terminal_executables.clone(),
            args: config.terminal_args.clone(),
            stop_command: config.terminal_stop_command.clone(),
            login_helper: config.login_helper.clone(),
            login_timeout: config.login_timeout,
            ..Self::default()
        }
    }
}

/// How a configured executable is recognised in the process table
#[derive(Debug, Clone)]
enum ImageMatcher {
    Path(PathBuf),
    Name(PathBuf),
}

impl ImageMatcher {
    fn new(configured: &Path) -> Self {
        if configured.is_absolute() {
            let path = std::fs::canonicalize(configured).unwrap_or_else(|_| configured.to_path_buf());
            ImageMatcher::Path(path)
        } else {
            let name = configured.file_name().unwrap_or(configured.as_os_str());
            ImageMatcher::Name(PathBuf::from(name))
        }
    }

    fn matches(&self, exe: &Path) -> bool {
        match self {
            ImageMatcher::Path(path) => same_image(exe.as_os_str(), path.as_os_str()),
            ImageMatcher::Name(name) => exe
                .file_name()
                .is_some_and(|file| same_image(file, name.as_os_str())),
        }
    }
}

fn same_image(a: &OsStr, b: &OsStr) -> bool {
    if cfg!(windows) {
        a.to_string_lossy().eq_ignore_ascii_case(&b.to_string_lossy())
    } else {
        a == b
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImageAction {
    Count,
    Terminate,
    Kill,
}

/// Walk the process table, apply `action` to every live process running one
/// of the matched images and return how many there were.
fn scan_failed(e: JoinError) -> ProcessControlError {
    ProcessControlError::StopFailed(format!("process scan failed: {}", e))
}

fn scan_images(matchers: &[ImageMatcher], action: ImageAction) -> usize {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
    );
    let own_pid = sysinfo::get_current_pid().ok();

    let matched: Vec<Pid> = system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            Some(**pid) != own_pid
                && process.status() != ProcessStatus::Zombie
                && process
                    .exe()
                    .is_some_and(|exe| matchers.iter().any(|m| m.matches(exe)))
        })
        .map(|(pid, _)| *pid)
        .collect();

    let mut instances = 0;
    for pid in &matched {
        let Some(process) = system.process(*pid) else {
            continue;
        };
        // Threads and children of a matched image count once
        if !process.parent().is_some_and(|parent| matched.contains(&parent)) {
            instances += 1;
        }
        match action {
            ImageAction::Count => {}
            ImageAction::Terminate => {
                if process.kill_with(Signal::Term).is_none() {
                    process.kill();
                }
            }
            ImageAction::Kill => {
                process.kill();
            }
        }
    }
    instances
}

struct TrackedProcess {
    path: PathBuf,
    child: Child,
}

impl TrackedProcess {
    /// Exit status if the process has terminated
    fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({})", e)),
        }
    }
}

pub struct ProcessTerminalController {
    config: TerminalProcessConfig,
    matchers: Arc<Vec<ImageMatcher>>,
    processes: Mutex<Vec<TrackedProcess>>,
}

impl ProcessTerminalController {
    pub fn new(config: TerminalProcessConfig) -> Self {
        let matchers = config
            .executables
            .iter()
            .map(|path| ImageMatcher::new(path))
            .collect();
        Self {
            config,
            matchers: Arc::new(matchers),
            processes: Mutex::new(Vec::new()),
        }
    }

    async fn scan(&self, action: ImageAction) -> Result<usize, JoinError> {
        if self.matchers.is_empty() {
            return Ok(0);
        }
        let matchers = self.matchers.clone();
        tokio::task::spawn_blocking(move || scan_images(&matchers, action)).await
    }

    /// Poll until no terminal image is running or `within` elapses; returns
    /// the number still running.
    async fn wait_for_exit(&self, within: Duration) -> Result<usize, ProcessControlError> {
        let deadline = Instant::now() + within;
        loop {
            let running = self.scan(ImageAction::Count).await.map_err(scan_failed)?;
            let now = Instant::now();
            if running == 0 || now >= deadline {
                return Ok(running);
            }
            sleep(EXIT_POLL.min(deadline - now)).await;
        }
    }

    /// Collect exit statuses of spawned children and forget them
    async fn reap_tracked(&self) {
        let mut processes = self.processes.lock().await;
        for process in processes.iter_mut() {
            if process.exit_status().is_some() {
                continue;
            }
            let _ = process.child.start_kill();
            if timeout(Duration::from_secs(1), process.child.wait()).await.is_err() {
                warn!("Terminal {} did not exit after kill", process.path.display());
            }
        }
        processes.clear();
    }

    async fn run_stop_command(&self, grace: Duration) {
        let Some((program, args)) = self
            .config
            .stop_command
            .as_ref()
            .and_then(|cmd| cmd.split_first())
        else {
            return;
        };

        info!("Running terminal stop command: {}", program);
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        match timeout(grace.max(Duration::from_secs(1)), output).await {
            Ok(Ok(out)) if out.status.success() => debug!("Stop command finished"),
            Ok(Ok(out)) => warn!(
                "Stop command exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Ok(Err(e)) => warn!("Stop command could not run: {}", e),
            Err(_) => warn!("Stop command did not finish within {:?}", grace),
        }
    }
}

#[async_trait]
impl TerminalController for ProcessTerminalController {
    async fn stop(&self, grace: Duration) -> Result<(), ProcessControlError> {
        self.run_stop_command(grace).await;

        let found = self
            .scan(ImageAction::Terminate)
            .await
            .map_err(scan_failed)?;
        if found > 0 {
            info!("Asked {} terminal process(es) to exit", found);
            let remaining = self.wait_for_exit(grace).await?;
            if remaining > 0 {
                warn!(
                    "Killing {} terminal process(es) still running after {:?}",
                    remaining, grace
                );
                self.scan(ImageAction::Kill).await.map_err(scan_failed)?;
                let remaining = self
                    .wait_for_exit(grace.max(Duration::from_secs(1)))
                    .await?;
                if remaining > 0 {
                    return Err(ProcessControlError::StopFailed(format!(
                        "{} terminal process(es) still running after kill",
                        remaining
                    )));
                }
            }
        }

        self.reap_tracked().await;
        info!("Stopped {} terminal process(es)", found);
        Ok(())
    }

    async fn start(&self) -> Result<(), ProcessControlError> {
        if self.config.executables.is_empty() {
            return Err(ProcessControlError::NotConfigured);
        }

        let mut processes = self.processes.lock().await;
        processes.retain_mut(|p| p.exit_status().is_none());

        for path in &self.config.executables {
            let child = Command::new(path)
                .args(&self.config.args)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| ProcessControlError::SpawnFailed {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
            info!(
                "Launched terminal {} (pid {:?})",
                path.display(),
                child.id()
            );
            processes.push(TrackedProcess {
                path: path.clone(),
                child,
            });
        }
        drop(processes);

        sleep(self.config.startup_check).await;
        self.ensure_running().await
    }

    async fn ensure_running(&self) -> Result<(), ProcessControlError> {
        if self.config.executables.is_empty() {
            return Err(ProcessControlError::NotConfigured);
        }
        let mut processes = self.processes.lock().await;
        if processes.is_empty() {
            return Err(ProcessControlError::NotRunning);
        }
        for process in processes.iter_mut() {
            if let Some(status) = process.exit_status() {
                return Err(ProcessControlError::ExitedEarly {
                    path: process.path.display().to_string(),
                    status,
                });
            }
        }
        Ok(())
    }

    async fn login(
        &self,
        account: &AccountRegistryEntry,
        password: &str,
    ) -> Result<(), ProcessControlError> {
        let Some(helper) = &self.config.login_helper else {
            debug!(
                "No login helper configured, account {} relies on terminal auto-login",
                account.login
            );
            return Ok(());
        };

        let output = Command::new(helper)
            .arg("--login")
            .arg(account.login.to_string())
            .arg("--server")
            .arg(&account.server)
            .env(LOGIN_PASSWORD_ENV, password)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.config.login_timeout, output)
            .await
            .map_err(|_| ProcessControlError::LoginTimedOut {
                login: account.login,
                timeout_ms: duration_ms(self.config.login_timeout),
            })?
            .map_err(|e| ProcessControlError::SpawnFailed {
                path: helper.display().to_string(),
                message: e.to_string(),
            })?;

        if output.status.success() {
            info!("Account {} logged in on {}", account.login, account.server);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("helper exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        Err(ProcessControlError::LoginRejected {
            login: account.login,
            message,
        })
    }

    async fn status(&self) -> TerminalStatus {
        let running_processes = self.scan(ImageAction::Count).await.unwrap_or_else(|e| {
            warn!("Process scan failed: {}", e);
            0
        });
        TerminalStatus {
            initialized: running_processes > 0,
            running_processes,
            configured_executables: self.config.executables.len(),
        }
    }
}
