use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::services::recovery_plan::RecoveryPlan;
use crate::domain::services::watchdog::MIN_DEBOUNCE_CYCLES;

/// Runtime configuration of the bridge
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub bind_addr: SocketAddr,
    pub registry_path: PathBuf,

    // Snapshot reader
    pub snapshot_dir: PathBuf,
    pub snapshot_file_pattern: String, // must contain {login}
    pub poll_interval: Duration,
    pub writer_sync_interval: Duration, // how often the terminal writer refreshes its files
    pub staleness_multiplier: u32,

    // Watchdog
    pub watchdog_enabled: bool,
    pub watchdog_interval: Duration,
    pub debounce_cycles: u32,

    // Terminal process control
    pub terminal_executables: Vec<PathBuf>,
    pub terminal_args: Vec<String>,
    pub terminal_stop_command: Option<Vec<String>>, // program + args, run before killing tracked children
    pub login_helper: Option<PathBuf>,

    // Recovery state machine
    pub stop_grace: Duration,
    pub stop_timeout: Duration,
    pub stop_attempts: u32,
    pub settle_delay: Duration,
    pub start_timeout: Duration,
    pub start_attempts: u32,
    pub init_delay: Duration,
    pub login_timeout: Duration,
    pub login_attempts: u32,
    pub verification_timeout: Duration,
    pub verification_poll: Duration,
    pub verification_tolerance: Option<f64>,

    // API / audit
    pub restart_requests_per_minute: u32,
    pub job_history_limit: usize,
    pub audit_database_url: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8000)),
            registry_path: PathBuf::from("accounts.json"),

            snapshot_dir: PathBuf::from("snapshots"),
            snapshot_file_pattern: "account_{login}.json".to_string(),
            poll_interval: Duration::from_secs(5),
            writer_sync_interval: Duration::from_secs(30),
            staleness_multiplier: 3,

            watchdog_enabled: true,
            watchdog_interval: Duration::from_secs(60),
            debounce_cycles: 2,

            terminal_executables: Vec::new(),
            terminal_args: Vec::new(),
            terminal_stop_command: None,
            login_helper: None,

            stop_grace: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(45),
            stop_attempts: 2,
            settle_delay: Duration::from_secs(5),
            start_timeout: Duration::from_secs(30),
            start_attempts: 2,
            init_delay: Duration::from_secs(30),
            login_timeout: Duration::from_secs(20),
            login_attempts: 3,
            verification_timeout: Duration::from_secs(120),
            verification_poll: Duration::from_secs(5),
            verification_tolerance: None,

            restart_requests_per_minute: 6,
            job_history_limit: 50,
            audit_database_url: None,
        }
    }
}

/// Parse `name` into `T`, keeping it only if `valid` accepts it
fn env_value<T>(name: &str, valid: impl Fn(&T) -> bool) -> Option<T>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => Some(value),
        Ok(value) => {
            tracing::warn!("Invalid {} value: {} (out of range), using default", name, value);
            None
        }
        Err(e) => {
            tracing::warn!("Failed to parse {} '{}': {}, using default", name, raw, e);
            None
        }
    }
}

fn env_secs(name: &str, min: u64, max: u64) -> Option<Duration> {
    env_value::<u64>(name, |v| (min..=max).contains(v)).map(Duration::from_secs)
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v.to_lowercase() == "true" || v == "1")
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl BridgeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BridgeConfig {
        let mut config = BridgeConfig::default();

        if let Some(addr) = env_string("BRIDGE_BIND_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(value) => config.bind_addr = value,
                Err(e) => tracing::warn!(
                    "Failed to parse BRIDGE_BIND_ADDR '{}': {}, using default: {}",
                    addr,
                    e,
                    config.bind_addr
                ),
            }
        }

        if let Some(path) = env_string("ACCOUNT_REGISTRY_PATH") {
            config.registry_path = PathBuf::from(path);
        }

        if let Some(dir) = env_string("SNAPSHOT_DIR") {
            config.snapshot_dir = PathBuf::from(dir);
        }

        if let Some(pattern) = env_string("SNAPSHOT_FILE_PATTERN") {
            if pattern.contains("{login}") {
                config.snapshot_file_pattern = pattern;
            } else {
                tracing::warn!(
                    "SNAPSHOT_FILE_PATTERN '{}' has no {{login}} placeholder, using default: {}",
                    pattern,
                    config.snapshot_file_pattern
                );
            }
        }

        if let Some(value) = env_secs("SNAPSHOT_POLL_INTERVAL_SECONDS", 1, 3600) {
            config.poll_interval = value;
        }
        if let Some(value) = env_secs("WRITER_SYNC_INTERVAL_SECONDS", 1, 3600) {
            config.writer_sync_interval = value;
        }
        if let Some(value) = env_value::<u32>("STALENESS_MULTIPLIER", |v| (1..=100).contains(v)) {
            config.staleness_multiplier = value;
        }

        if let Some(enabled) = env_flag("WATCHDOG_ENABLED") {
            config.watchdog_enabled = enabled;
        }
        if let Some(value) = env_secs("WATCHDOG_INTERVAL_SECONDS", 1, 3600) {
            config.watchdog_interval = value;
        }
        if let Some(value) = env_value::<u32>("WATCHDOG_DEBOUNCE_CYCLES", |v| {
            (MIN_DEBOUNCE_CYCLES..=100).contains(v)
        }) {
            config.debounce_cycles = value;
        }

        if let Some(exes) = env_string("TERMINAL_EXECUTABLES") {
            // ';' separated so Windows drive letters survive
            config.terminal_executables = exes
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Some(args) = env_string("TERMINAL_ARGS") {
            config.terminal_args = args.split_whitespace().map(String::from).collect();
        }
        if let Some(cmd) = env_string("TERMINAL_STOP_COMMAND") {
            config.terminal_stop_command =
                Some(cmd.split_whitespace().map(String::from).collect());
        }
        if let Some(helper) = env_string("TERMINAL_LOGIN_HELPER") {
            config.login_helper = Some(PathBuf::from(helper));
        }

        if let Some(value) = env_secs("RECOVERY_STOP_GRACE_SECONDS", 0, 300) {
            config.stop_grace = value;
        }
        if let Some(value) = env_secs("RECOVERY_STOP_TIMEOUT_SECONDS", 1, 600) {
            config.stop_timeout = value;
        }
        if let Some(value) = env_value::<u32>("RECOVERY_STOP_ATTEMPTS", |v| (1..=10).contains(v)) {
            config.stop_attempts = value;
        }
        if let Some(value) = env_secs("RECOVERY_SETTLE_DELAY_SECONDS", 0, 300) {
            config.settle_delay = value;
        }
        if let Some(value) = env_secs("RECOVERY_START_TIMEOUT_SECONDS", 1, 600) {
            config.start_timeout = value;
        }
        if let Some(value) = env_value::<u32>("RECOVERY_START_ATTEMPTS", |v| (1..=10).contains(v))
        {
            config.start_attempts = value;
        }
        if let Some(value) = env_secs("RECOVERY_INIT_DELAY_SECONDS", 0, 600) {
            config.init_delay = value;
        }
        if let Some(value) = env_secs("RECOVERY_LOGIN_TIMEOUT_SECONDS", 1, 300) {
            config.login_timeout = value;
        }
        if let Some(value) = env_value::<u32>("RECOVERY_LOGIN_ATTEMPTS", |v| (1..=10).contains(v))
        {
            config.login_attempts = value;
        }
        if let Some(value) = env_secs("RECOVERY_VERIFICATION_TIMEOUT_SECONDS", 1, 1800) {
            config.verification_timeout = value;
        }
        if let Some(value) = env_secs("RECOVERY_VERIFICATION_POLL_SECONDS", 1, 300) {
            config.verification_poll = value;
        }
        if let Some(value) =
            env_value::<f64>("RECOVERY_VERIFICATION_TOLERANCE", |v| (0.0..=1.0).contains(v))
        {
            config.verification_tolerance = Some(value);
        }

        if let Some(value) =
            env_value::<u32>("RESTART_REQUESTS_PER_MINUTE", |v| (1..=600).contains(v))
        {
            config.restart_requests_per_minute = value;
        }
        if let Some(value) = env_value::<usize>("JOB_HISTORY_LIMIT", |v| (1..=10_000).contains(v)) {
            config.job_history_limit = value;
        }
        if let Some(url) = env_string("AUDIT_DATABASE_URL") {
            config.audit_database_url = Some(url);
        }

        config
    }

    /// Age after which a snapshot is flagged stale
    pub fn staleness_threshold(&self) -> Duration {
        self.writer_sync_interval * self.staleness_multiplier
    }

    /// Durations and retry counts for the recovery orchestrator
    pub fn recovery_plan(&self) -> RecoveryPlan {
        let mut plan = RecoveryPlan::default();
        plan.stop_grace = self.stop_grace;
        plan.stop_timeout = self.stop_timeout;
        plan.stop_attempts = self.stop_attempts;
        plan.settle_delay = self.settle_delay;
        plan.start_timeout = self.start_timeout;
        plan.start_attempts = self.start_attempts;
        plan.init_delay = self.init_delay;
        plan.login_timeout = self.login_timeout;
        plan.login_attempts = self.login_attempts;
        plan.verification_timeout = self.verification_timeout;
        plan.verification_poll = self.verification_poll;
        plan.baseline_tolerance = self.verification_tolerance;
        plan.staleness_threshold = self.staleness_threshold();
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.debounce_cycles, 2);
        assert_eq!(config.staleness_threshold(), Duration::from_secs(90));
        assert_eq!(config.snapshot_file_pattern, "account_{login}.json");
        assert!(config.terminal_executables.is_empty());
    }

    #[test]
    fn test_recovery_plan_mirrors_config() {
        let config = BridgeConfig {
            login_attempts: 5,
            settle_delay: Duration::from_secs(1),
            verification_tolerance: Some(0.05),
            ..BridgeConfig::default()
        };
        let plan = config.recovery_plan();
        assert_eq!(plan.login_attempts, 5);
        assert_eq!(plan.settle_delay, Duration::from_secs(1));
        assert_eq!(plan.baseline_tolerance, Some(0.05));
        assert_eq!(plan.staleness_threshold, Duration::from_secs(90));
    }

    #[test]
    fn test_env_overrides_and_range_checks() {
        std::env::set_var("WATCHDOG_DEBOUNCE_CYCLES", "4");
        std::env::set_var("STALENESS_MULTIPLIER", "0");
        std::env::set_var("TERMINAL_EXECUTABLES", r"C:\MT5\a\terminal64.exe; C:\MT5\b\terminal64.exe");
        let config = BridgeConfig::from_env();
        std::env::remove_var("WATCHDOG_DEBOUNCE_CYCLES");
        std::env::remove_var("STALENESS_MULTIPLIER");
        std::env::remove_var("TERMINAL_EXECUTABLES");

        assert_eq!(config.debounce_cycles, 4);
        assert_eq!(config.staleness_multiplier, 3);
        assert_eq!(config.terminal_executables.len(), 2);
    }
}
