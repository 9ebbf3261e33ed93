// ABOUTME: Command-line arguments and resolved launch settings
// ABOUTME: Merges flags, environment keys and defaults, validating everything before launch

use clap::{Parser, ValueEnum};
use sandloop_config::constants::{
    DEFAULT_E2B_API_URL, DEFAULT_E2B_DOMAIN, DEFAULT_E2B_TEMPLATE, E2B_API_URL, E2B_DOMAIN,
    E2B_KEY_PREFIX, E2B_SANDBOX_TIMEOUT_SECS, E2B_TEMPLATE,
};
use sandloop_config::{
    env_keys, ConfigError, DelayRange, KeyRegistry, OperatingMode, TimingParameters,
    MAX_CONNECTION_ATTEMPTS,
};
use sandloop_sandbox::E2BConfig;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    /// Run for a random duration, shut down, cool down, repeat
    Cyclic,
    /// Start the workload once and leave the sandbox running
    Persistent,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Cyclic => OperatingMode::Cyclic,
            ModeArg::Persistent => OperatingMode::Persistent,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "sandloop")]
#[command(about = "Keep a pool of E2B sandboxes alive, one per API key")]
#[command(version)]
pub struct Cli {
    /// API key to launch a sandbox with (repeat for multiple keys)
    #[arg(long = "key", value_name = "E2B_API_KEY")]
    pub keys: Vec<String>,

    /// Shell command to run in each sandbox
    #[arg(long, conflicts_with = "cmd_file", required_unless_present = "cmd_file")]
    pub cmd: Option<String>,

    /// Read the shell command from a file
    #[arg(long, value_name = "PATH")]
    pub cmd_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "cyclic")]
    pub mode: ModeArg,

    /// Base URL of the E2B API
    #[arg(long, env = E2B_API_URL, default_value = DEFAULT_E2B_API_URL)]
    pub api_url: String,

    /// Domain sandboxes are served under
    #[arg(long, env = E2B_DOMAIN, default_value = DEFAULT_E2B_DOMAIN)]
    pub domain: String,

    /// Sandbox template to boot
    #[arg(long, env = E2B_TEMPLATE, default_value = DEFAULT_E2B_TEMPLATE)]
    pub template: String,

    /// Seconds the provider keeps an unattended sandbox alive
    #[arg(long, env = E2B_SANDBOX_TIMEOUT_SECS, default_value_t = 3600)]
    pub sandbox_timeout: u64,

    #[arg(long, default_value_t = 230, help = "Minimum run duration in seconds")]
    pub run_time_min: u64,

    #[arg(long, default_value_t = 340, help = "Maximum run duration in seconds")]
    pub run_time_max: u64,

    #[arg(long, default_value_t = 30, help = "Minimum cooldown in seconds")]
    pub downtime_min: u64,

    #[arg(long, default_value_t = 45, help = "Maximum cooldown in seconds")]
    pub downtime_max: u64,

    #[arg(long, default_value_t = 30, help = "Minimum pause between launches in seconds")]
    pub stagger_min: u64,

    #[arg(long, default_value_t = 45, help = "Maximum pause between launches in seconds")]
    pub stagger_max: u64,

    /// Minimum delay after a failed connection attempt (mode default when omitted)
    #[arg(long)]
    pub backoff_min: Option<u64>,

    /// Maximum delay after a failed connection attempt (mode default when omitted)
    #[arg(long)]
    pub backoff_max: Option<u64>,

    /// Connection attempts before a key is abandoned
    #[arg(long, default_value_t = MAX_CONNECTION_ATTEMPTS)]
    pub max_attempts: u32,

    /// Abandon a key on the first authentication failure
    #[arg(long)]
    pub abandon_on_auth_error: bool,

    /// Seed for reproducible timing
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to read command file {}: {source}", .path.display())]
    CommandFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Everything a launch needs, validated.
#[derive(Debug, Clone)]
pub struct Settings {
    pub keys: KeyRegistry,
    pub mode: OperatingMode,
    pub timing: TimingParameters,
    pub gateway: E2BConfig,
    pub command: String,
    pub abandon_on_auth_error: bool,
    pub seed: Option<u64>,
}

impl Settings {
    /// Resolve `cli` against the process environment `env`.
    ///
    /// Timing is validated before keys so a bad range is reported even when no
    /// keys are configured.
    pub fn resolve<I>(cli: Cli, env: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mode = OperatingMode::from(cli.mode);
        let timing = resolve_timing(&cli, mode)?;
        let command = resolve_command(&cli)?;
        let keys = KeyRegistry::build(env_keys(E2B_KEY_PREFIX, env), cli.keys)?;

        let gateway = E2BConfig {
            api_url: cli.api_url,
            domain: cli.domain,
            template: cli.template,
            sandbox_timeout: Duration::from_secs(cli.sandbox_timeout),
            ..Default::default()
        };

        Ok(Self {
            keys,
            mode,
            timing,
            gateway,
            command,
            abandon_on_auth_error: cli.abandon_on_auth_error,
            seed: cli.seed,
        })
    }
}

fn resolve_timing(cli: &Cli, mode: OperatingMode) -> Result<TimingParameters, ConfigError> {
    let defaults = TimingParameters::defaults_for(mode);
    let timing = TimingParameters {
        max_attempts: cli.max_attempts,
        backoff: DelayRange::new(
            "backoff",
            cli.backoff_min.unwrap_or(defaults.backoff.min_secs()),
            cli.backoff_max.unwrap_or(defaults.backoff.max_secs()),
        )?,
        stagger: DelayRange::new("stagger", cli.stagger_min, cli.stagger_max)?,
        run_time: DelayRange::new("run-time", cli.run_time_min, cli.run_time_max)?,
        downtime: DelayRange::new("downtime", cli.downtime_min, cli.downtime_max)?,
    };
    timing.validate()?;
    Ok(timing)
}

fn resolve_command(cli: &Cli) -> Result<String, SettingsError> {
    let command = match (&cli.cmd, &cli.cmd_file) {
        (Some(cmd), _) => cmd.clone(),
        (None, Some(path)) => {
            std::fs::read_to_string(path).map_err(|source| SettingsError::CommandFile {
                path: path.clone(),
                source,
            })?
        }
        (None, None) => String::new(),
    };

    if command.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            name: "cmd".to_string(),
            reason: "a non-empty command is required".to_string(),
        }
        .into());
    }
    Ok(command)
}
