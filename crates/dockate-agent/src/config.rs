use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "DOCKATE";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Host running the swarm manager (HTTP API and SSH).
    pub swarm_host: String,
    /// Port of the Docker Engine HTTP API.
    pub swarm_port_http: u16,
    /// Port of the SSH daemon on the manager.
    pub swarm_port_ssh: u16,
    #[serde(default)]
    pub swarm_username: Option<String>,
    /// `ssh` executable used for remote commands.
    pub ssh_binary: PathBuf,
    #[serde(default)]
    pub ssh_identity_file: Option<PathBuf>,
    pub ssh_host_key_checking: SshHostKeyChecking,
    pub ssh_connect_timeout_secs: u16,
    pub ssh_command_timeout_secs: u64,
    pub http_timeout_secs: u64,
    pub cycle_timeout_secs: u64,
    /// Pause between checks; zero or negative runs a single cycle.
    pub interval_between_check_services_ms: i64,
    /// Name of the built-in configuration consumer.
    pub consumer: String,
    #[serde(default)]
    pub consumer_settings: HashMap<String, String>,
    pub metrics_host: String,
    pub metrics_port: u16,
    pub serve_metrics: bool,
}

impl AppConfig {
    pub fn check_interval(&self) -> Option<Duration> {
        u64::try_from(self.interval_between_check_services_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn ssh_command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_command_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn orchestrator_url(&self) -> String {
        format!("http://{}:{}", self.swarm_host, self.swarm_port_http)
    }

    /// Fails when any of `keys` is missing from `consumer_settings`.
    pub fn check_consumer_settings(&self, keys: &[&str]) -> anyhow::Result<()> {
        let missing: Vec<&str> = keys
            .iter()
            .copied()
            .filter(|key| {
                self.consumer_settings
                    .get(*key)
                    .is_none_or(|value| value.trim().is_empty())
            })
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("Variables not detected : \"{}\"", missing.join("\", \""));
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.swarm_host.trim().is_empty() {
            anyhow::bail!("Variables not detected : \"swarm_host\"");
        }
        if self.swarm_port_http == 0 {
            anyhow::bail!("swarm_port_http must be > 0");
        }
        if self.swarm_port_ssh == 0 {
            anyhow::bail!("swarm_port_ssh must be > 0");
        }
        if self.ssh_command_timeout_secs == 0 {
            anyhow::bail!("ssh_command_timeout_secs must be > 0");
        }
        if self.http_timeout_secs == 0 {
            anyhow::bail!("http_timeout_secs must be > 0");
        }
        if self.cycle_timeout_secs == 0 {
            anyhow::bail!("cycle_timeout_secs must be > 0");
        }
        if self.consumer.trim().is_empty() {
            anyhow::bail!("consumer cannot be empty");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SshHostKeyChecking {
    /// Accept unknown host keys and add them to known_hosts.
    AcceptNew,
    /// Require the host key to already exist in known_hosts.
    Strict,
    /// Disable host key checking (insecure).
    Off,
}

impl SshHostKeyChecking {
    pub(crate) fn strict_host_key_checking_value(self) -> &'static str {
        match self {
            Self::AcceptNew => "accept-new",
            Self::Strict => "yes",
            Self::Off => "no",
        }
    }
}

enum EnvKind {
    String,
    Map,
}

// (ENV_NAME, config_key, kind)
const ENV_OVERRIDES: &[(&str, &str, EnvKind)] = &[
    ("DOCKATE_SWARM_HOST", "swarm_host", EnvKind::String),
    ("DOCKATE_SWARM_PORT_HTTP", "swarm_port_http", EnvKind::String),
    ("DOCKATE_SWARM_PORT_SSH", "swarm_port_ssh", EnvKind::String),
    ("DOCKATE_SWARM_USERNAME", "swarm_username", EnvKind::String),
    ("DOCKATE_SSH_BINARY", "ssh_binary", EnvKind::String),
    (
        "DOCKATE_SSH_IDENTITY_FILE",
        "ssh_identity_file",
        EnvKind::String,
    ),
    (
        "DOCKATE_SSH_HOST_KEY_CHECKING",
        "ssh_host_key_checking",
        EnvKind::String,
    ),
    (
        "DOCKATE_SSH_CONNECT_TIMEOUT_SECS",
        "ssh_connect_timeout_secs",
        EnvKind::String,
    ),
    (
        "DOCKATE_SSH_COMMAND_TIMEOUT_SECS",
        "ssh_command_timeout_secs",
        EnvKind::String,
    ),
    (
        "DOCKATE_HTTP_TIMEOUT_SECS",
        "http_timeout_secs",
        EnvKind::String,
    ),
    (
        "DOCKATE_CYCLE_TIMEOUT_SECS",
        "cycle_timeout_secs",
        EnvKind::String,
    ),
    (
        "DOCKATE_INTERVAL_BETWEEN_CHECK_SERVICES_MS",
        "interval_between_check_services_ms",
        EnvKind::String,
    ),
    ("DOCKATE_CONSUMER", "consumer", EnvKind::String),
    (
        "DOCKATE_CONSUMER_SETTINGS",
        "consumer_settings",
        EnvKind::Map,
    ),
    ("DOCKATE_METRICS_HOST", "metrics_host", EnvKind::String),
    ("DOCKATE_METRICS_PORT", "metrics_port", EnvKind::String),
    ("DOCKATE_SERVE_METRICS", "serve_metrics", EnvKind::String),
];

pub fn load() -> anyhow::Result<AppConfig> {
    load_with_file("config")
}

pub(crate) fn load_with_file(file: &str) -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name(file).required(false))
        .set_default("swarm_host", "")?
        .set_default("swarm_port_http", 2375)?
        .set_default("swarm_port_ssh", 22)?
        .set_default("swarm_username", Option::<String>::None)?
        .set_default("ssh_binary", "ssh")?
        .set_default("ssh_identity_file", Option::<String>::None)?
        .set_default("ssh_host_key_checking", "accept-new")?
        .set_default("ssh_connect_timeout_secs", 10)?
        .set_default("ssh_command_timeout_secs", 30)?
        .set_default("http_timeout_secs", 10)?
        .set_default("cycle_timeout_secs", 120)?
        .set_default("interval_between_check_services_ms", 10_000)?
        .set_default("consumer", "log")?
        .set_default("consumer_settings", HashMap::<String, String>::new())?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9092)?
        .set_default("serve_metrics", true)?;

    // Override with single-underscore environment variables.
    for (env_key, cfg_key, kind) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            match kind {
                EnvKind::Map => {
                    builder = builder.set_override(*cfg_key, parse_key_values(&value))?;
                }
                EnvKind::String => {
                    builder = builder.set_override(*cfg_key, value)?;
                }
            }
        }
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

fn parse_key_values(value: &str) -> HashMap<String, String> {
    let mut entries = HashMap::new();
    for entry in value.split(',') {
        let trimmed = entry.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some((k, v)) = trimmed.split_once('=') {
            entries.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    entries
}
