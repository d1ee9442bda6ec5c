use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the deployment manager
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Build, start and supervision settings
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Where component sources are resolved from
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Deployment record persistence
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeployConfig {
    /// Directory holding one materialized project per project id
    #[serde(default = "default_base_dir")]
    pub base_dir: PathBuf,

    /// First port the allocator tries
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,

    /// Number of candidate ports scanned before giving up
    #[serde(default = "default_port_scan_limit")]
    pub port_scan_limit: u16,

    /// Dependency install command, run before the build (empty to skip)
    #[serde(default = "default_install_command")]
    pub install_command: String,

    /// Build command, run in the project directory
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Production server command; `{port}` is replaced with the assigned port
    #[serde(default = "default_start_command")]
    pub start_command: String,

    /// Directory (relative to the project) the build writes its output to
    #[serde(default = "default_build_output_dir")]
    pub build_output_dir: String,

    /// Deadline covering install and build together
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// How long to wait for a started server to answer
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    /// Interval between readiness probes
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Timeout of a single liveness probe
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_stop_grace_period")]
    pub stop_grace_period_secs: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            port_range_start: default_port_range_start(),
            port_scan_limit: default_port_scan_limit(),
            install_command: default_install_command(),
            build_command: default_build_command(),
            start_command: default_start_command(),
            build_output_dir: default_build_output_dir(),
            build_timeout_secs: default_build_timeout(),
            health_timeout_secs: default_health_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
            stop_grace_period_secs: default_stop_grace_period(),
        }
    }
}

impl DeployConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_secs)
    }

    /// Validate the deploy section
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (name, command, required) in [
            ("install_command", &self.install_command, false),
            ("build_command", &self.build_command, true),
            ("start_command", &self.start_command, true),
        ] {
            match shell_words::split(command) {
                Ok(words) if words.is_empty() && required => {
                    errors.push(format!("deploy.{} must not be empty", name));
                }
                Ok(_) => {}
                Err(e) => errors.push(format!("deploy.{} cannot be parsed: {}", name, e)),
            }
        }

        if self.port_range_start == 0 {
            errors.push("deploy.port_range_start must be greater than 0".to_string());
        }
        if self.port_scan_limit == 0 {
            errors.push("deploy.port_scan_limit must be greater than 0".to_string());
        }
        if self.build_output_dir.trim().is_empty() {
            errors.push("deploy.build_output_dir must not be empty".to_string());
        }

        for (name, value) in [
            ("build_timeout_secs", self.build_timeout_secs),
            ("health_timeout_secs", self.health_timeout_secs),
            ("health_poll_interval_ms", self.health_poll_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("deploy.{} must be greater than 0", name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Root of the component sources, laid out as `<category>/<Name>.<extension>`
    #[serde(default = "default_components_dir")]
    pub components_dir: PathBuf,

    /// File extension of component sources
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Module prefixes holding the builder's own type definitions
    #[serde(default = "default_type_modules")]
    pub type_modules: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            components_dir: default_components_dir(),
            extension: default_extension(),
            type_modules: default_type_modules(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// Default value functions
fn default_base_dir() -> PathBuf {
    PathBuf::from("./deployments")
}

fn default_port_range_start() -> u16 {
    55550
}

fn default_port_scan_limit() -> u16 {
    5000
}

fn default_install_command() -> String {
    "npm install --no-audit --no-fund".to_string()
}

fn default_build_command() -> String {
    "npm run build".to_string()
}

fn default_start_command() -> String {
    "npm run start -- -p {port}".to_string()
}

fn default_build_output_dir() -> String {
    ".next".to_string()
}

fn default_build_timeout() -> u64 {
    120 // 2 minutes for install + build
}

fn default_health_timeout() -> u64 {
    30
}

fn default_health_poll_interval() -> u64 {
    500
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_stop_grace_period() -> u64 {
    5
}

fn default_components_dir() -> PathBuf {
    PathBuf::from("./components")
}

fn default_extension() -> String {
    "tsx".to_string()
}

fn default_type_modules() -> Vec<String> {
    vec!["@/types".to_string(), "@/lib/registry".to_string()]
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./sitedeploy.db")
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.deploy.validate().err().unwrap_or_default();

        if self.registry.extension.trim().is_empty() {
            errors.push("registry.extension must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
