use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use serde::Deserialize;

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";
const DEFAULT_BIND_PORT: u16 = 5002;
const DEFAULT_MAX_BODY_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_TIMEOUT_SECS: u64 = 45;
const DEFAULT_PROGRAM_SUFFIX: &str = ".py";

#[derive(Parser)]
#[command(name = "evald", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c')]
    pub config_path: Option<String>,

    /// Whether to remove stale workspace files left in the scratch directory
    #[arg(long = "flush-scratch", short = 'f', default_value_t = false)]
    pub flush_scratch: bool,
}

impl CliArgs {
    /// Load the configuration from the specified file, or defaults if none was given
    pub fn to_config(&self) -> std::io::Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
    /// Largest accepted JSON request body; CSV payloads run to tens of MiB
    pub max_body_bytes: Option<usize>,
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    pub fn bind_port(&self) -> u16 {
        self.bind_port.unwrap_or(DEFAULT_BIND_PORT)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes.unwrap_or(DEFAULT_MAX_BODY_BYTES)
    }
}

/// Raw evaluation settings as they appear in the configuration file
#[derive(Deserialize, Debug, Default)]
pub struct EvaluationConfig {
    pub interpreter: Option<Vec<String>>,
    pub timeout_secs: Option<u64>,
    pub scratch_dir: Option<String>,
    pub program_suffix: Option<String>,
}

impl EvaluationConfig {
    /// Resolves defaults and validates the settings
    pub fn resolve(self) -> Result<EvaluatorConfig> {
        let interpreter = self
            .interpreter
            .unwrap_or_else(|| vec!["python3".to_string()]);
        if interpreter.is_empty() || interpreter[0].is_empty() {
            bail!("The evaluation interpreter command must not be empty");
        }

        let timeout_secs = self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            bail!("The evaluation timeout must not be 0");
        }

        let scratch_dir = match self.scratch_dir {
            Some(dir) => PathBuf::from(dir),
            None => default_scratch_dir()?,
        };

        Ok(EvaluatorConfig {
            interpreter,
            timeout: Duration::from_secs(timeout_secs),
            scratch_dir,
            program_suffix: self
                .program_suffix
                .unwrap_or_else(|| DEFAULT_PROGRAM_SUFFIX.to_string()),
        })
    }
}

/// Settings the evaluator runs with
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Command prefix used to launch the evaluation program, e.g. `["python3"]`
    pub interpreter: Vec<String>,
    /// Wall-clock limit for one run of the evaluation program
    pub timeout: Duration,
    /// Shared directory holding the transient workspace files
    pub scratch_dir: PathBuf,
    /// File name suffix of the written evaluation program
    pub program_suffix: String,
}

fn default_scratch_dir() -> Result<PathBuf> {
    use directories::ProjectDirs;

    let proj_dirs = ProjectDirs::from("", "", "evald")
        .ok_or_else(|| anyhow!("Unable to find user directory"))?;

    Ok(proj_dirs.cache_dir().join("scratch"))
}
