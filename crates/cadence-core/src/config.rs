use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_TICK_MS: u64 = 1_000;
pub const DEFAULT_MAX_TRIGGER_DEPTH: u32 = 16;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 64 * 1024;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// How job payloads are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Working-directory root. Relative script paths resolve against it and
    /// it is the fallback cwd when a job has no usable script directory.
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    /// Interpreter used for both script files and inline source.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Flag that makes the interpreter read source from the next argument.
    #[serde(default = "default_inline_flag")]
    pub inline_flag: String,
    /// Kill the child after this many seconds. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Per-stream cap on captured output; longer output keeps head and tail.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            interpreter: default_interpreter(),
            inline_flag: default_inline_flag(),
            timeout_secs: None,
            max_output_chars: DEFAULT_MAX_OUTPUT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Timer loop resolution.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Upper bound on reactive chain length started by a single completion.
    #[serde(default = "default_max_trigger_depth")]
    pub max_trigger_depth: u32,
    /// Rebuild last known outcomes from run history at startup.
    ///
    /// Off by default: a restart forgets upstream outcomes, so reactive jobs
    /// wait until their upstream jobs complete again.
    #[serde(default)]
    pub restore_outcomes: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_TICK_MS,
            max_trigger_depth: DEFAULT_MAX_TRIGGER_DEPTH,
            restore_outcomes: false,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_tick_ms() -> u64 {
    DEFAULT_TICK_MS
}
fn default_max_trigger_depth() -> u32 {
    DEFAULT_MAX_TRIGGER_DEPTH
}
fn default_max_output_chars() -> usize {
    DEFAULT_MAX_OUTPUT_CHARS
}
fn default_interpreter() -> String {
    "python3".to_string()
}
fn default_inline_flag() -> String {
    "-c".to_string()
}
fn default_root_dir() -> String {
    std::env::current_dir()
        .ok()
        .and_then(|p| p.to_str().map(str::to_string))
        .unwrap_or_else(|| ".".to_string())
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `CADENCE_RUNTIME__INTERPRETER`.
    /// A missing file is not an error: every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}
