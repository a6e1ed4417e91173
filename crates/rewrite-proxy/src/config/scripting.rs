//! Script directory, sandbox limits and pool configuration.

use serde::{Deserialize, Serialize};

/// Directory scanned when neither the config file nor `SCRIPTS_DIR` sets one.
pub const DEFAULT_SCRIPTS_DIR: &str = "/etc/rewrite-proxy/scripts";

/// Suffix that marks a file in the script directory as a transformation script.
pub const DEFAULT_SCRIPT_SUFFIX: &str = ".rhai";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptsConfig {
    #[serde(default = "default_scripts_dir")]
    pub dir: String,
    #[serde(default = "default_script_suffix")]
    pub suffix: String,
    /// Time budget for a single `modify` invocation
    #[serde(default = "default_script_timeout_ms")]
    pub timeout_ms: u64,
    /// Interpreter operation limit per invocation (0 = unlimited)
    #[serde(default)]
    pub max_operations: u64,
    #[serde(default)]
    pub pool: ScriptPoolConfigFile,
}

fn default_scripts_dir() -> String {
    DEFAULT_SCRIPTS_DIR.to_string()
}

fn default_script_suffix() -> String {
    DEFAULT_SCRIPT_SUFFIX.to_string()
}

fn default_script_timeout_ms() -> u64 {
    1000
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: default_scripts_dir(),
            suffix: default_script_suffix(),
            timeout_ms: default_script_timeout_ms(),
            max_operations: 0,
            pool: ScriptPoolConfigFile::default(),
        }
    }
}

/// Script pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScriptPoolConfigFile {
    /// Number of worker threads (0 = auto-detect: num_cpus/2, min 2, max 16)
    #[serde(default = "default_script_pool_workers")]
    pub workers: usize,
    /// Maximum queue size for pending transactions
    #[serde(default = "default_script_pool_queue_size")]
    pub queue_size: usize,
    /// Ceiling in milliseconds for running every script against one transaction
    #[serde(default = "default_script_pool_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_script_pool_workers() -> usize {
    0
} // 0 = auto-detect

fn default_script_pool_queue_size() -> usize {
    1000
}

fn default_script_pool_timeout_ms() -> u64 {
    5000
}

impl Default for ScriptPoolConfigFile {
    fn default() -> Self {
        Self {
            workers: default_script_pool_workers(),
            queue_size: default_script_pool_queue_size(),
            timeout_ms: default_script_pool_timeout_ms(),
        }
    }
}
