//! Raw, unvalidated shape of the TOML configuration file.
//!
//! These structs mirror the file one to one; [`super::Config`] is built from
//! them once and is the only form the engine ever sees.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub general: GeneralFile,
    #[serde(default)]
    pub target: TargetFile,
    #[serde(default, rename = "keyspace")]
    pub keyspaces: Vec<KeyspaceFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GeneralFile {
    pub protocol: String,
    /// seconds
    pub interval: u64,
    pub windows: u64,
    pub clients: u64,
    pub poolsize: u64,
    #[serde(default)]
    pub tcp_nodelay: bool,
    /// microseconds
    pub request_timeout: u64,
    /// microseconds
    pub connect_timeout: u64,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetFile {
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyspaceFile {
    pub length: u64,
    pub count: u64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub commands: Vec<CommandFile>,
    #[serde(default)]
    pub values: Vec<ValueFile>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandFile {
    pub action: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    pub watermark_low: Option<u64>,
    pub watermark_high: Option<u64>,
    pub items: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValueFile {
    pub length: u64,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_class")]
    pub class: String,
}

fn default_weight() -> f64 {
    1.0
}

fn default_class() -> String {
    "bytes".to_owned()
}
