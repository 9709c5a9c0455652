//! `serde`-deserialized staging structs
//!
//! Everything here is `Option`-heavy so a partial document (the common case
//! for a hand-edited TOML/JSON file) can be merged against defaults. These
//! are converted, fallibly, into the runtime types in `config::model` and
//! `config::Config`. Actually reading a file from disk or `argv` is an
//! external collaborator's job (see `spec.md` §1); this module only covers
//! the `Deserialize` surface an external loader hands a parsed document to.

use std::collections::HashMap;

use serde::Deserialize;

/// Top-level config document shape.
#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub models: HashMap<String, FileModelConfig>,
    #[serde(default)]
    pub groups: HashMap<String, FileGroupConfig>,
    #[serde(default)]
    pub macros: HashMap<String, String>,
    #[serde(default)]
    pub hooks: FileHooks,
    pub start_port: Option<u16>,
    pub health_check_timeout: Option<u64>,
    pub log_level: Option<String>,
    pub log_time_format: Option<String>,
    pub metrics_max_in_memory: Option<usize>,
    #[serde(default)]
    pub required_api_keys: Vec<String>,
    pub include_aliases_in_list: Option<bool>,
    #[serde(default)]
    pub optional_prefixes: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileHooks {
    #[serde(default)]
    pub on_startup: FileOnStartup,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileOnStartup {
    #[serde(default)]
    pub preload: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileModelConfig {
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "useModelName")]
    pub use_model_name: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub unlisted: bool,
    pub ttl: Option<u64>,
    #[serde(rename = "checkEndpoint")]
    pub check_endpoint: Option<String>,
    pub proxy: Option<String>,
    pub cmd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub filters: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct FileGroupConfig {
    #[serde(default)]
    pub swap: Option<bool>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default)]
    pub members: Vec<String>,
}
