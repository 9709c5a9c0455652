//! Configuration snapshot
//!
//! `Config` is the validated, immutable view every other component reads
//! from. Parsing a file or `argv` into a [`file::FileConfig`] is an external
//! collaborator's job (see `spec.md` §1); this module only covers turning
//! that parsed document into something the rest of the crate can trust —
//! same two-layer split the teacher uses for `LoggingConfig::from_file`
//! (`config/observability.rs`), generalized to the whole document.

pub mod file;
pub mod model;

use std::collections::HashMap;

use thiserror::Error;

use file::FileConfig;
pub use model::{expand_template, GroupConfig, ModelConfig};

const DEFAULT_GROUP_ID: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate model id or alias: {0:?}")]
    DuplicateName(String),

    #[error("group {group:?} references unknown model {model:?}")]
    UnknownMember { group: String, model: String },

    #[error("model {0:?} belongs to more than one group")]
    DoubleAssigned(String),

    #[error("preload hook references unknown model {0:?}")]
    UnknownPreload(String),
}

/// Validated configuration snapshot, built once at startup and shared
/// read-only (`Arc<Config>`) across the manager, resolver, and groups.
#[derive(Debug, Clone)]
pub struct Config {
    pub models: HashMap<String, ModelConfig>,
    pub groups: HashMap<String, GroupConfig>,
    pub macros: HashMap<String, String>,
    pub preload: Vec<String>,
    pub start_port: u16,
    pub health_check_timeout: u64,
    pub log_level: String,
    pub log_time_format: String,
    pub metrics_max_in_memory: usize,
    pub required_api_keys: Vec<String>,
    pub include_aliases_in_list: bool,
    pub optional_prefixes: Vec<String>,
}

impl Config {
    /// Validate and assemble a [`FileConfig`] into a runtime [`Config`].
    ///
    /// Enforces the two invariants spec.md §3 calls out: the union of model
    /// ids and aliases is injective, and every model belongs to exactly one
    /// group (models not listed under any group fall into an implicit
    /// `default` group).
    pub fn try_from_file(file: FileConfig) -> Result<Self, ConfigError> {
        let mut models = HashMap::new();
        let mut names: HashMap<String, String> = HashMap::new(); // alias/id -> owning model id

        for (id, fm) in file.models {
            if names.contains_key(&id) {
                return Err(ConfigError::DuplicateName(id));
            }
            names.insert(id.clone(), id.clone());

            for alias in &fm.aliases {
                if names.contains_key(alias) {
                    return Err(ConfigError::DuplicateName(alias.clone()));
                }
                names.insert(alias.clone(), id.clone());
            }

            let model = ModelConfig {
                id: id.clone(),
                name: fm.name.unwrap_or_else(|| id.clone()),
                description: fm.description.unwrap_or_default(),
                use_model_name: fm.use_model_name,
                aliases: fm.aliases,
                unlisted: fm.unlisted,
                ttl: fm.ttl,
                check_endpoint: fm.check_endpoint.unwrap_or_else(|| "/health".to_string()),
                proxy: fm
                    .proxy
                    .unwrap_or_else(|| "http://127.0.0.1:${PORT}".to_string()),
                cmd: fm.cmd.unwrap_or_default(),
                env: fm.env.into_iter().collect(),
                filters: fm.filters,
            };
            models.insert(id, model);
        }

        let mut groups = HashMap::new();
        let mut assigned: HashMap<String, String> = HashMap::new(); // model id -> group id

        for (gid, fg) in file.groups {
            for member in &fg.members {
                if !models.contains_key(member) {
                    return Err(ConfigError::UnknownMember {
                        group: gid.clone(),
                        model: member.clone(),
                    });
                }
                if let Some(existing) = assigned.insert(member.clone(), gid.clone()) {
                    if existing != gid {
                        return Err(ConfigError::DoubleAssigned(member.clone()));
                    }
                }
            }

            groups.insert(
                gid.clone(),
                GroupConfig {
                    id: gid,
                    swap: fg.swap.unwrap_or(true),
                    exclusive: fg.exclusive,
                    persistent: fg.persistent,
                    members: fg.members,
                },
            );
        }

        let unassigned: Vec<String> = models
            .keys()
            .filter(|id| !assigned.contains_key(*id))
            .cloned()
            .collect();

        if !unassigned.is_empty() {
            groups
                .entry(DEFAULT_GROUP_ID.to_string())
                .or_insert_with(|| GroupConfig {
                    id: DEFAULT_GROUP_ID.to_string(),
                    ..Default::default()
                })
                .members
                .extend(unassigned);
        }

        for preload in &file.hooks.on_startup.preload {
            if !models.contains_key(preload) && !names.contains_key(preload) {
                return Err(ConfigError::UnknownPreload(preload.clone()));
            }
        }

        Ok(Config {
            models,
            groups,
            macros: file.macros,
            preload: file.hooks.on_startup.preload,
            start_port: file.start_port.unwrap_or(8081),
            health_check_timeout: file.health_check_timeout.unwrap_or(30),
            log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
            log_time_format: file.log_time_format.unwrap_or_else(|| "rfc3339".to_string()),
            metrics_max_in_memory: file.metrics_max_in_memory.unwrap_or(1000),
            required_api_keys: file.required_api_keys,
            include_aliases_in_list: file.include_aliases_in_list.unwrap_or(false),
            optional_prefixes: file.optional_prefixes,
        })
    }

    /// The group owning a given model id, if configured. Every model is
    /// guaranteed a group after `try_from_file` (default-group absorption),
    /// so this only returns `None` for an id that isn't a configured model.
    pub fn group_for_model(&self, model_id: &str) -> Option<&GroupConfig> {
        self.groups.values().find(|g| g.has_member(model_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use file::{FileConfig, FileGroupConfig, FileModelConfig};

    fn model(cmd: &str) -> FileModelConfig {
        FileModelConfig {
            cmd: Some(cmd.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn unassigned_models_absorbed_into_default_group() {
        let mut file = FileConfig::default();
        file.models.insert("a/m1".to_string(), model("run-m1"));
        let config = Config::try_from_file(file).unwrap();
        let group = config.group_for_model("a/m1").unwrap();
        assert_eq!(group.id, "default");
    }

    #[test]
    fn duplicate_alias_rejected() {
        let mut file = FileConfig::default();
        let mut m1 = model("run-m1");
        m1.aliases.push("shared".to_string());
        let mut m2 = model("run-m2");
        m2.aliases.push("shared".to_string());
        file.models.insert("a/m1".to_string(), m1);
        file.models.insert("a/m2".to_string(), m2);
        assert!(matches!(
            Config::try_from_file(file),
            Err(ConfigError::DuplicateName(_))
        ));
    }

    #[test]
    fn group_referencing_unknown_member_rejected() {
        let mut file = FileConfig::default();
        file.groups.insert(
            "g1".to_string(),
            FileGroupConfig {
                members: vec!["ghost".to_string()],
                ..Default::default()
            },
        );
        assert!(matches!(
            Config::try_from_file(file),
            Err(ConfigError::UnknownMember { .. })
        ));
    }

    #[test]
    fn model_in_two_groups_rejected() {
        let mut file = FileConfig::default();
        file.models.insert("a/m1".to_string(), model("run-m1"));
        file.groups.insert(
            "g1".to_string(),
            FileGroupConfig {
                members: vec!["a/m1".to_string()],
                ..Default::default()
            },
        );
        file.groups.insert(
            "g2".to_string(),
            FileGroupConfig {
                members: vec!["a/m1".to_string()],
                ..Default::default()
            },
        );
        assert!(matches!(
            Config::try_from_file(file),
            Err(ConfigError::DoubleAssigned(_))
        ));
    }

    #[test]
    fn group_swap_defaults_to_true() {
        let mut file = FileConfig::default();
        file.models.insert("a/m1".to_string(), model("run-m1"));
        file.groups.insert(
            "g1".to_string(),
            FileGroupConfig {
                members: vec!["a/m1".to_string()],
                ..Default::default()
            },
        );
        let config = Config::try_from_file(file).unwrap();
        assert!(config.groups["g1"].swap);
    }
}
