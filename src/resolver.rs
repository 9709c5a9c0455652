//! Model Resolver (C5): maps a requested name to a canonical model id and
//! its owning group.
//!
//! Grounded on `config/routing.rs`'s `ClientsConfig::get_client_*`
//! resolution-chain style (exact match first, derived fallback second) and
//! `proxy/translation/detection.rs`'s path/body-inspecting `FormatDetector`.

use std::collections::HashMap;

use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub model_id: String,
    pub group_id: String,
}

pub struct Resolver<'a> {
    config: &'a Config,
    /// id/alias -> model id, built once and reused across lookups.
    names: HashMap<&'a str, &'a str>,
}

impl<'a> Resolver<'a> {
    pub fn new(config: &'a Config) -> Self {
        let mut names = HashMap::new();
        for (id, model) in &config.models {
            names.insert(id.as_str(), id.as_str());
            for alias in &model.aliases {
                names.insert(alias.as_str(), id.as_str());
            }
        }
        Self { config, names }
    }

    fn resolve_one(&self, requested: &str, allow_prefix_fuzz: bool) -> Option<&'a str> {
        if let Some(id) = self.names.get(requested) {
            return Some(id);
        }
        if allow_prefix_fuzz {
            for prefix in &self.config.optional_prefixes {
                if let Some(trimmed) = requested.strip_prefix(prefix.as_str()) {
                    if let Some(id) = self.names.get(trimmed) {
                        return Some(id);
                    }
                }
            }
        }
        None
    }

    /// Resolve an explicit name (exact id/alias match, then optional prefix
    /// fuzzing). Returns `None` on no match, per spec.md §4.2 step 4.
    pub fn resolve(&self, requested: &str, allow_prefix_fuzz: bool) -> Option<Resolved> {
        let model_id = self.resolve_one(requested, allow_prefix_fuzz)?;
        let group_id = self
            .config
            .group_for_model(model_id)
            .map(|g| g.id.as_str())
            .unwrap_or("default");
        Some(Resolved {
            model_id: model_id.to_string(),
            group_id: group_id.to_string(),
        })
    }

    /// Greedily walk `/`-joined path segments, extending the candidate
    /// name until a match is found or segments run out. Returns the matched
    /// model plus the remainder of the path to forward upstream.
    pub fn resolve_path<'p>(&self, path: &'p str) -> Option<(Resolved, &'p str)> {
        let trimmed = path.trim_start_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();

        for split in (1..=segments.len()).rev() {
            let candidate = segments[..split].join("/");
            if let Some(resolved) = self.resolve(&candidate, false) {
                let consumed = segments[..split].join("/").len();
                let remainder = &trimmed[consumed.min(trimmed.len())..];
                return Some((resolved, remainder.trim_start_matches('/')));
            }
        }
        None
    }

    /// When the request body carries no `model` field: the first Ready
    /// process, else the first Starting, else `None`.
    pub fn fallback<'p>(
        &self,
        processes: impl Iterator<Item = (&'p str, crate::process::State)>,
    ) -> Option<String> {
        let mut starting = None;
        for (id, state) in processes {
            match state {
                crate::process::State::Ready => return Some(id.to_string()),
                crate::process::State::Starting if starting.is_none() => {
                    starting = Some(id.to_string());
                }
                _ => {}
            }
        }
        starting
    }
}

/// Remove the named top-level JSON fields from a request body in place.
pub fn strip_params(body: &mut serde_json::Value, filters: &[String]) {
    if let serde_json::Value::Object(map) = body {
        for name in filters {
            map.remove(name);
        }
    }
}

/// Rewrite the `"model"` field to `use_model_name` if configured and
/// non-empty, otherwise leave the requested name untouched.
pub fn rewrite_model_field(body: &mut serde_json::Value, use_model_name: &Option<String>) {
    if let Some(name) = use_model_name {
        if !name.is_empty() {
            if let serde_json::Value::Object(map) = body {
                map.insert("model".to_string(), serde_json::Value::String(name.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::{FileConfig, FileModelConfig};

    fn config_with(models: Vec<(&str, Vec<&str>)>) -> Config {
        let mut file = FileConfig::default();
        for (id, aliases) in models {
            file.models.insert(
                id.to_string(),
                FileModelConfig {
                    cmd: Some("true".to_string()),
                    aliases: aliases.into_iter().map(String::from).collect(),
                    ..Default::default()
                },
            );
        }
        Config::try_from_file(file).unwrap()
    }

    #[test]
    fn resolves_exact_id() {
        let config = config_with(vec![("author/m1", vec![])]);
        let resolver = Resolver::new(&config);
        let resolved = resolver.resolve("author/m1", false).unwrap();
        assert_eq!(resolved.model_id, "author/m1");
    }

    #[test]
    fn resolves_alias() {
        let config = config_with(vec![("author/m1", vec!["m1"])]);
        let resolver = Resolver::new(&config);
        let resolved = resolver.resolve("m1", false).unwrap();
        assert_eq!(resolved.model_id, "author/m1");
    }

    #[test]
    fn unknown_name_fails() {
        let config = config_with(vec![("author/m1", vec![])]);
        let resolver = Resolver::new(&config);
        assert!(resolver.resolve("ghost", false).is_none());
    }

    #[test]
    fn path_walker_matches_longest_segment_prefix() {
        let config = config_with(vec![("author/m1", vec![])]);
        let resolver = Resolver::new(&config);
        let (resolved, remainder) = resolver.resolve_path("/author/m1/v1/chat/completions").unwrap();
        assert_eq!(resolved.model_id, "author/m1");
        assert_eq!(remainder, "v1/chat/completions");
    }

    #[test]
    fn strip_params_removes_named_fields() {
        let mut body = serde_json::json!({"model": "x", "stop": ["a"], "keep": 1});
        strip_params(&mut body, &["stop".to_string()]);
        assert!(body.get("stop").is_none());
        assert!(body.get("keep").is_some());
    }

    #[test]
    fn rewrite_model_field_applies_when_set() {
        let mut body = serde_json::json!({"model": "alias"});
        rewrite_model_field(&mut body, &Some("real/model".to_string()));
        assert_eq!(body["model"], "real/model");
    }

    #[test]
    fn rewrite_model_field_noop_when_empty() {
        let mut body = serde_json::json!({"model": "alias"});
        rewrite_model_field(&mut body, &Some(String::new()));
        assert_eq!(body["model"], "alias");
    }
}
