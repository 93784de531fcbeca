//! `${name}` placeholder expansion for store parameters.

use crate::config::PoolConfig;
use crate::record::StoreRecord;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([^}]+)\}").expect("placeholder pattern is valid")
});

/// Resolves placeholders from configured properties, then the process
/// environment. Unknown placeholders are left as written.
#[derive(Debug, Clone, Default)]
pub struct ParameterExpander {
    enabled: bool,
    properties: BTreeMap<String, String>,
}

impl ParameterExpander {
    pub fn new(enabled: bool, properties: BTreeMap<String, String>) -> Self {
        ParameterExpander {
            enabled,
            properties,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.allow_env_parametrization, config.properties.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.properties
            .get(name)
            .cloned()
            .or_else(|| std::env::var(name).ok())
    }

    /// Expand every placeholder in `value`.
    pub fn expand(&self, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }
        PLACEHOLDER
            .replace_all(value, |caps: &Captures<'_>| {
                self.resolve(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    /// Copy of `store` with expanded parameters. The catalog's record is
    /// left untouched.
    pub fn expand_store(&self, store: &StoreRecord) -> StoreRecord {
        let mut expanded = store.clone();
        if self.enabled {
            for value in expanded.params.values_mut() {
                *value = self.expand(value);
            }
        }
        expanded
    }
}
