//! Include/exclude filtering of component types.
//!
//! Patterns are shell-style wildcards (`*`, `?`, `[..]`), matched
//! case-insensitively against the component name or its namespace.
//! Exclude rules win over include rules. When any include rule is
//! configured, a type must match at least one of them. Decisions are
//! memoised per type, so after the first sighting the filter costs one map
//! lookup.

use std::any::TypeId;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};

use crate::component::ComponentType;
use crate::error::ConfigError;
use crate::sharded::ShardedMap;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: false,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Wildcard rules, as written in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub include_components: Vec<String>,
    pub exclude_components: Vec<String>,
    pub include_namespaces: Vec<String>,
    pub exclude_namespaces: Vec<String>,
}

impl FilterConfig {
    /// Check that every pattern compiles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        compile_all(&self.include_components)?;
        compile_all(&self.exclude_components)?;
        compile_all(&self.include_namespaces)?;
        compile_all(&self.exclude_namespaces)?;
        Ok(())
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Pattern>, ConfigError> {
    patterns
        .iter()
        .map(|raw| {
            Pattern::new(raw.trim()).map_err(|err| ConfigError::InvalidPattern {
                pattern: raw.clone(),
                reason: err.msg.to_string(),
            })
        })
        .collect()
}

fn any_match(patterns: &[Pattern], candidate: &str) -> bool {
    patterns
        .iter()
        .any(|p| p.matches_with(candidate, MATCH_OPTIONS))
}

/// Compiled filter with a per-type decision cache.
#[derive(Debug)]
pub struct ComponentFilter {
    include_components: Vec<Pattern>,
    exclude_components: Vec<Pattern>,
    include_namespaces: Vec<Pattern>,
    exclude_namespaces: Vec<Pattern>,
    decisions: ShardedMap<TypeId, bool>,
}

impl Default for ComponentFilter {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl ComponentFilter {
    /// Compile the configured patterns.
    pub fn new(config: &FilterConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            include_components: compile_all(&config.include_components)?,
            exclude_components: compile_all(&config.exclude_components)?,
            include_namespaces: compile_all(&config.include_namespaces)?,
            exclude_namespaces: compile_all(&config.exclude_namespaces)?,
            decisions: ShardedMap::new(),
        })
    }

    /// Filter that accepts every type.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            include_components: Vec::new(),
            exclude_components: Vec::new(),
            include_namespaces: Vec::new(),
            exclude_namespaces: Vec::new(),
            decisions: ShardedMap::new(),
        }
    }

    /// Whether renders of `ty` should be tracked.
    pub fn should_track(&self, ty: ComponentType) -> bool {
        if let Some(decision) = self.decisions.get(&ty.id()) {
            return decision;
        }
        let decision = self.evaluate(ty);
        self.decisions.insert(ty.id(), decision);
        decision
    }

    fn evaluate(&self, ty: ComponentType) -> bool {
        let name = ty.name();
        let namespace = ty.namespace();

        if any_match(&self.exclude_components, name)
            || any_match(&self.exclude_namespaces, namespace)
        {
            return false;
        }
        let has_includes =
            !self.include_components.is_empty() || !self.include_namespaces.is_empty();
        if !has_includes {
            return true;
        }
        any_match(&self.include_components, name) || any_match(&self.include_namespaces, namespace)
    }

    /// Number of memoised decisions.
    #[must_use]
    pub fn cached_decisions(&self) -> usize {
        self.decisions.len()
    }
}
