//! Processing profiles: named personas with a prompt, a tool allowlist,
//! and a trust level.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tools::ToolRegistry;

/// Ordered trust. A profile may delegate only to profiles at or below
/// its own level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Standard,
    Privileged,
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Untrusted => "untrusted",
            Self::Standard => "standard",
            Self::Privileged => "privileged",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingProfile {
    pub name: String,
    pub system_prompt: String,
    /// Tools this profile may call, by registry name.
    pub tool_names: Vec<String>,
    /// Context providers consulted for this profile's turns. Empty means
    /// all registered providers.
    pub context_providers: Vec<String>,
    pub trust: TrustLevel,
    /// Override of the engine-wide round ceiling.
    pub max_rounds: Option<usize>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl ProcessingProfile {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            tool_names: Vec::new(),
            context_providers: Vec::new(),
            trust: TrustLevel::Standard,
            max_rounds: None,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tool_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_context_providers(
        mut self,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.context_providers = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_trust(mut self, trust: TrustLevel) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_max_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = Some(rounds);
        self
    }
}

#[derive(Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ProcessingProfile>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, profile: ProcessingProfile) -> Result<(), ConfigError> {
        if self.profiles.contains_key(&profile.name) {
            return Err(ConfigError::DuplicateRegistration {
                kind: "profile",
                name: profile.name,
            });
        }
        self.profiles.insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ProcessingProfile> {
        self.profiles.get(name)
    }

    /// Check every profile's tool allowlist against the registry, so a
    /// typo fails at startup rather than mid-turn.
    pub fn validate(&self, tools: &ToolRegistry) -> Result<(), ConfigError> {
        for profile in self.profiles.values() {
            for tool_name in &profile.tool_names {
                if !tools.has(tool_name) {
                    return Err(ConfigError::UnknownReference {
                        kind: "tool",
                        name: tool_name.clone(),
                        referrer: format!("profile {:?}", profile.name),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_levels_are_ordered() {
        assert!(TrustLevel::Untrusted < TrustLevel::Standard);
        assert!(TrustLevel::Standard < TrustLevel::Privileged);
    }

    #[test]
    fn duplicate_profiles_are_rejected() {
        let mut registry = ProfileRegistry::new();
        registry
            .register(ProcessingProfile::new("default", "be helpful"))
            .unwrap();
        assert!(matches!(
            registry.register(ProcessingProfile::new("default", "other")),
            Err(ConfigError::DuplicateRegistration { .. })
        ));
    }

    #[test]
    fn validate_catches_unknown_tool_references() {
        let mut registry = ProfileRegistry::new();
        registry
            .register(
                ProcessingProfile::new("default", "be helpful").with_tools(["no_such_tool"]),
            )
            .unwrap();

        let tools = ToolRegistry::new();
        assert!(matches!(
            registry.validate(&tools),
            Err(ConfigError::UnknownReference { .. })
        ));
    }
}
