//! The fixed memory taxonomy and the intent-to-weight retrieval profiles.
//!
//! Categories and subtypes are compile-time data; [`validate_subtype`] is the
//! single gate every write path goes through. The weight profiles drive the
//! context assembler's budget split across working memory and the
//! `<category>.<subtype>` pools.

use serde::{Deserialize, Serialize};

/// Top-level memory categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    /// What happened: events, decisions, conversations, outcomes.
    Episodic,
    /// Facts and knowledge: user, project, environment, domain, entity.
    Semantic,
    /// How to do things: workflows, patterns, tool usage, debugging.
    Procedural,
    /// Learned behaviors: communication, style, tools, boundaries.
    Preference,
}

impl MemoryCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Episodic => "episodic",
            Self::Semantic => "semantic",
            Self::Procedural => "procedural",
            Self::Preference => "preference",
        }
    }

    /// Valid subtypes for this category.
    pub fn subtypes(&self) -> &'static [&'static str] {
        match self {
            Self::Episodic => &["event", "decision", "conversation", "outcome"],
            Self::Semantic => &["user", "project", "environment", "domain", "entity"],
            Self::Procedural => &["workflow", "pattern", "tool_usage", "debugging"],
            Self::Preference => &["communication", "style", "tools", "boundaries"],
        }
    }

    pub const ALL: [MemoryCategory; 4] = [
        Self::Episodic,
        Self::Semantic,
        Self::Procedural,
        Self::Preference,
    ];
}

impl std::fmt::Display for MemoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MemoryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "episodic" => Ok(Self::Episodic),
            "semantic" => Ok(Self::Semantic),
            "procedural" => Ok(Self::Procedural),
            "preference" => Ok(Self::Preference),
            _ => Err(format!("unknown memory category: {s}")),
        }
    }
}

/// Check that `subtype` is legal for `category`.
pub fn validate_subtype(category: MemoryCategory, subtype: &str) -> bool {
    category.subtypes().contains(&subtype)
}

/// Query intents recognized by the context assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    HowTo,
    WhatHappened,
    WhatIs,
    Debug,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HowTo => "how_to",
            Self::WhatHappened => "what_happened",
            Self::WhatIs => "what_is",
            Self::Debug => "debug",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "how_to" => Ok(Self::HowTo),
            "what_happened" => Ok(Self::WhatHappened),
            "what_is" => Ok(Self::WhatIs),
            "debug" => Ok(Self::Debug),
            "general" => Ok(Self::General),
            _ => Err(format!("unknown intent: {s}")),
        }
    }
}

/// The key under which working memory appears in a weight profile.
pub const WORKING_MEMORY_KEY: &str = "working_memory";

/// Retrieval weight profile for a query intent.
///
/// Keys are `working_memory` or `<category>.<subtype>`; each profile sums to
/// approximately 1.0.
pub fn retrieval_weights(intent: Intent) -> &'static [(&'static str, f64)] {
    match intent {
        Intent::HowTo => &[
            (WORKING_MEMORY_KEY, 0.25),
            ("procedural.workflow", 0.25),
            ("procedural.pattern", 0.15),
            ("semantic.project", 0.15),
            ("semantic.entity", 0.10),
            ("preference.style", 0.05),
            ("episodic.decision", 0.05),
        ],
        Intent::WhatHappened => &[
            (WORKING_MEMORY_KEY, 0.20),
            ("episodic.decision", 0.30),
            ("episodic.event", 0.20),
            ("episodic.outcome", 0.15),
            ("semantic.project", 0.10),
            ("episodic.conversation", 0.05),
        ],
        Intent::WhatIs => &[
            (WORKING_MEMORY_KEY, 0.20),
            ("semantic.entity", 0.30),
            ("semantic.project", 0.20),
            ("semantic.domain", 0.15),
            ("semantic.environment", 0.10),
            ("episodic.decision", 0.05),
        ],
        Intent::Debug => &[
            (WORKING_MEMORY_KEY, 0.30),
            ("procedural.debugging", 0.25),
            ("episodic.outcome", 0.20),
            ("semantic.environment", 0.10),
            ("semantic.entity", 0.10),
            ("preference.tools", 0.05),
        ],
        Intent::General => &[
            (WORKING_MEMORY_KEY, 0.35),
            ("semantic.project", 0.15),
            ("episodic.decision", 0.15),
            ("semantic.entity", 0.10),
            ("procedural.workflow", 0.10),
            ("preference.communication", 0.10),
            ("semantic.user", 0.05),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_pairs_accepted() {
        assert!(validate_subtype(MemoryCategory::Episodic, "decision"));
        assert!(validate_subtype(MemoryCategory::Semantic, "entity"));
        assert!(validate_subtype(MemoryCategory::Procedural, "tool_usage"));
        assert!(validate_subtype(MemoryCategory::Preference, "boundaries"));
    }

    #[test]
    fn invalid_pairs_rejected() {
        assert!(!validate_subtype(MemoryCategory::Episodic, "workflow"));
        assert!(!validate_subtype(MemoryCategory::Procedural, "entity"));
        assert!(!validate_subtype(MemoryCategory::Semantic, "nonsense"));
    }

    #[test]
    fn category_round_trips() {
        for cat in MemoryCategory::ALL {
            let parsed: MemoryCategory = cat.as_str().parse().unwrap();
            assert_eq!(parsed, cat);
        }
        assert!("entity".parse::<MemoryCategory>().is_err());
    }

    #[test]
    fn intent_round_trips() {
        for intent in [
            Intent::HowTo,
            Intent::WhatHappened,
            Intent::WhatIs,
            Intent::Debug,
            Intent::General,
        ] {
            let parsed: Intent = intent.as_str().parse().unwrap();
            assert_eq!(parsed, intent);
        }
    }

    #[test]
    fn profiles_sum_to_one() {
        for intent in [
            Intent::HowTo,
            Intent::WhatHappened,
            Intent::WhatIs,
            Intent::Debug,
            Intent::General,
        ] {
            let total: f64 = retrieval_weights(intent).iter().map(|(_, w)| w).sum();
            assert!(
                (total - 1.0).abs() < 0.011,
                "{intent} profile sums to {total}"
            );
        }
    }

    #[test]
    fn profile_keys_are_valid_taxonomy_pairs() {
        for intent in [
            Intent::HowTo,
            Intent::WhatHappened,
            Intent::WhatIs,
            Intent::Debug,
            Intent::General,
        ] {
            for (key, _) in retrieval_weights(intent) {
                if *key == WORKING_MEMORY_KEY {
                    continue;
                }
                let (cat, sub) = key.split_once('.').expect("key must be category.subtype");
                let category: MemoryCategory = cat.parse().unwrap();
                assert!(validate_subtype(category, sub), "bad profile key {key}");
            }
        }
    }
}
