//! Request path classification into operation categories.
//!
//! Classification is an ordered list of rules; the first rule with a pattern
//! contained in the lowercased path decides the category. Terminology rules
//! come first because terminology endpoints often live under resource paths
//! that other rules would also match.

use serde::{Deserialize, Serialize};

/// Operation category used to select a rate limit policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// Code system and value set lookups
    Terminology,
    /// Clinical record reads
    Records,
    /// Prescription writes
    Prescriptions,
    /// Lab results
    Lab,
    /// Everything else
    General,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Terminology => "terminology",
            Category::Records => "records",
            Category::Prescriptions => "prescriptions",
            Category::Lab => "lab",
            Category::General => "general",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryRule {
    /// The category assigned when any pattern matches
    pub category: Category,
    /// Substrings to look for in the lowercased path
    pub patterns: Vec<String>,
}

impl CategoryRule {
    pub fn new(category: Category, patterns: &[&str]) -> Self {
        Self {
            category,
            patterns: patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
        }
    }

    /// Check whether this rule matches an already-lowercased path.
    pub fn matches(&self, normalized_path: &str) -> bool {
        self.patterns
            .iter()
            .any(|pattern| normalized_path.contains(pattern.as_str()))
    }
}

/// Maps request paths to categories.
#[derive(Debug, Clone)]
pub struct CategoryClassifier {
    rules: Vec<CategoryRule>,
}

impl CategoryClassifier {
    /// Create a classifier from an ordered rule list.
    pub fn new(rules: Vec<CategoryRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| CategoryRule {
                category: rule.category,
                patterns: rule.patterns.iter().map(|p| p.to_ascii_lowercase()).collect(),
            })
            .collect();
        Self { rules }
    }

    /// The built-in rule order.
    pub fn default_rules() -> Vec<CategoryRule> {
        vec![
            CategoryRule::new(
                Category::Terminology,
                &[
                    "/terminology",
                    "/rxnorm",
                    "/snomed",
                    "/loinc",
                    "/icd",
                    "/valueset",
                    "/codesystem",
                ],
            ),
            CategoryRule::new(
                Category::Prescriptions,
                &["/prescription", "/medicationrequest", "/medication"],
            ),
            CategoryRule::new(
                Category::Lab,
                &["/lab", "/observation", "/diagnosticreport"],
            ),
            CategoryRule::new(
                Category::Records,
                &["/patient", "/record", "/encounter", "/condition", "/allergy"],
            ),
        ]
    }

    /// Classify a request path. Unmatched paths are `General`.
    pub fn classify(&self, path: &str) -> Category {
        let normalized = path.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&normalized))
            .map(|rule| rule.category)
            .unwrap_or(Category::General)
    }

    pub fn rules(&self) -> &[CategoryRule] {
        &self.rules
    }
}

impl Default for CategoryClassifier {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}
