//! Rate limit policies per operation category.
//!
//! Policies are loaded once at startup. Categories without an explicit entry
//! fall back to the default policy, so a lookup never fails.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::category::Category;
use crate::error::{AdmissionError, Result};

/// Limits applied to one category, counted per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Requests allowed in one minute bucket
    pub requests_per_minute: u64,
    /// Requests allowed in one hour bucket
    pub requests_per_hour: u64,
}

impl RateLimitPolicy {
    pub const fn new(requests_per_minute: u64, requests_per_hour: u64) -> Self {
        Self {
            requests_per_minute,
            requests_per_hour,
        }
    }
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self::new(120, 3000)
    }
}

/// Category name to policy mapping with a default fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    /// Policy for categories without an entry
    #[serde(default)]
    pub default: RateLimitPolicy,
    /// Policies keyed by category name
    #[serde(default)]
    pub categories: HashMap<String, RateLimitPolicy>,
}

impl PolicyTable {
    /// Create a table with only a default policy.
    pub fn new(default: RateLimitPolicy) -> Self {
        Self {
            default,
            categories: HashMap::new(),
        }
    }

    /// Add or replace the policy for a category.
    pub fn with_policy(mut self, category: impl Into<String>, policy: RateLimitPolicy) -> Self {
        self.categories.insert(category.into(), policy);
        self
    }

    /// Load a policy table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse rate limit policies: {}", e)))
    }

    /// Resolve the policy for a category name.
    pub fn policy_for(&self, category: &str) -> &RateLimitPolicy {
        self.categories.get(category).unwrap_or(&self.default)
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        PolicyTable::new(RateLimitPolicy::default())
            .with_policy(Category::Terminology.as_str(), RateLimitPolicy::new(100, 2000))
            .with_policy(Category::Records.as_str(), RateLimitPolicy::new(60, 1000))
            .with_policy(Category::Prescriptions.as_str(), RateLimitPolicy::new(20, 200))
            .with_policy(Category::Lab.as_str(), RateLimitPolicy::new(60, 1000))
            .with_policy(Category::General.as_str(), RateLimitPolicy::default())
    }
}
