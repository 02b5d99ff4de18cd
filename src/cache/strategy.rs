//! Strategy Registry
//!
//! Maps semantic data categories (the first namespace segment of a key) to
//! caching policy: TTL, compression, warm eligibility, sliding expiration and
//! the tiers a write lands in.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::entry::category_of;
use super::tier::TierKind;

/// Caching policy for one category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    /// Category the policy applies to
    pub category: String,
    /// TTL when the caller supplies none
    #[serde(with = "crate::config::duration")]
    pub ttl: Duration,
    /// Compress values above the codec threshold
    pub compression: bool,
    /// May be populated by the warmer
    pub warm_eligible: bool,
    /// Refresh TTL on every read
    pub sliding: bool,
    /// Tiers a write lands in (only configured tiers are used)
    pub tiers: Vec<TierKind>,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            category: String::new(),
            ttl: Duration::from_secs(300),
            compression: true,
            warm_eligible: true,
            sliding: false,
            tiers: TierKind::ALL.to_vec(),
        }
    }
}

impl Strategy {
    /// Policy for `category` with the given TTL and defaults elsewhere
    pub fn new(category: impl Into<String>, ttl: Duration) -> Self {
        Self {
            category: category.into(),
            ttl,
            ..Default::default()
        }
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_warm_eligible(mut self, eligible: bool) -> Self {
        self.warm_eligible = eligible;
        self
    }

    pub fn with_sliding(mut self, sliding: bool) -> Self {
        self.sliding = sliding;
        self
    }

    pub fn with_tiers(mut self, tiers: impl Into<Vec<TierKind>>) -> Self {
        self.tiers = tiers.into();
        self
    }

    /// Whether writes land in `tier`
    pub fn uses(&self, tier: TierKind) -> bool {
        self.tiers.contains(&tier)
    }
}

/// Category lookup supplied by the surrounding system
pub trait StrategyLookup: Send + Sync {
    /// Policy for a category, if one is registered
    fn lookup(&self, category: &str) -> Option<Strategy>;
}

/// Static registry built from configuration
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Strategy>,
    default: Strategy,
}

impl StrategyRegistry {
    /// Registry whose fallback policy uses `default_ttl`
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            strategies: HashMap::new(),
            default: Strategy::new("default", default_ttl),
        }
    }

    /// Build from a category table
    pub fn from_table(default_ttl: Duration, table: &HashMap<String, Strategy>) -> Self {
        let mut registry = Self::new(default_ttl);
        for (category, strategy) in table {
            let mut strategy = strategy.clone();
            strategy.category = category.clone();
            registry.register(strategy);
        }
        registry
    }

    /// Add or replace a category policy
    pub fn register(&mut self, strategy: Strategy) {
        self.strategies.insert(strategy.category.clone(), strategy);
    }

    /// Builder-style register
    pub fn with(mut self, strategy: Strategy) -> Self {
        self.register(strategy);
        self
    }

    /// Fallback policy
    pub fn default_strategy(&self) -> &Strategy {
        &self.default
    }

    /// Policy for a key: its category's, else the fallback
    pub fn resolve(&self, key: &str) -> Strategy {
        self.lookup(category_of(key))
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl StrategyLookup for StrategyRegistry {
    fn lookup(&self, category: &str) -> Option<Strategy> {
        self.strategies.get(category).cloned()
    }
}
