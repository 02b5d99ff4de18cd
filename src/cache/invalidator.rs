//! Pattern Invalidation
//!
//! Glob expressions over cache keys: `*` matches any run of characters, `?`
//! exactly one, everything else is literal. Malformed patterns are rejected
//! before any tier is touched.

use std::collections::BTreeSet;

use regex::Regex;

use super::coherence::Coherence;
use super::tier::{Tier, TierKind};
use crate::error::{Error, Result};

/// Compiled invalidation pattern
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    prefix: String,
    regex: Option<Regex>,
}

impl Pattern {
    /// Parse and compile a glob pattern
    pub fn parse(pattern: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if let Some(c) = pattern
            .chars()
            .find(|c| c.is_whitespace() || c.is_control())
        {
            return Err(invalid(&format!("illegal character {:?}", c)));
        }
        if let Some(c) = pattern.chars().find(|c| matches!(c, '[' | ']' | '{' | '}')) {
            return Err(invalid(&format!(
                "character classes and alternation are not supported ({:?})",
                c
            )));
        }

        let wildcard = pattern.find(['*', '?']);
        let prefix = match wildcard {
            Some(pos) => pattern[..pos].to_string(),
            None => pattern.to_string(),
        };

        let regex = match wildcard {
            None => None,
            Some(_) => {
                let mut expr = String::with_capacity(pattern.len() * 2 + 2);
                expr.push('^');
                for c in pattern.chars() {
                    match c {
                        '*' => expr.push_str(".*"),
                        '?' => expr.push('.'),
                        c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
                    }
                }
                expr.push('$');
                Some(Regex::new(&expr).map_err(|e| invalid(&e.to_string()))?)
            }
        };

        Ok(Self {
            raw: pattern.to_string(),
            prefix,
            regex,
        })
    }

    /// The pattern as written
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Literal text before the first wildcard; drives tier scans
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// No wildcards: the pattern names one key
    pub fn is_exact(&self) -> bool {
        self.regex.is_none()
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.regex {
            Some(regex) => regex.is_match(key),
            None => key == self.raw,
        }
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Outcome of one invalidation pass
#[derive(Debug, Default)]
pub struct Invalidation {
    /// Distinct keys removed from at least one tier
    pub removed: BTreeSet<String>,
    /// Tier operations that failed
    pub failures: u64,
}

impl Invalidation {
    pub fn count(&self) -> usize {
        self.removed.len()
    }
}

/// Delete every key matching `pattern` from every tier. Each tier is
/// attempted even when another fails; failures are logged and counted.
///
/// Tiers are walked slowest first. A key removed from a slower tier is also
/// deleted from every faster one, listed or not, so a read that promoted it
/// mid-pass is either cleared or sees the write version move and withdraws
/// its copy. Tiers that could not be cleaned are marked dirty for the keys.
pub async fn invalidate(
    tiers: &[Tier],
    pattern: &Pattern,
    coherence: &Coherence,
) -> Invalidation {
    let mut outcome = Invalidation::default();
    let mut unlisted: Vec<TierKind> = Vec::new();

    for tier in tiers.iter().rev() {
        let mut candidates: BTreeSet<String> = if pattern.is_exact() {
            BTreeSet::from([pattern.as_str().to_string()])
        } else {
            match tier.scan(pattern.prefix()).await {
                Ok(keys) => keys.into_iter().filter(|k| pattern.matches(k)).collect(),
                Err(e) => {
                    tracing::warn!("Invalidate {}: scan of {} failed: {}", pattern, tier.kind(), e);
                    outcome.failures += 1;
                    unlisted.push(tier.kind());
                    BTreeSet::new()
                }
            }
        };
        candidates.extend(outcome.removed.iter().cloned());

        for key in candidates {
            coherence.bump(&key);
            match tier.delete(&key).await {
                Ok(found) => {
                    coherence.settle(tier.kind(), &key);
                    if found {
                        outcome.removed.insert(key);
                    }
                }
                Err(e) => {
                    tracing::warn!("Invalidate {}: delete from {} failed: {}", key, tier.kind(), e);
                    outcome.failures += 1;
                    coherence.mark_dirty(tier.kind(), &key);
                }
            }
        }
    }

    for kind in unlisted {
        for key in &outcome.removed {
            coherence.mark_dirty(kind, key);
        }
    }

    tracing::debug!(
        "Invalidated {} keys matching {} ({} failures)",
        outcome.count(),
        pattern,
        outcome.failures
    );
    outcome
}
