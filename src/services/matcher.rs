//! Identity resolution and admission rules
//!
//! Order of evaluation for a sighting:
//! 1. resolve the address against known identity keys (`irk:<hex>` id)
//! 2. otherwise use the address itself (`aabbccddeeff`)
//! 3. `exclude` on id / alias / name rejects
//! 4. non-empty `include` must match id / alias / name
//! 5. `query` must hold when set
//! 6. non-empty `known_macs` must contain the id, unless resolved by key

use crate::domain::types::{AddressError, Advertisement, DeviceConfig, MacAddress};
use crate::services::devices::DeviceTable;
use crate::services::irk::{Irk, IrkSet};
use crate::services::query::{Query, QueryContext};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Prefix(String),
    Contains(String),
}

/// Compiled id/name patterns.
///
/// Entries are separated by whitespace or commas. `*text*` is a substring
/// match; anything else (optionally ending in `*`) is a prefix match, which
/// covers exact ids too. Matching ignores case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternSet {
    source: String,
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn parse(list: &str) -> Self {
        let patterns = list
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .filter_map(|entry| {
                let entry = entry.to_lowercase();
                if entry.len() > 2 && entry.starts_with('*') && entry.ends_with('*') {
                    Some(Pattern::Contains(entry[1..entry.len() - 1].to_string()))
                } else {
                    let prefix = entry.trim_end_matches('*');
                    (!prefix.is_empty()).then(|| Pattern::Prefix(prefix.to_string()))
                }
            })
            .collect();
        Self { source: list.trim().to_string(), patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, candidate: &str) -> bool {
        let candidate = candidate.to_lowercase();
        self.patterns.iter().any(|p| match p {
            Pattern::Prefix(prefix) => candidate.starts_with(prefix.as_str()),
            Pattern::Contains(part) => candidate.contains(part.as_str()),
        })
    }

    pub fn matches_any(&self, candidates: &[&str]) -> bool {
        candidates.iter().any(|c| self.matches(c))
    }
}

/// Compiled `known_macs` allow-list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    ids: FxHashSet<String>,
}

impl AddressSet {
    pub fn parse(list: &str) -> Result<Self, AddressError> {
        let ids = list
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<MacAddress>().map(|mac| mac.to_id()))
            .collect::<Result<FxHashSet<_>, _>>()?;
        Ok(Self { ids })
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Outcome of a successful admission
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    /// Identity key of the fingerprint
    pub key: String,
    pub address: MacAddress,
    pub resolved_by_irk: bool,
    pub device: Option<DeviceConfig>,
    pub name: Option<String>,
}

/// Admission rule set, compiled when a rule is changed
#[derive(Debug, Clone, Default)]
pub struct IdentityMatcher {
    pub include: PatternSet,
    pub exclude: PatternSet,
    pub query: Option<Query>,
    pub known_macs: AddressSet,
    pub known_irks: IrkSet,
}

impl IdentityMatcher {
    /// Decide whether a sighting is tracked; `None` leaves no trace anywhere
    pub fn admit(&self, adv: &Advertisement, devices: &DeviceTable) -> Option<Admission> {
        let irk = self.known_irks.resolve(&adv.mac);
        let resolved_by_irk = irk.is_some();
        let key = irk.map_or_else(|| adv.mac.to_id(), Irk::id);

        let device = devices.find(&key).cloned();
        let alias = device.as_ref().map(|d| d.alias.as_str()).filter(|a| !a.is_empty());
        let name = adv
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .or_else(|| device.as_ref().map(|d| d.name.as_str()).filter(|n| !n.is_empty()));

        let passes_rules = {
            let mut candidates: SmallVec<[&str; 3]> = SmallVec::new();
            candidates.push(&key);
            candidates.extend(alias);
            candidates.extend(name);
            !self.exclude.matches_any(&candidates)
                && (self.include.is_empty() || self.include.matches_any(&candidates))
        };
        if !passes_rules {
            return None;
        }
        if let Some(query) = &self.query {
            if !query.matches(&QueryContext { id: &key, advertisement: adv }) {
                return None;
            }
        }
        if !self.known_macs.is_empty() && !resolved_by_irk && !self.known_macs.contains(&key) {
            return None;
        }

        let name = name.map(str::to_string);
        Some(Admission { key, address: adv.mac, resolved_by_irk, device, name })
    }
}
