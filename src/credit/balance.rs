use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::grant::Grant;

/// Remaining balance per grant id. Ordered by id so iteration and serialization are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BalanceMap(BTreeMap<String, f64>);

impl BalanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    pub fn get(&self, grant_id: &str) -> Option<f64> {
        self.0.get(grant_id).copied()
    }

    pub fn burn(&mut self, grant_id: &str, amount: f64) {
        let entry = self.0.entry(grant_id.to_string()).or_insert(0.0);
        *entry -= amount;
    }

    pub fn set(&mut self, grant_id: &str, amount: f64) {
        self.0.insert(grant_id.to_string(), amount);
    }

    pub fn remove(&mut self, grant_id: &str) -> Option<f64> {
        self.0.remove(grant_id)
    }

    /// Total remaining balance across all grants.
    pub fn balance(&self) -> f64 {
        self.0.values().sum()
    }

    /// Keys match the ids of `grants` exactly: no missing and no extra entries.
    pub fn exactly_for_grants(&self, grants: &[Grant]) -> bool {
        let ids: BTreeSet<&str> = grants.iter().map(|grant| grant.id.as_str()).collect();
        ids.len() == self.0.len() && ids.iter().all(|id| self.0.contains_key(*id))
    }

    /// Merges `other` into this map; entries from `other` win.
    pub fn override_with(&mut self, other: &BalanceMap) {
        for (id, amount) in &other.0 {
            self.0.insert(id.clone(), *amount);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &f64)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for BalanceMap {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// key: credit-snapshot -> checkpointed balances
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrantBalanceSnapshot {
    pub balances: BalanceMap,
    pub overage: f64,
    pub at: DateTime<Utc>,
}

impl GrantBalanceSnapshot {
    pub fn balance(&self) -> f64 {
        self.balances.balance()
    }
}
