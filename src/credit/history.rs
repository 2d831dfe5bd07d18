use serde::{Deserialize, Serialize};

use super::balance::BalanceMap;
use super::period::Period;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BurnReason {
    /// The grant ran out within the segment.
    Exhausted,
    /// Usage ran out while the grant still had balance left.
    SegmentTerminated,
}

impl BurnReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BurnReason::Exhausted => "exhausted",
            BurnReason::SegmentTerminated => "segment-terminated",
        }
    }
}

/// Usage attributed to one grant within a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantUsage {
    pub grant_id: String,
    pub usage: f64,
    pub reason: BurnReason,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentTerminationReasons {
    pub priority_change: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recurrence: Vec<String>,
}

/// key: credit-history-segment -> audit trail of one burn phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantBurnDownHistorySegment {
    pub period: Period,
    pub balance_at_start: BalanceMap,
    pub overage_at_start: f64,
    pub grant_usages: Vec<GrantUsage>,
    pub total_usage: f64,
    pub overage: f64,
    pub termination_reasons: SegmentTerminationReasons,
}

impl GrantBurnDownHistorySegment {
    /// Balances once the segment's usage has been applied.
    pub fn balance_at_end(&self) -> BalanceMap {
        let mut balances = self.balance_at_start.copy();
        for usage in &self.grant_usages {
            balances.burn(&usage.grant_id, usage.usage);
        }
        balances
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantBurnDownHistory(Vec<GrantBurnDownHistorySegment>);

impl GrantBurnDownHistory {
    pub fn new(segments: Vec<GrantBurnDownHistorySegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[GrantBurnDownHistorySegment] {
        &self.0
    }

    pub fn into_segments(self) -> Vec<GrantBurnDownHistorySegment> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Usage reported by every segment that overlaps `period`.
    pub fn total_usage_in(&self, period: &Period) -> f64 {
        self.0
            .iter()
            .filter(|segment| segment.period.overlaps(period))
            .map(|segment| segment.total_usage)
            .sum()
    }

    /// Segments overlapping `period`, in order.
    pub fn segments_in(&self, period: &Period) -> Vec<GrantBurnDownHistorySegment> {
        self.0
            .iter()
            .filter(|segment| segment.period.overlaps(period))
            .cloned()
            .collect()
    }
}
