//! Hierarchical usage, timing and cost accounting.
//!
//! A [`Stats`] node records every model call made on its behalf. Nodes form
//! a tree through [`Stats::child`]: every record made on a child is applied
//! to the child and to each of its ancestors, so the root always holds the
//! totals of the whole tree.

use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::pricing::PriceTable;

/// Token usage of one or more calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub input: u64,
    /// Completion tokens.
    pub output: u64,
}

impl Usage {
    /// Create a usage record.
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    /// Input plus output tokens.
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            input: self.input + rhs.input,
            output: self.output + rhs.output,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}

/// Dollar cost. Unknown is contagious: adding anything to it stays unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cost {
    /// Cost computed from known prices.
    Known(Decimal),
    /// At least one contributing model had no price.
    Unknown,
}

impl Cost {
    /// Zero cost.
    pub const ZERO: Cost = Cost::Known(Decimal::ZERO);

    /// The amount, if known.
    pub fn known(&self) -> Option<Decimal> {
        match self {
            Cost::Known(amount) => Some(*amount),
            Cost::Unknown => None,
        }
    }
}

impl Default for Cost {
    fn default() -> Self {
        Cost::ZERO
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, rhs: Cost) -> Cost {
        match (self, rhs) {
            (Cost::Known(a), Cost::Known(b)) => Cost::Known(a + b),
            _ => Cost::Unknown,
        }
    }
}

impl Sum for Cost {
    fn sum<I: Iterator<Item = Cost>>(iter: I) -> Cost {
        iter.fold(Cost::ZERO, Add::add)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cost::Known(amount) => write!(f, "${}", amount.round_dp(6).normalize()),
            Cost::Unknown => f.write_str("unknown"),
        }
    }
}

/// Timing of one successful model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Elapsed time of the successful attempt.
    pub elapsed: Duration,
    /// Failed attempts before it.
    pub retries: u32,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<CallRecord>,
    usage: BTreeMap<String, Usage>,
}

/// Point-in-time totals of a [`Stats`] node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSummary {
    /// Number of recorded calls.
    pub calls: usize,
    /// Total failed attempts.
    pub retries: u32,
    /// Summed elapsed time of recorded calls.
    pub elapsed: Duration,
    /// Token usage across all models.
    pub usage: Usage,
    /// Total cost.
    pub cost: Cost,
}

/// Usage accounting node. Shared as `Arc<Stats>`.
pub struct Stats {
    inner: Mutex<Inner>,
    parent: Option<Arc<Stats>>,
    prices: Arc<PriceTable>,
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stats")
            .field("calls", &self.call_count())
            .field("usage", &self.usage())
            .field("has_parent", &self.parent.is_some())
            .finish_non_exhaustive()
    }
}

impl Stats {
    /// A root node priced with [`PriceTable::with_defaults`].
    pub fn new() -> Arc<Stats> {
        Self::with_prices(PriceTable::with_defaults())
    }

    /// A root node priced with `prices`.
    pub fn with_prices(prices: PriceTable) -> Arc<Stats> {
        Arc::new(Stats {
            inner: Mutex::default(),
            parent: None,
            prices: Arc::new(prices),
        })
    }

    /// A new child node whose records also roll up into `self`.
    pub fn child(self: &Arc<Self>) -> Arc<Stats> {
        Arc::new(Stats {
            inner: Mutex::default(),
            parent: Some(Arc::clone(self)),
            prices: Arc::clone(&self.prices),
        })
    }

    /// The direct parent, if any.
    pub fn parent(&self) -> Option<&Arc<Stats>> {
        self.parent.as_ref()
    }

    /// The top of the parent chain.
    pub fn root(self: &Arc<Self>) -> Arc<Stats> {
        let mut node = Arc::clone(self);
        while let Some(parent) = node.parent.clone() {
            node = parent;
        }
        node
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Records are plain appends, so a poisoned lock still holds valid data
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn each_node(&self, mut apply: impl FnMut(&mut Inner)) {
        let mut node = Some(self);
        while let Some(current) = node {
            apply(&mut current.lock());
            node = current.parent.as_deref();
        }
    }

    /// Record the timing of one call on this node and every ancestor.
    pub fn record_call(&self, record: CallRecord) {
        self.each_node(|inner| inner.calls.push(record));
    }

    /// Record token usage for `model` on this node and every ancestor.
    pub fn record_usage(&self, model: &str, usage: Usage) {
        self.each_node(|inner| *inner.usage.entry(model.to_string()).or_default() += usage);
    }

    /// Number of recorded calls.
    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Total failed attempts across recorded calls.
    pub fn retries(&self) -> u32 {
        self.lock().calls.iter().map(|c| c.retries).sum()
    }

    /// Summed elapsed time of recorded calls.
    pub fn total_elapsed(&self) -> Duration {
        self.lock().calls.iter().map(|c| c.elapsed).sum()
    }

    /// Token usage across all models.
    pub fn usage(&self) -> Usage {
        self.lock()
            .usage
            .values()
            .fold(Usage::default(), |acc, u| acc + *u)
    }

    /// Token usage of one model.
    pub fn usage_for(&self, model: &str) -> Usage {
        self.lock().usage.get(model).copied().unwrap_or_default()
    }

    /// Total cost. Unknown if any model with recorded usage has no price.
    pub fn cost(&self) -> Cost {
        self.lock()
            .usage
            .iter()
            .map(|(model, usage)| self.prices.cost(model, *usage))
            .sum()
    }

    /// Snapshot of all totals.
    pub fn summary(&self) -> StatsSummary {
        StatsSummary {
            calls: self.call_count(),
            retries: self.retries(),
            elapsed: self.total_elapsed(),
            usage: self.usage(),
            cost: self.cost(),
        }
    }
}
