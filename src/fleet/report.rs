//! Per-unit outcomes of a fan-out operation.

use crate::error::FleetError;
use crate::ids::ProviderId;

/// Result of one unit's share of a fan-out operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitOutcome<T> {
    /// 1-based position of the unit in the fleet.
    pub ordinal: usize,
    /// Provider id of the unit, when known.
    pub provider_id: Option<ProviderId>,
    /// What happened on the unit.
    pub result: Result<T, FleetError>,
}

/// Ordered per-unit outcomes. A failing unit never aborts the others.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FanOutReport<T> {
    outcomes: Vec<UnitOutcome<T>>,
    remote_exits: Vec<(usize, Option<i32>)>,
}

impl<T> Default for FanOutReport<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<T> FanOutReport<T> {
    pub(crate) const fn new(outcomes: Vec<UnitOutcome<T>>) -> Self {
        Self {
            outcomes,
            remote_exits: Vec::new(),
        }
    }

    #[must_use]
    pub(crate) fn with_remote_exits(mut self, remote_exits: Vec<(usize, Option<i32>)>) -> Self {
        self.remote_exits = remote_exits;
        self
    }

    /// Units whose remote command ran but did not exit with status 0, with
    /// the exit status (`None` when the command was killed by a signal).
    /// Those units still count as successes: their output is in
    /// [`Self::successes`].
    #[must_use]
    pub fn unsuccessful_exits(&self) -> &[(usize, Option<i32>)] {
        &self.remote_exits
    }

    /// Outcomes in unit order.
    #[must_use]
    pub fn outcomes(&self) -> &[UnitOutcome<T>] {
        &self.outcomes
    }

    /// Successful results in unit order.
    pub fn successes(&self) -> impl Iterator<Item = (usize, &T)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().ok().map(|value| (outcome.ordinal, value)))
    }

    /// Failed units in unit order.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &FleetError)> {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.result.as_ref().err().map(|err| (outcome.ordinal, err)))
    }

    /// Returns `true` when no unit failed.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.result.is_ok())
    }

    /// Number of units covered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns `true` when the operation covered no unit.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }
}

impl FanOutReport<Vec<String>> {
    /// Output lines of the successful units, concatenated in unit order.
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.successes()
            .flat_map(|(_, lines)| lines.iter().cloned())
            .collect()
    }
}

impl<T> IntoIterator for FanOutReport<T> {
    type Item = UnitOutcome<T>;
    type IntoIter = std::vec::IntoIter<UnitOutcome<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.outcomes.into_iter()
    }
}
