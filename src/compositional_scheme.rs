//! Composes two or more bi-couplings into one advance: the composite
//! visits its members in a fixed order every step, is done once every
//! member is done, and its step size is the minimum of the caller's `dt`
//! and every member's remaining window.

use crate::coupling_scheme::{CouplingScheme, CouplingSchemeError, ExchangeStep};

/// One sub-coupling: its own [`CouplingScheme`] state plus the driver that
/// implements its variant-specific exchange.
pub struct Member {
    /// The sub-coupling's own time/window/action state.
    pub scheme: CouplingScheme,
    /// Its serial/parallel/multi exchange driver.
    pub step: Box<dyn ExchangeStep>,
}

/// Composes several sub-couplings, visited in registration order every
/// `advance`.
pub struct CompositionalScheme {
    members: Vec<Member>,
}

impl CompositionalScheme {
    /// Build from an ordered list of members. The order is fixed for the
    /// lifetime of the scheme: `advance` always visits them in this order.
    pub fn new(members: Vec<Member>) -> Self {
        Self { members }
    }

    /// `true` if any member still has coupling ongoing; the composite is
    /// done only once every member is done.
    pub fn is_coupling_ongoing(&self) -> bool {
        self.members.iter().any(|m| m.scheme.is_coupling_ongoing())
    }

    /// Drive every member one step, in fixed order, with a step size
    /// capped at the smallest remaining-window length among members that
    /// have one resolved. Members whose coupling already ended are
    /// skipped.
    pub fn advance(&mut self, dt: f64) -> Result<(), CouplingSchemeError> {
        let step_dt = self
            .members
            .iter()
            .filter(|m| m.scheme.is_coupling_ongoing())
            .filter_map(|m| m.scheme.this_time_window_remainder())
            .fold(dt, f64::min);

        for member in self.members.iter_mut() {
            if !member.scheme.is_coupling_ongoing() {
                continue;
            }
            member.scheme.advance(step_dt, member.step.as_mut())?;
        }
        Ok(())
    }

    /// Read-only access to a member's scheme, by registration index.
    pub fn member_scheme(&self, index: usize) -> Option<&CouplingScheme> {
        self.members.get(index).map(|m| &m.scheme)
    }

    /// Number of registered members.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }
}
