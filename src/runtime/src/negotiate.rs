//! Stemcell format negotiation.

use std::collections::BTreeSet;

use stemcell_core::FormatConstraint;

/// Result of matching stemcell formats against a CPI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Both sides declare formats and at least one is shared
    Compatible { shared: BTreeSet<String> },
    /// One side declares no formats, so there is nothing to check
    Unconstrained,
    /// Both sides declare formats and none is shared
    Incompatible {
        declared: BTreeSet<String>,
        supported: BTreeSet<String>,
    },
}

impl Negotiation {
    pub fn is_compatible(&self) -> bool {
        !matches!(self, Negotiation::Incompatible { .. })
    }
}

/// Match the stemcell's declared formats against a CPI constraint.
pub fn negotiate(declared: Option<&BTreeSet<String>>, constraint: &FormatConstraint) -> Negotiation {
    let declared = match declared {
        Some(declared) if !declared.is_empty() => declared,
        _ => return Negotiation::Unconstrained,
    };
    let supported = match constraint {
        FormatConstraint::Unconstrained => return Negotiation::Unconstrained,
        FormatConstraint::Constrained(supported) if supported.is_empty() => {
            return Negotiation::Unconstrained
        }
        FormatConstraint::Constrained(supported) => supported,
    };

    let shared: BTreeSet<String> = declared.intersection(supported).cloned().collect();
    if shared.is_empty() {
        Negotiation::Incompatible {
            declared: declared.clone(),
            supported: supported.clone(),
        }
    } else {
        Negotiation::Compatible { shared }
    }
}
