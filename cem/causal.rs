//! # Causal Types and the Identifiability Mask
//!
//! A subject's causal type is the pair of potential outcomes it would show
//! under treatment and under control. Only one arm is ever observed, so an
//! observed `(treatment, outcome)` cell is compatible with exactly two of the
//! four types. That compatibility table is the constraint the EM loop
//! applies after every E-step.
//!
//! | type           | outcome if treated | outcome if control |
//! |----------------|--------------------|--------------------|
//! | responder      | 1                  | 0                  |
//! | doomed         | 0                  | 0                  |
//! | survivor       | 1                  | 1                  |
//! | anti-responder | 0                  | 1                  |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of latent causal types. Fixed by the binary treatment / binary outcome design.
pub const NUM_TYPES: usize = 4;

/// The four latent causal types. The discriminant is the column index used
/// in every per-class array of the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CausalType {
    Responder = 0,
    Doomed = 1,
    Survivor = 2,
    AntiResponder = 3,
}

impl CausalType {
    pub const ALL: [CausalType; NUM_TYPES] = [
        CausalType::Responder,
        CausalType::Doomed,
        CausalType::Survivor,
        CausalType::AntiResponder,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Label written to the `typePredict` column.
    pub fn label(self) -> &'static str {
        match self {
            CausalType::Responder => "responder",
            CausalType::Doomed => "doomed",
            CausalType::Survivor => "survivor",
            CausalType::AntiResponder => "anti-responder",
        }
    }

    /// Outcome this type shows when treated.
    pub fn outcome_if_treated(self) -> bool {
        matches!(self, CausalType::Responder | CausalType::Survivor)
    }

    /// Outcome this type shows under control.
    pub fn outcome_if_control(self) -> bool {
        matches!(self, CausalType::Survivor | CausalType::AntiResponder)
    }

    /// Outcome this type shows in the given arm.
    pub fn outcome_under(self, treated: bool) -> bool {
        if treated {
            self.outcome_if_treated()
        } else {
            self.outcome_if_control()
        }
    }
}

impl fmt::Display for CausalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// An observed `(treatment, outcome)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CausalCell {
    pub treated: bool,
    pub outcome: bool,
}

/// Types retained for each observed cell, indexed by [`CausalCell::index`]
/// (`2 * treatment + outcome`). Every other type is forced to zero responsibility.
pub const ADMISSIBLE_TYPES: [[CausalType; 2]; 4] = [
    // treatment = 0, outcome = 0
    [CausalType::Responder, CausalType::Doomed],
    // treatment = 0, outcome = 1
    [CausalType::Survivor, CausalType::AntiResponder],
    // treatment = 1, outcome = 0
    [CausalType::Doomed, CausalType::AntiResponder],
    // treatment = 1, outcome = 1
    [CausalType::Responder, CausalType::Survivor],
];

impl CausalCell {
    pub fn new(treated: bool, outcome: bool) -> Self {
        Self { treated, outcome }
    }

    /// Builds a cell from 0/1 codes. Any non-zero code counts as 1.
    pub fn from_codes(treatment: u8, outcome: u8) -> Self {
        Self::new(treatment != 0, outcome != 0)
    }

    #[inline]
    pub fn index(self) -> usize {
        2 * usize::from(self.treated) + usize::from(self.outcome)
    }

    /// The two causal types consistent with this observation.
    #[inline]
    pub fn admissible_types(self) -> [CausalType; 2] {
        ADMISSIBLE_TYPES[self.index()]
    }

    /// Per-type mask, `true` where the type is kept.
    pub fn mask(self) -> [bool; NUM_TYPES] {
        let mut mask = [false; NUM_TYPES];
        for ty in self.admissible_types() {
            mask[ty.index()] = true;
        }
        mask
    }
}
