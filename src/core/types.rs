use serde::{Serialize, Serializer};
use std::fmt;
use thiserror::Error;

/// One-way transaction fee charged on the leveraged position size.
pub const TRANSACTION_FEE_RATE: f64 = 0.001;

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginTier {
    pub margin_pct: u32,
    pub leverage: f64,
    pub margin_rate: f64,
}

/// Fixed margin-percentage -> leverage table. The leverage column is
/// table-driven, not derived: 60% maps to 1.66x, not 1/0.6.
pub const MARGIN_TIERS: [MarginTier; 6] = [
    MarginTier {
        margin_pct: 100,
        leverage: 1.0,
        margin_rate: 1.0,
    },
    MarginTier {
        margin_pct: 60,
        leverage: 1.66,
        margin_rate: 0.6,
    },
    MarginTier {
        margin_pct: 50,
        leverage: 2.0,
        margin_rate: 0.5,
    },
    MarginTier {
        margin_pct: 40,
        leverage: 2.5,
        margin_rate: 0.4,
    },
    MarginTier {
        margin_pct: 30,
        leverage: 3.33,
        margin_rate: 0.3,
    },
    MarginTier {
        margin_pct: 20,
        leverage: 5.0,
        margin_rate: 0.2,
    },
];

/// Looks up a margin tier by its percentage key. Unknown keys are a
/// data/config corruption and fail fast rather than defaulting.
pub fn margin_tier(margin_pct: u32) -> Result<MarginTier, CoreError> {
    MARGIN_TIERS
        .iter()
        .find(|tier| tier.margin_pct == margin_pct)
        .copied()
        .ok_or(CoreError::UnknownMarginTier(margin_pct))
}

#[derive(Debug, Error, PartialEq)]
pub enum CoreError {
    #[error("unknown margin tier: {0}%")]
    UnknownMarginTier(u32),
    #[error("loss amount {loss_amount} is inconsistent with a zero total loss ratio")]
    InconsistentLoss { loss_amount: f64 },
}

/// Per-step market gain, with the sentinels threaded explicitly through the
/// data model instead of relying on float infinity/NaN propagation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum StepGain {
    Finite(f64),
    /// No finite market return achieves the required outcome.
    Unrecoverable,
    /// The scenario has nothing to compute (no starting capital).
    NotApplicable,
}

impl StepGain {
    pub fn is_finite(self) -> bool {
        matches!(self, StepGain::Finite(_))
    }

    pub fn finite(self) -> Option<f64> {
        match self {
            StepGain::Finite(v) => Some(v),
            _ => None,
        }
    }
}

impl Serialize for StepGain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            StepGain::Finite(v) => serializer.serialize_f64(*v),
            StepGain::Unrecoverable => serializer.serialize_str("unrecoverable"),
            StepGain::NotApplicable => serializer.serialize_str("n/a"),
        }
    }
}

impl fmt::Display for StepGain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepGain::Finite(v) => write!(f, "{v:.2}%"),
            StepGain::Unrecoverable => write!(f, "∞ (unrecoverable)"),
            StepGain::NotApplicable => write!(f, "N/A"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossMetrics {
    pub loss_pct: f64,
    pub loss_amount: f64,
}

/// Which of the two editable columns wins when both carry values at the
/// most-recently-edited step.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EditPriority {
    Gain,
    Profit,
}

/// Per-step user overrides consumed by the generator. All three vectors have
/// `step_count` elements; `None` means the step is free for recomputation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepOverrides {
    pub fixed_gain_pct: Vec<Option<f64>>,
    pub fixed_net_profit: Vec<Option<f64>>,
    pub edit_priority: Vec<Option<EditPriority>>,
}

impl StepOverrides {
    pub fn none(step_count: usize) -> Self {
        Self {
            fixed_gain_pct: vec![None; step_count],
            fixed_net_profit: vec![None; step_count],
            edit_priority: vec![None; step_count],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fixed_gain_pct.iter().all(Option::is_none)
            && self.fixed_net_profit.iter().all(Option::is_none)
    }
}

#[derive(Clone, Debug)]
pub struct PlanRequest {
    pub initial_capital: f64,
    pub actual_total_loss_pct: f64,
    pub recovery_leverage: f64,
    pub step_count: usize,
    pub overrides: StepOverrides,
}

impl PlanRequest {
    /// A request with no user overrides: every step computes automatically.
    pub fn auto(
        initial_capital: f64,
        actual_total_loss_pct: f64,
        recovery_leverage: f64,
        step_count: usize,
    ) -> Self {
        Self {
            initial_capital,
            actual_total_loss_pct,
            recovery_leverage,
            step_count,
            overrides: StepOverrides::none(step_count),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRow {
    /// 1-based trade round label.
    pub round: usize,
    pub market_gain_pct: StepGain,
    pub cumulative_capital: f64,
    pub net_profit: f64,
}
