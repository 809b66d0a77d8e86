mod engine;
mod reconcile;
mod types;

pub use engine::{
    capital_from_loss, gain_from_profit, generate_recovery_table, loss_from_capital,
    net_profit_for_gain,
};
pub use reconcile::{CellEdit, EditColumn, SnapshotRow, overrides_from_snapshot, parse_cell_value};
pub use types::{
    CoreError, EditPriority, LossMetrics, MARGIN_TIERS, MarginTier, PlanRequest, RecoveryRow,
    StepGain, StepOverrides, TRANSACTION_FEE_RATE, margin_tier,
};
