use std::collections::HashMap;

use crate::config::UserConfig;
use crate::core::{
    CellEdit, CoreError, PlanRequest, RecoveryRow, SnapshotRow, StepOverrides, capital_from_loss,
    generate_recovery_table, loss_from_capital, margin_tier, overrides_from_snapshot,
};

/// Which side of the capital <-> loss-amount pair the user typed last. The
/// other side is always recomputed from it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DrivingField {
    Capital,
    LossAmount,
}

/// The financial inputs of one user session, kept internally consistent: any
/// raw-input change re-syncs the non-driving member of the two-way-bound pair.
#[derive(Clone, Debug)]
pub struct FinancialState {
    initial_capital: f64,
    market_loss_pct: f64,
    loss_margin_pct: u32,
    actual_loss_amount: f64,
    driving_field: DrivingField,
}

impl FinancialState {
    pub fn from_config(config: &UserConfig) -> Self {
        let loss_margin_pct = match margin_tier(config.loss_margin_pct_at_loss) {
            Ok(tier) => tier.margin_pct,
            Err(_) => {
                tracing::warn!(
                    "config margin tier {}% is not in the table; falling back to 40%",
                    config.loss_margin_pct_at_loss
                );
                40
            }
        };
        let mut state = Self {
            initial_capital: config.initial_capital,
            market_loss_pct: config.market_loss_input_pct,
            loss_margin_pct,
            actual_loss_amount: config.actual_loss_amount,
            driving_field: DrivingField::Capital,
        };
        state.resync();
        state
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn market_loss_pct(&self) -> f64 {
        self.market_loss_pct
    }

    pub fn loss_margin_pct(&self) -> u32 {
        self.loss_margin_pct
    }

    pub fn actual_loss_amount(&self) -> f64 {
        self.actual_loss_amount
    }

    pub fn driving_field(&self) -> DrivingField {
        self.driving_field
    }

    pub fn leverage_at_loss(&self) -> f64 {
        // The stored key is validated on every write, so the lookup holds.
        margin_tier(self.loss_margin_pct)
            .map(|tier| tier.leverage)
            .unwrap_or(1.0)
    }

    /// Account-level total loss percentage for the current inputs.
    pub fn actual_loss_pct(&self) -> f64 {
        loss_from_capital(
            self.initial_capital,
            self.market_loss_pct,
            self.leverage_at_loss(),
        )
        .loss_pct
    }

    pub fn set_initial_capital(&mut self, value: f64) {
        self.initial_capital = value.max(0.0);
        self.driving_field = DrivingField::Capital;
        self.resync();
    }

    pub fn set_actual_loss_amount(&mut self, value: f64) {
        self.actual_loss_amount = value.max(0.0);
        self.driving_field = DrivingField::LossAmount;
        self.resync();
    }

    pub fn set_market_loss_pct(&mut self, value: f64) {
        self.market_loss_pct = value.clamp(0.0, 100.0);
        self.resync();
    }

    pub fn set_loss_margin_pct(&mut self, margin_pct: u32) -> Result<(), CoreError> {
        self.loss_margin_pct = margin_tier(margin_pct)?.margin_pct;
        self.resync();
        Ok(())
    }

    fn resync(&mut self) {
        let leverage = self.leverage_at_loss();
        match self.driving_field {
            DrivingField::Capital => {
                let metrics =
                    loss_from_capital(self.initial_capital, self.market_loss_pct, leverage);
                self.actual_loss_amount = metrics.loss_amount.round();
            }
            DrivingField::LossAmount => {
                // An inconsistent inverse leaves the capital untouched.
                if let Ok(capital) =
                    capital_from_loss(self.actual_loss_amount, self.market_loss_pct, leverage)
                {
                    self.initial_capital = capital.round();
                }
            }
        }
    }
}

/// Identifies one rendered table: (step-count tab, margin-tier percentage).
pub type TableKey = (usize, u32);

#[derive(Clone, Debug, Default)]
pub struct TableEdits {
    pub snapshot: Vec<SnapshotRow>,
    pub last_edit: Option<CellEdit>,
}

/// Per-table edit history, owned by the session layer. The generator only
/// ever sees the override arrays derived from it.
#[derive(Debug, Default)]
pub struct EditHistory {
    tables: HashMap<TableKey, TableEdits>,
}

impl EditHistory {
    pub fn record_edit(&mut self, key: TableKey, snapshot: Vec<SnapshotRow>, edit: CellEdit) {
        self.tables.insert(
            key,
            TableEdits {
                snapshot,
                last_edit: Some(edit),
            },
        );
    }

    pub fn reset(&mut self, key: TableKey) {
        self.tables.remove(&key);
    }

    pub fn overrides_for(&self, key: TableKey, step_count: usize) -> StepOverrides {
        match self.tables.get(&key) {
            Some(edits) => overrides_from_snapshot(step_count, &edits.snapshot, edits.last_edit),
            None => StepOverrides::none(step_count),
        }
    }
}

/// Everything one user session owns. The core stays pure; this is the single
/// writer for edit history and the driving-field flag.
#[derive(Debug)]
pub struct Session {
    pub financial: FinancialState,
    pub edits: EditHistory,
    pub max_recovery_trades: usize,
}

impl Session {
    pub fn from_config(config: &UserConfig) -> Self {
        Self {
            financial: FinancialState::from_config(config),
            edits: EditHistory::default(),
            max_recovery_trades: config.max_recovery_trades.max(1),
        }
    }

    pub fn to_config(&self) -> UserConfig {
        UserConfig {
            initial_capital: self.financial.initial_capital(),
            market_loss_input_pct: self.financial.market_loss_pct(),
            loss_margin_pct_at_loss: self.financial.loss_margin_pct(),
            max_recovery_trades: self.max_recovery_trades,
            actual_loss_amount: self.financial.actual_loss_amount(),
        }
    }

    /// Generates one table for a (step count, recovery tier) pair, honoring
    /// this session's stored edits for that table.
    pub fn plan_for(&self, step_count: usize, recovery_margin_pct: u32) -> Result<Vec<RecoveryRow>, CoreError> {
        let tier = margin_tier(recovery_margin_pct)?;
        let key = (step_count, tier.margin_pct);
        let request = PlanRequest {
            initial_capital: self.financial.initial_capital(),
            actual_total_loss_pct: self.financial.actual_loss_pct(),
            recovery_leverage: tier.leverage,
            step_count,
            overrides: self.edits.overrides_for(key, step_count),
        };
        Ok(generate_recovery_table(&request))
    }
}

/// Step-count tabs shown for a given trade budget: 1 through 5 plus the
/// budget itself, deduplicated and capped at the budget.
pub fn recovery_step_tabs(max_recovery_trades: usize) -> Vec<usize> {
    let mut tabs: Vec<usize> = (1..=5)
        .chain(std::iter::once(max_recovery_trades))
        .filter(|&steps| steps >= 1 && steps <= max_recovery_trades)
        .collect();
    tabs.sort_unstable();
    tabs.dedup();
    tabs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EditColumn, StepGain};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn default_state() -> FinancialState {
        FinancialState::from_config(&UserConfig::default())
    }

    #[test]
    fn construction_syncs_loss_amount_from_capital() {
        let state = default_state();
        assert_eq!(state.driving_field(), DrivingField::Capital);
        assert_approx(state.actual_loss_amount(), 194_250.0);
        assert_approx(state.actual_loss_pct(), 19.425);
        assert_approx(state.leverage_at_loss(), 2.5);
    }

    #[test]
    fn capital_edits_drive_the_loss_amount() {
        let mut state = default_state();
        state.set_initial_capital(2_000_000.0);
        assert_approx(state.actual_loss_amount(), 388_500.0);
    }

    #[test]
    fn loss_amount_edits_drive_the_capital() {
        let mut state = default_state();
        state.set_actual_loss_amount(194_250.0);
        assert_eq!(state.driving_field(), DrivingField::LossAmount);
        assert_approx(state.initial_capital(), 1_000_000.0);
    }

    #[test]
    fn market_loss_change_resyncs_the_non_driving_field() {
        let mut state = default_state();
        state.set_market_loss_pct(10.0);
        // Capital still drives: amount = 1,000,000 * (0.10*2.5 + 0.0025)
        assert_approx(state.actual_loss_amount(), 252_500.0);

        state.set_actual_loss_amount(252_500.0);
        state.set_market_loss_pct(7.67);
        // Loss amount now drives: capital = 252,500 / 0.19425
        assert_approx(state.initial_capital(), (252_500.0_f64 / 0.19425).round());
    }

    #[test]
    fn margin_change_revalidates_against_the_tier_table() {
        let mut state = default_state();
        state.set_loss_margin_pct(20).expect("20% is a known tier");
        assert_approx(state.leverage_at_loss(), 5.0);
        assert_approx(state.actual_loss_amount(), 388_500.0);

        let err = state.set_loss_margin_pct(33).expect_err("33% is not a tier");
        assert_eq!(err, CoreError::UnknownMarginTier(33));
        assert_eq!(state.loss_margin_pct(), 20);
    }

    #[test]
    fn unknown_config_margin_falls_back_to_forty() {
        let config = UserConfig {
            loss_margin_pct_at_loss: 45,
            ..UserConfig::default()
        };
        let state = FinancialState::from_config(&config);
        assert_eq!(state.loss_margin_pct(), 40);
    }

    #[test]
    fn edit_history_round_trips_through_overrides() {
        let mut history = EditHistory::default();
        let key = (5, 40);
        assert!(history.overrides_for(key, 5).is_empty());

        let snapshot = vec![
            SnapshotRow {
                market_gain_pct: Some(9.74),
                net_profit: Some(194_250.0),
            },
            SnapshotRow {
                market_gain_pct: Some(3.0),
                net_profit: Some(30_000.0),
            },
        ];
        history.record_edit(
            key,
            snapshot,
            CellEdit {
                row: 1,
                column: EditColumn::NetProfit,
            },
        );

        let overrides = history.overrides_for(key, 5);
        assert_eq!(overrides.fixed_gain_pct[0], Some(9.74));
        assert_eq!(overrides.fixed_net_profit[1], Some(30_000.0));
        assert_eq!(overrides.fixed_gain_pct[1], None);
        assert_eq!(overrides.fixed_gain_pct[2], None);

        history.reset(key);
        assert!(history.overrides_for(key, 5).is_empty());
    }

    #[test]
    fn session_plan_honors_recorded_edits() {
        let mut session = Session::from_config(&UserConfig::default());
        let key = (2, 40);

        let base = session.plan_for(2, 40).expect("40% is a known tier");
        assert_eq!(base.len(), 2);

        session.edits.record_edit(
            key,
            vec![SnapshotRow {
                market_gain_pct: Some(2.0),
                net_profit: None,
            }],
            CellEdit {
                row: 0,
                column: EditColumn::MarketGainPct,
            },
        );
        let edited = session.plan_for(2, 40).expect("40% is a known tier");
        assert_eq!(edited[0].market_gain_pct, StepGain::Finite(2.0));
        // The second step re-aims at the original capital.
        assert!((edited[1].cumulative_capital - 1_000_000.0).abs() < 1e-4);

        // A different tier's table is untouched by those edits.
        let other = session.plan_for(2, 20).expect("20% is a known tier");
        assert_ne!(other[0].market_gain_pct, StepGain::Finite(2.0));
    }

    #[test]
    fn session_plan_rejects_unknown_recovery_tier() {
        let session = Session::from_config(&UserConfig::default());
        assert_eq!(
            session.plan_for(3, 47).expect_err("47% is not a tier"),
            CoreError::UnknownMarginTier(47)
        );
    }

    #[test]
    fn step_tabs_cover_one_through_five_plus_the_budget() {
        assert_eq!(recovery_step_tabs(5), vec![1, 2, 3, 4, 5]);
        assert_eq!(recovery_step_tabs(8), vec![1, 2, 3, 4, 5, 8]);
        assert_eq!(recovery_step_tabs(3), vec![1, 2, 3]);
        assert_eq!(recovery_step_tabs(1), vec![1]);
    }
}
