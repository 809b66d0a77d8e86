use super::types::{
    CoreError, EditPriority, LossMetrics, PlanRequest, RecoveryRow, StepGain,
    TRANSACTION_FEE_RATE,
};

fn total_loss_ratio(market_loss_pct: f64, leverage: f64) -> f64 {
    market_loss_pct / 100.0 * leverage + leverage * TRANSACTION_FEE_RATE
}

/// Converts a market-level loss into the account-level loss it produced,
/// including the one-way entry fee on the leveraged position.
pub fn loss_from_capital(initial_capital: f64, market_loss_pct: f64, leverage: f64) -> LossMetrics {
    if initial_capital <= 0.0 {
        return LossMetrics {
            loss_pct: 0.0,
            loss_amount: 0.0,
        };
    }
    let total_ratio = total_loss_ratio(market_loss_pct, leverage);
    LossMetrics {
        loss_pct: total_ratio * 100.0,
        loss_amount: initial_capital * total_ratio,
    }
}

/// Inverse of [`loss_from_capital`]: recovers the initial capital from the
/// account-level loss amount. A nonzero loss with a zero loss ratio is
/// mathematically inconsistent and surfaces as [`CoreError::InconsistentLoss`].
pub fn capital_from_loss(
    loss_amount: f64,
    market_loss_pct: f64,
    leverage: f64,
) -> Result<f64, CoreError> {
    if loss_amount < 0.0 {
        return Ok(0.0);
    }
    let total_ratio = total_loss_ratio(market_loss_pct, leverage);
    if total_ratio <= 0.0 {
        return if loss_amount == 0.0 {
            Ok(0.0)
        } else {
            Err(CoreError::InconsistentLoss { loss_amount })
        };
    }
    Ok((loss_amount / total_ratio).max(0.0))
}

/// Market gain (%) needed for one step to net a given profit from the capital
/// entering that step. Exact algebraic inverse of the forward step transform.
pub fn gain_from_profit(
    net_profit: f64,
    capital_at_step_start: f64,
    recovery_leverage: f64,
) -> StepGain {
    if capital_at_step_start <= 0.0 || recovery_leverage == 0.0 {
        return if net_profit > 0.0 {
            StepGain::Unrecoverable
        } else {
            StepGain::Finite(0.0)
        };
    }
    let fee_ratio = recovery_leverage * TRANSACTION_FEE_RATE;
    StepGain::Finite((net_profit / capital_at_step_start + fee_ratio) / recovery_leverage * 100.0)
}

/// Net profit produced by one step at the given market gain.
pub fn net_profit_for_gain(
    gain_pct: f64,
    capital_at_step_start: f64,
    recovery_leverage: f64,
) -> f64 {
    apply_step(gain_pct, capital_at_step_start, recovery_leverage).0
}

/// Forward step transform: (net profit, capital after the trade). Capital is
/// clamped at zero; an account cannot go negative.
fn apply_step(gain_pct: f64, capital: f64, leverage: f64) -> (f64, f64) {
    let net_change = gain_pct / 100.0 * leverage - leverage * TRANSACTION_FEE_RATE;
    let profit = capital * net_change;
    (profit, (capital * (1.0 + net_change)).max(0.0))
}

/// Uniform per-step growth solving `capital * ratio^remaining == target`,
/// converted into the market gain that produces it.
fn auto_required_gain(
    capital: f64,
    target: f64,
    remaining_steps: usize,
    leverage: f64,
) -> StepGain {
    if capital <= 0.0 {
        return StepGain::Unrecoverable;
    }
    let required_total_ratio = target / capital;
    if !required_total_ratio.is_finite() || required_total_ratio < 0.0 {
        return StepGain::Unrecoverable;
    }
    let required_step_ratio = required_total_ratio.powf(1.0 / remaining_steps as f64);
    if !required_step_ratio.is_finite() {
        return StepGain::Unrecoverable;
    }
    if leverage == 0.0 {
        return if required_step_ratio > 1.00001 {
            StepGain::Unrecoverable
        } else {
            StepGain::Finite(0.0)
        };
    }
    let fee_ratio = leverage * TRANSACTION_FEE_RATE;
    StepGain::Finite((required_step_ratio - 1.0 + fee_ratio) / leverage * 100.0)
}

/// Builds the per-step recovery table. Steps run sequentially: each consumes
/// the previous step's resulting capital. A step honors a user-fixed profit
/// (inverted into a gain) or a user-fixed gain, and otherwise computes the
/// geometric-mean gain that lands on the original capital in the steps left.
pub fn generate_recovery_table(request: &PlanRequest) -> Vec<RecoveryRow> {
    let steps = request.step_count;

    if request.initial_capital <= 0.0 {
        return sentinel_table(steps, StepGain::NotApplicable);
    }
    if request.actual_total_loss_pct >= 100.0 && request.overrides.is_empty() {
        // 100%+ loss leaves nothing to compound from, and there is no user
        // override to seed a nonzero start.
        return sentinel_table(steps, StepGain::Unrecoverable);
    }

    let target = request.initial_capital;
    let mut capital =
        request.initial_capital * (1.0 - request.actual_total_loss_pct / 100.0).max(0.0);
    let mut rows = Vec::with_capacity(steps);

    for n in 0..steps {
        let fixed_gain = request.overrides.fixed_gain_pct.get(n).copied().flatten();
        let fixed_profit = request.overrides.fixed_net_profit.get(n).copied().flatten();
        let priority = request.overrides.edit_priority.get(n).copied().flatten();

        let mut user_fixed = true;
        let gain = match (priority, fixed_profit, fixed_gain) {
            (Some(EditPriority::Profit), Some(profit), _) => {
                gain_from_profit(profit, capital, request.recovery_leverage)
            }
            (_, _, Some(gain_pct)) => StepGain::Finite(gain_pct),
            _ => {
                user_fixed = false;
                auto_required_gain(capital, target, steps - n, request.recovery_leverage)
            }
        };

        let (net_profit, capital_after) = match gain {
            StepGain::Finite(gain_pct) => {
                apply_step(gain_pct, capital, request.recovery_leverage)
            }
            // An explicit user override to an unrecoverable value does not
            // zero out prior progress.
            _ if user_fixed => (0.0, capital),
            _ => (0.0, 0.0),
        };

        rows.push(RecoveryRow {
            round: n + 1,
            market_gain_pct: gain,
            cumulative_capital: capital_after,
            net_profit,
        });
        capital = capital_after;
    }

    rows
}

fn sentinel_table(steps: usize, gain: StepGain) -> Vec<RecoveryRow> {
    (1..=steps)
        .map(|round| RecoveryRow {
            round,
            market_gain_pct: gain,
            cumulative_capital: 0.0,
            net_profit: 0.0,
        })
        .collect()
}
