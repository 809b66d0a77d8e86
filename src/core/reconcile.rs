use super::types::{EditPriority, StepOverrides};

/// The two user-editable table columns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EditColumn {
    MarketGainPct,
    NetProfit,
}

/// The single most-recently-edited cell of a table.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CellEdit {
    pub row: usize,
    pub column: EditColumn,
}

/// One row of the last displayed table, as parsed from the editor. Values are
/// `None` when the displayed cell was a sentinel or not numeric.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct SnapshotRow {
    pub market_gain_pct: Option<f64>,
    pub net_profit: Option<f64>,
}

/// Derives the generator's override arrays from a stored table snapshot and
/// the last-edited cell.
///
/// Rows up to and including the last-edited row are pinned to their last
/// displayed values; rows after it stay free so the generator recomputes them.
/// At the edited row itself the edited column wins and the co-displayed other
/// value is cleared. With no recorded edit every row stays free.
pub fn overrides_from_snapshot(
    step_count: usize,
    snapshot: &[SnapshotRow],
    last_edit: Option<CellEdit>,
) -> StepOverrides {
    let mut overrides = StepOverrides::none(step_count);
    let Some(edit) = last_edit else {
        return overrides;
    };

    for (idx, row) in snapshot.iter().enumerate().take(step_count) {
        if idx > edit.row {
            break;
        }
        overrides.fixed_gain_pct[idx] = row.market_gain_pct;
        overrides.fixed_net_profit[idx] = row.net_profit;
    }

    if edit.row < step_count {
        match edit.column {
            EditColumn::MarketGainPct => {
                overrides.edit_priority[edit.row] = Some(EditPriority::Gain);
                overrides.fixed_net_profit[edit.row] = None;
            }
            EditColumn::NetProfit => {
                overrides.edit_priority[edit.row] = Some(EditPriority::Profit);
                overrides.fixed_gain_pct[edit.row] = None;
            }
        }
    }

    overrides
}

/// Parses a displayed or user-typed cell value. Formatting decoration is
/// stripped per column; sentinel labels and anything non-numeric parse to
/// `None`, which the generator treats as "no override".
pub fn parse_cell_value(raw: &str, column: EditColumn) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let cleaned: String = match column {
        EditColumn::MarketGainPct => trimmed.trim_end_matches('%').trim().to_string(),
        EditColumn::NetProfit => trimmed
            .chars()
            .filter(|c| *c != '₩' && *c != ',' && !c.is_whitespace())
            .collect(),
    };

    // f64::from_str accepts "inf" and "NaN"; those are sentinel text here.
    if cleaned.is_empty() || cleaned.contains('∞') || cleaned.eq_ignore_ascii_case("n/a") {
        return None;
    }
    cleaned
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
