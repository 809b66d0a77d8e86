use axum::{
    Router,
    extract::{Json, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::net::TcpListener;

use crate::config::{USER_CONFIG_FILE, UserConfig};
use crate::core::{
    CellEdit, EditColumn, EditPriority, MARGIN_TIERS, MarginTier, PlanRequest, RecoveryRow,
    SnapshotRow, StepOverrides, capital_from_loss, generate_recovery_table, loss_from_capital,
    margin_tier, parse_cell_value,
};
use crate::session::{DrivingField, Session, recovery_step_tabs};

#[derive(Parser, Debug)]
#[command(
    name = "relever",
    about = "Leveraged-trading loss recovery planner (per-step required market gains)"
)]
struct Cli {
    #[arg(long, default_value_t = 1_000_000.0, help = "Initial capital before the loss")]
    initial_capital: f64,
    #[arg(
        long,
        default_value_t = 7.67,
        help = "Market-level loss in percent, before leverage and fees"
    )]
    market_loss_pct: f64,
    #[arg(
        long,
        default_value_t = 40,
        help = "Margin percentage in use when the loss occurred"
    )]
    loss_margin_pct: u32,
    #[arg(
        long,
        help = "Account-level loss amount; when set, the initial capital is derived from it"
    )]
    loss_amount: Option<f64>,
    #[arg(long, help = "Only tabulate this recovery margin percentage")]
    recovery_margin_pct: Option<u32>,
    #[arg(long, help = "Only tabulate this many recovery trades")]
    steps: Option<usize>,
    #[arg(
        long,
        default_value_t = 5,
        help = "Largest recovery trade count to tabulate"
    )]
    max_recovery_trades: usize,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ApiEditPriority {
    Gain,
    Profit,
}

impl From<ApiEditPriority> for EditPriority {
    fn from(value: ApiEditPriority) -> Self {
        match value {
            ApiEditPriority::Gain => EditPriority::Gain,
            ApiEditPriority::Profit => EditPriority::Profit,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ApiEditColumn {
    Gain,
    Profit,
}

impl From<ApiEditColumn> for EditColumn {
    fn from(value: ApiEditColumn) -> Self {
        match value {
            ApiEditColumn::Gain => EditColumn::MarketGainPct,
            ApiEditColumn::Profit => EditColumn::NetProfit,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PlanPayload {
    initial_capital: Option<f64>,
    market_loss_pct: Option<f64>,
    loss_margin_pct: Option<u32>,
    actual_total_loss_pct: Option<f64>,
    recovery_margin_pct: Option<u32>,
    step_count: Option<usize>,
    fixed_gain_pct: Option<Vec<Option<f64>>>,
    fixed_net_profit: Option<Vec<Option<f64>>>,
    edit_priority: Option<Vec<Option<ApiEditPriority>>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct InputsPayload {
    market_loss_pct: Option<f64>,
    loss_margin_pct: Option<u32>,
    initial_capital: Option<f64>,
    actual_loss_amount: Option<f64>,
    max_recovery_trades: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditPayload {
    step_count: usize,
    margin_pct: u32,
    row: usize,
    column: ApiEditColumn,
    value: serde_json::Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResetPayload {
    step_count: usize,
    margin_pct: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TierTable {
    margin_pct: u32,
    leverage: f64,
    rows: Vec<RecoveryRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    initial_capital: f64,
    actual_total_loss_pct: f64,
    step_count: usize,
    tables: Vec<TierTable>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateResponse {
    initial_capital: f64,
    market_loss_pct: f64,
    loss_margin_pct: u32,
    leverage_at_loss: f64,
    actual_loss_pct: f64,
    actual_loss_amount: f64,
    driving_field: &'static str,
    max_recovery_trades: usize,
    step_tabs: Vec<usize>,
    margin_tiers: Vec<MarginTier>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// The scenario a stateless plan call resolves to after validation.
#[derive(Debug)]
struct PlanScenario {
    initial_capital: f64,
    actual_total_loss_pct: f64,
    step_count: usize,
    tiers: Vec<MarginTier>,
    overrides: StepOverrides,
}

/// Recovery tiers in display order: highest leverage first.
fn tiers_by_leverage_desc() -> Vec<MarginTier> {
    let mut tiers = MARGIN_TIERS.to_vec();
    tiers.sort_by(|a, b| b.leverage.total_cmp(&a.leverage));
    tiers
}

fn build_plan_scenario(payload: PlanPayload) -> Result<PlanScenario, String> {
    let initial_capital = payload.initial_capital.unwrap_or(1_000_000.0);
    if !initial_capital.is_finite() || initial_capital < 0.0 {
        return Err("initialCapital must be >= 0".to_string());
    }

    let actual_total_loss_pct = match payload.actual_total_loss_pct {
        Some(pct) => {
            if !pct.is_finite() || pct < 0.0 {
                return Err("actualTotalLossPct must be >= 0".to_string());
            }
            pct
        }
        None => {
            let market_loss_pct = payload.market_loss_pct.unwrap_or(7.67);
            if !(0.0..=100.0).contains(&market_loss_pct) {
                return Err("marketLossPct must be between 0 and 100".to_string());
            }
            let tier = margin_tier(payload.loss_margin_pct.unwrap_or(40))
                .map_err(|e| e.to_string())?;
            loss_from_capital(initial_capital, market_loss_pct, tier.leverage).loss_pct
        }
    };

    let step_count = payload.step_count.unwrap_or(5);
    if !(1..=50).contains(&step_count) {
        return Err("stepCount must be between 1 and 50".to_string());
    }

    let has_overrides = payload.fixed_gain_pct.is_some()
        || payload.fixed_net_profit.is_some()
        || payload.edit_priority.is_some();

    let tiers = match payload.recovery_margin_pct {
        Some(pct) => vec![margin_tier(pct).map_err(|e| e.to_string())?],
        None if has_overrides => {
            return Err(
                "recoveryMarginPct is required when override arrays are supplied".to_string()
            );
        }
        None => tiers_by_leverage_desc(),
    };

    let mut overrides = StepOverrides::none(step_count);
    if let Some(gains) = payload.fixed_gain_pct {
        if gains.len() != step_count {
            return Err("fixedGainPct length must equal stepCount".to_string());
        }
        overrides.fixed_gain_pct = gains;
    }
    if let Some(profits) = payload.fixed_net_profit {
        if profits.len() != step_count {
            return Err("fixedNetProfit length must equal stepCount".to_string());
        }
        overrides.fixed_net_profit = profits;
    }
    if let Some(priorities) = payload.edit_priority {
        if priorities.len() != step_count {
            return Err("editPriority length must equal stepCount".to_string());
        }
        overrides.edit_priority = priorities
            .into_iter()
            .map(|p| p.map(EditPriority::from))
            .collect();
    }

    Ok(PlanScenario {
        initial_capital,
        actual_total_loss_pct,
        step_count,
        tiers,
        overrides,
    })
}

fn plan_response(scenario: PlanScenario) -> PlanResponse {
    let tables = scenario
        .tiers
        .iter()
        .map(|tier| {
            let request = PlanRequest {
                initial_capital: scenario.initial_capital,
                actual_total_loss_pct: scenario.actual_total_loss_pct,
                recovery_leverage: tier.leverage,
                step_count: scenario.step_count,
                overrides: scenario.overrides.clone(),
            };
            TierTable {
                margin_pct: tier.margin_pct,
                leverage: tier.leverage,
                rows: generate_recovery_table(&request),
            }
        })
        .collect();

    PlanResponse {
        initial_capital: scenario.initial_capital,
        actual_total_loss_pct: scenario.actual_total_loss_pct,
        step_count: scenario.step_count,
        tables,
    }
}

fn state_response(session: &Session) -> StateResponse {
    StateResponse {
        initial_capital: session.financial.initial_capital(),
        market_loss_pct: session.financial.market_loss_pct(),
        loss_margin_pct: session.financial.loss_margin_pct(),
        leverage_at_loss: session.financial.leverage_at_loss(),
        actual_loss_pct: session.financial.actual_loss_pct(),
        actual_loss_amount: session.financial.actual_loss_amount(),
        driving_field: match session.financial.driving_field() {
            DrivingField::Capital => "capital",
            DrivingField::LossAmount => "lossAmount",
        },
        max_recovery_trades: session.max_recovery_trades,
        step_tabs: recovery_step_tabs(session.max_recovery_trades),
        margin_tiers: tiers_by_leverage_desc(),
    }
}

fn apply_inputs(session: &mut Session, payload: InputsPayload) -> Result<(), String> {
    if let Some(pct) = payload.market_loss_pct {
        if !(0.0..=100.0).contains(&pct) {
            return Err("marketLossPct must be between 0 and 100".to_string());
        }
        session.financial.set_market_loss_pct(pct);
    }
    if let Some(margin) = payload.loss_margin_pct {
        session
            .financial
            .set_loss_margin_pct(margin)
            .map_err(|e| e.to_string())?;
    }
    if let Some(capital) = payload.initial_capital {
        if !capital.is_finite() || capital < 0.0 {
            return Err("initialCapital must be >= 0".to_string());
        }
        session.financial.set_initial_capital(capital);
    }
    if let Some(amount) = payload.actual_loss_amount {
        if !amount.is_finite() || amount < 0.0 {
            return Err("actualLossAmount must be >= 0".to_string());
        }
        session.financial.set_actual_loss_amount(amount);
    }
    if let Some(trades) = payload.max_recovery_trades {
        if !(1..=20).contains(&trades) {
            return Err("maxRecoveryTrades must be between 1 and 20".to_string());
        }
        session.max_recovery_trades = trades;
    }
    Ok(())
}

fn snapshot_from_rows(rows: &[RecoveryRow]) -> Vec<SnapshotRow> {
    rows.iter()
        .map(|row| SnapshotRow {
            market_gain_pct: row.market_gain_pct.finite(),
            net_profit: Some(row.net_profit),
        })
        .collect()
}

fn parse_payload_value(value: &serde_json::Value, column: EditColumn) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => parse_cell_value(s, column),
        _ => None,
    }
}

/// Records an edited cell into the session's history and regenerates the
/// edited table. The stored snapshot is the last displayed table with the new
/// value applied at the edited cell.
fn apply_edit(session: &mut Session, payload: EditPayload) -> Result<TierTable, String> {
    let tier = margin_tier(payload.margin_pct).map_err(|e| e.to_string())?;
    if payload.row >= payload.step_count {
        return Err("row must be < stepCount".to_string());
    }
    if !(1..=50).contains(&payload.step_count) {
        return Err("stepCount must be between 1 and 50".to_string());
    }

    let column = EditColumn::from(payload.column);
    let displayed = session
        .plan_for(payload.step_count, tier.margin_pct)
        .map_err(|e| e.to_string())?;

    let mut snapshot = snapshot_from_rows(&displayed);
    let parsed = parse_payload_value(&payload.value, column);
    match column {
        EditColumn::MarketGainPct => snapshot[payload.row].market_gain_pct = parsed,
        EditColumn::NetProfit => snapshot[payload.row].net_profit = parsed,
    }
    session.edits.record_edit(
        (payload.step_count, tier.margin_pct),
        snapshot,
        CellEdit {
            row: payload.row,
            column,
        },
    );

    let rows = session
        .plan_for(payload.step_count, tier.margin_pct)
        .map_err(|e| e.to_string())?;
    Ok(TierTable {
        margin_pct: tier.margin_pct,
        leverage: tier.leverage,
        rows,
    })
}

fn apply_reset(session: &mut Session, payload: ResetPayload) -> Result<TierTable, String> {
    let tier = margin_tier(payload.margin_pct).map_err(|e| e.to_string())?;
    session.edits.reset((payload.step_count, tier.margin_pct));
    let rows = session
        .plan_for(payload.step_count, tier.margin_pct)
        .map_err(|e| e.to_string())?;
    Ok(TierTable {
        margin_pct: tier.margin_pct,
        leverage: tier.leverage,
        rows,
    })
}

struct ServerState {
    session: Session,
    config_path: PathBuf,
}

type SharedState = Arc<Mutex<ServerState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, ServerState> {
    state.lock().expect("session state lock poisoned")
}

fn persist_config(server: &ServerState) {
    if let Err(err) = server.session.to_config().save(&server.config_path) {
        tracing::warn!(
            "failed to persist config to {}: {err}",
            server.config_path.display()
        );
    }
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let config_path = PathBuf::from(USER_CONFIG_FILE);
    let session = Session::from_config(&UserConfig::load(&config_path));
    let state: SharedState = Arc::new(Mutex::new(ServerState {
        session,
        config_path,
    }));

    let app = Router::new()
        .route("/api/state", get(state_handler))
        .route("/api/inputs", post(inputs_handler))
        .route("/api/plan", get(plan_get_handler).post(plan_post_handler))
        .route("/api/edit", post(edit_handler))
        .route("/api/reset", post(reset_handler))
        .fallback(not_found_handler)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("recovery planner API listening on http://{addr}");

    axum::serve(listener, app).await
}

async fn state_handler(State(state): State<SharedState>) -> Response {
    let server = lock_state(&state);
    json_response(StatusCode::OK, state_response(&server.session))
}

async fn inputs_handler(State(state): State<SharedState>, Json(payload): Json<InputsPayload>) -> Response {
    let mut server = lock_state(&state);
    if let Err(msg) = apply_inputs(&mut server.session, payload) {
        return error_response(StatusCode::BAD_REQUEST, &msg);
    }
    persist_config(&server);
    json_response(StatusCode::OK, state_response(&server.session))
}

async fn plan_get_handler(Query(payload): Query<PlanPayload>) -> Response {
    plan_handler_impl(payload)
}

async fn plan_post_handler(Json(payload): Json<PlanPayload>) -> Response {
    plan_handler_impl(payload)
}

fn plan_handler_impl(payload: PlanPayload) -> Response {
    match build_plan_scenario(payload) {
        Ok(scenario) => json_response(StatusCode::OK, plan_response(scenario)),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn edit_handler(State(state): State<SharedState>, Json(payload): Json<EditPayload>) -> Response {
    let mut server = lock_state(&state);
    match apply_edit(&mut server.session, payload) {
        Ok(table) => json_response(StatusCode::OK, table),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn reset_handler(State(state): State<SharedState>, Json(payload): Json<ResetPayload>) -> Response {
    let mut server = lock_state(&state);
    match apply_reset(&mut server.session, payload) {
        Ok(table) => json_response(StatusCode::OK, table),
        Err(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
    }
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

/// One-shot CLI: validate the flags, print the loss summary and the recovery
/// tables to stdout.
pub fn run_plan_cli() -> Result<(), String> {
    let cli = Cli::parse();
    let output = run_plan(cli)?;
    print!("{output}");
    Ok(())
}

fn run_plan(cli: Cli) -> Result<String, String> {
    if !cli.initial_capital.is_finite() || cli.initial_capital < 0.0 {
        return Err("--initial-capital must be >= 0".to_string());
    }
    if !(0.0..=100.0).contains(&cli.market_loss_pct) {
        return Err("--market-loss-pct must be between 0 and 100".to_string());
    }
    if !(1..=20).contains(&cli.max_recovery_trades) {
        return Err("--max-recovery-trades must be between 1 and 20".to_string());
    }
    let loss_tier = margin_tier(cli.loss_margin_pct).map_err(|e| e.to_string())?;

    let initial_capital = match cli.loss_amount {
        Some(amount) => {
            if !amount.is_finite() || amount < 0.0 {
                return Err("--loss-amount must be >= 0".to_string());
            }
            capital_from_loss(amount, cli.market_loss_pct, loss_tier.leverage)
                .map_err(|e| e.to_string())?
        }
        None => cli.initial_capital,
    };

    let steps_to_show = match cli.steps {
        Some(steps) => {
            if !(1..=cli.max_recovery_trades).contains(&steps) {
                return Err("--steps must be between 1 and --max-recovery-trades".to_string());
            }
            vec![steps]
        }
        None => recovery_step_tabs(cli.max_recovery_trades),
    };
    let tiers = match cli.recovery_margin_pct {
        Some(pct) => vec![margin_tier(pct).map_err(|e| e.to_string())?],
        None => tiers_by_leverage_desc(),
    };

    let metrics = loss_from_capital(initial_capital, cli.market_loss_pct, loss_tier.leverage);
    let mut out = String::new();
    out.push_str(&format!(
        "Capital {} with a {:.2}% market loss at {:.2}x (margin {}%): account loss {:.2}% ({})\n",
        format_currency(initial_capital),
        cli.market_loss_pct,
        loss_tier.leverage,
        loss_tier.margin_pct,
        metrics.loss_pct,
        format_currency(metrics.loss_amount),
    ));

    for step_count in steps_to_show {
        for tier in &tiers {
            let request = PlanRequest::auto(
                initial_capital,
                metrics.loss_pct,
                tier.leverage,
                step_count,
            );
            let rows = generate_recovery_table(&request);
            out.push_str(&format!(
                "\nRecover in {} trade(s) at margin {}% ({:.2}x):\n",
                step_count, tier.margin_pct, tier.leverage
            ));
            out.push_str(&render_table(&rows));
        }
    }
    Ok(out)
}

fn render_table(rows: &[RecoveryRow]) -> String {
    let mut out = format!(
        "{:>5}  {:>20}  {:>16}  {:>16}\n",
        "Round", "Market gain", "Capital", "Net profit"
    );
    for row in rows {
        out.push_str(&format!(
            "{:>5}  {:>20}  {:>16}  {:>16}\n",
            row.round,
            row.market_gain_pct.to_string(),
            format_currency(row.cumulative_capital),
            format_currency(row.net_profit),
        ));
    }
    out
}

/// Whole-unit currency with thousands separators.
fn format_currency(value: f64) -> String {
    let rounded = value.round();
    let negative = rounded < 0.0;
    let digits = format!("{:.0}", rounded.abs());
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    if negative { format!("-{out}") } else { out }
}
