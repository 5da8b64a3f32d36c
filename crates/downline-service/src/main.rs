use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use downline_api::{
    AddMemberRequest, AddSnapshotRequest, DownlineApi, MigrateResult, RollupRequest,
    API_CONTRACT_VERSION,
};
use downline_core::{
    FundSummary, LeaderboardRow, MemberId, NetworkReport, RollupError, SeriesPoint, TeamSummary,
    ThresholdOutcome,
};
use downline_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: DownlineApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip)]
    status: StatusCode,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct SeriesParams {
    months: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "downline-service")]
#[command(about = "Local HTTP service for the downline network rollup")]
struct Args {
    #[arg(long, default_value = "./downline.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

/// An unknown root member is a 404, bad input is a 400, and everything else
/// is a 500. An empty network is not an error at all: it flows through as a
/// regular all-zero payload.
fn service_error(err: &anyhow::Error) -> ServiceError {
    let status = if let Some(rollup_err) =
        err.chain().find_map(|cause| cause.downcast_ref::<RollupError>())
    {
        match rollup_err {
            RollupError::NotFound(_) => StatusCode::NOT_FOUND,
            RollupError::Validation(_) => StatusCode::BAD_REQUEST,
            RollupError::Query(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    } else if err.chain().any(|cause| cause.to_string().starts_with("network report not found")) {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: err.to_string(),
        status,
    }
}

fn invalid_id_error(value: &str) -> ServiceError {
    ServiceError {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        error: format!("invalid member id: {value}"),
        status: StatusCode::BAD_REQUEST,
    }
}

fn parse_member_id(value: &str) -> Result<MemberId, ServiceError> {
    MemberId::parse(value).ok_or_else(|| invalid_id_error(value))
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .route("/v1/members/add", post(members_add))
        .route("/v1/snapshots/add", post(snapshots_add))
        .route("/v1/network/rollup", post(network_rollup))
        .route("/v1/network/fund", post(network_fund))
        .route("/v1/network/leaderboard", post(network_leaderboard))
        .route("/v1/network/team", post(network_team))
        .route("/v1/network/report/:report_id", get(report_show))
        .route("/v1/members/:member_id/threshold", get(member_threshold))
        .route("/v1/members/:member_id/series", get(member_series))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let state = ServiceState { api: DownlineApi::new(args.db) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    info!("downline service listening on {}", args.bind);
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.api.schema_status().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let result = state.api.migrate(request.dry_run).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = state.api.integrity_check().map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn members_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddMemberRequest>,
) -> Result<Json<ServiceEnvelope<downline_core::Member>>, ServiceError> {
    let member = state.api.add_member(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(member)))
}

async fn snapshots_add(
    State(state): State<ServiceState>,
    Json(request): Json<AddSnapshotRequest>,
) -> Result<Json<ServiceEnvelope<downline_core::PerformanceSnapshot>>, ServiceError> {
    let snapshot = state.api.add_snapshot(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(snapshot)))
}

async fn network_rollup(
    State(state): State<ServiceState>,
    Json(request): Json<RollupRequest>,
) -> Result<Json<ServiceEnvelope<NetworkReport>>, ServiceError> {
    info!(root = %request.root_member_id, "network rollup requested");
    let report = state.api.run_rollup(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn network_fund(
    State(state): State<ServiceState>,
    Json(request): Json<RollupRequest>,
) -> Result<Json<ServiceEnvelope<FundSummary>>, ServiceError> {
    let summary = state.api.fund_view(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(summary)))
}

async fn network_leaderboard(
    State(state): State<ServiceState>,
    Json(request): Json<RollupRequest>,
) -> Result<Json<ServiceEnvelope<Vec<LeaderboardRow>>>, ServiceError> {
    let rows = state.api.leaderboard_view(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(rows)))
}

async fn network_team(
    State(state): State<ServiceState>,
    Json(request): Json<RollupRequest>,
) -> Result<Json<ServiceEnvelope<TeamSummary>>, ServiceError> {
    let summary = state.api.team_view(request).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(summary)))
}

async fn report_show(
    State(state): State<ServiceState>,
    Path(report_id): Path<String>,
) -> Result<Json<ServiceEnvelope<NetworkReport>>, ServiceError> {
    let report = state.api.report_show(&report_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(report)))
}

async fn member_threshold(
    State(state): State<ServiceState>,
    Path(member_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ThresholdOutcome>>, ServiceError> {
    let member_id = parse_member_id(&member_id)?;
    let outcome = state.api.threshold_check(member_id).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(outcome)))
}

async fn member_series(
    State(state): State<ServiceState>,
    Path(member_id): Path<String>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<ServiceEnvelope<Vec<SeriesPoint>>>, ServiceError> {
    let member_id = parse_member_id(&member_id)?;
    let months = params.months.unwrap_or(12);
    let points = state.api.volume_series(member_id, months).map_err(|err| service_error(&err))?;
    Ok(Json(envelope(points)))
}
