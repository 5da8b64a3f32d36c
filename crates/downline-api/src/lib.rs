use std::path::PathBuf;

use anyhow::{anyhow, Result};
use downline_core::{
    evaluate_threshold, fund_summary, leaderboard_rows, run_rollup, team_summary, volume_series,
    FundSummary, LeaderboardRow, Member, MemberId, NetworkReport, NetworkStore,
    PerformanceSnapshot, RollupError, SeriesPoint, TeamSummary, ThresholdOutcome,
    DEFAULT_MAX_DEPTH,
};
use downline_store_sqlite::{IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddMemberRequest {
    pub member_id: Option<MemberId>,
    pub name: String,
    pub title: String,
    pub avatar_uri: Option<String>,
    pub upline_id: Option<MemberId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub joined_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddSnapshotRequest {
    pub member_id: MemberId,
    pub year: i32,
    pub month: u8,
    pub monthly_volume_cents: i64,
    pub monthly_loan_count: u32,
    pub ytd_volume_cents: i64,
    pub ytd_loan_count: u32,
    pub compensation_cents: i64,
    pub fund_contribution_cents: i64,
    pub fund_balance_cents: i64,
    pub recruitment_tier: u8,
    pub active_recruit_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollupRequest {
    pub root_member_id: MemberId,
    pub max_depth: Option<u32>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct DownlineApi {
    db_path: PathBuf,
}

impl DownlineApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or
    /// queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run
    /// mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run database integrity verification.
    ///
    /// # Errors
    /// Returns an error when the checks cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.integrity_check()
    }

    /// Register one member.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails.
    pub fn add_member(&self, input: AddMemberRequest) -> Result<Member> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let member = Member {
            member_id: input.member_id.unwrap_or_default(),
            name: input.name,
            title: input.title,
            avatar_uri: input.avatar_uri,
            upline_id: input.upline_id,
            joined_at: input.joined_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        store.write_member(&member)?;
        Ok(member)
    }

    /// Append one monthly performance snapshot.
    ///
    /// # Errors
    /// Returns an error when validation or persistence fails, or the period
    /// was already recorded.
    pub fn add_snapshot(&self, input: AddSnapshotRequest) -> Result<PerformanceSnapshot> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let snapshot = PerformanceSnapshot {
            member_id: input.member_id,
            year: input.year,
            month: input.month,
            monthly_volume_cents: input.monthly_volume_cents,
            monthly_loan_count: input.monthly_loan_count,
            ytd_volume_cents: input.ytd_volume_cents,
            ytd_loan_count: input.ytd_loan_count,
            compensation_cents: input.compensation_cents,
            fund_contribution_cents: input.fund_contribution_cents,
            fund_balance_cents: input.fund_balance_cents,
            recruitment_tier: input.recruitment_tier,
            active_recruit_count: input.active_recruit_count,
        };
        store.write_snapshot(&snapshot)?;
        Ok(snapshot)
    }

    /// Run the rollup pipeline for a root member and persist the generated
    /// report.
    ///
    /// # Errors
    /// Returns an error when the root is unknown, the request is invalid, or
    /// persistence fails.
    pub fn run_rollup(&self, input: RollupRequest) -> Result<NetworkReport> {
        let mut store = self.open_store()?;
        store.migrate()?;

        let report = generate_report(&store, &input)?;
        store.save_network_report(&report)?;
        Ok(report)
    }

    /// Fetch a previously persisted network report.
    ///
    /// # Errors
    /// Returns an error when lookup fails or the report does not exist.
    pub fn report_show(&self, report_id: &str) -> Result<NetworkReport> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let report = store
            .get_network_report(report_id)?
            .ok_or_else(|| anyhow!("network report not found: {report_id}"))?;
        Ok(report)
    }

    /// Fund-workspace view over a fresh pipeline run. Read-only.
    ///
    /// # Errors
    /// Returns an error when the root is unknown or the request is invalid.
    pub fn fund_view(&self, input: RollupRequest) -> Result<FundSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let report = generate_report(&store, &input)?;
        Ok(fund_summary(&report))
    }

    /// Ranked downline view over a fresh pipeline run. Read-only.
    ///
    /// # Errors
    /// Returns an error when the root is unknown or the request is invalid.
    pub fn leaderboard_view(&self, input: RollupRequest) -> Result<Vec<LeaderboardRow>> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let report = generate_report(&store, &input)?;
        Ok(leaderboard_rows(&report))
    }

    /// Team view over a fresh pipeline run. Read-only.
    ///
    /// # Errors
    /// Returns an error when the root is unknown or the request is invalid.
    pub fn team_view(&self, input: RollupRequest) -> Result<TeamSummary> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let report = generate_report(&store, &input)?;
        Ok(team_summary(&report))
    }

    /// Chart-ready monthly volume points for one member over a bounded
    /// trailing window.
    ///
    /// # Errors
    /// Returns an error when the member is unknown or the query fails.
    pub fn volume_series(&self, member_id: MemberId, months: usize) -> Result<Vec<SeriesPoint>> {
        let mut store = self.open_store()?;
        store.migrate()?;

        if store.member(member_id)?.is_none() {
            return Err(RollupError::NotFound(member_id).into());
        }
        let snapshots = store.snapshots_for_member(member_id, months)?;
        Ok(volume_series(&snapshots))
    }

    /// Evaluate the threshold policy against a member's own latest snapshot.
    ///
    /// # Errors
    /// Returns an error when the member is unknown.
    pub fn threshold_check(&self, member_id: MemberId) -> Result<ThresholdOutcome> {
        let mut store = self.open_store()?;
        store.migrate()?;

        if store.member(member_id)?.is_none() {
            return Err(RollupError::NotFound(member_id).into());
        }
        let snapshot = match store.latest_snapshot(member_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) | Err(_) => PerformanceSnapshot::absent(member_id),
        };
        Ok(evaluate_threshold(snapshot.monthly_volume_cents))
    }
}

fn generate_report(store: &SqliteStore, input: &RollupRequest) -> Result<NetworkReport> {
    let as_of = input.as_of.unwrap_or_else(OffsetDateTime::now_utc);
    let max_depth = input.max_depth.unwrap_or(DEFAULT_MAX_DEPTH);

    let member_ids = store
        .list_members()?
        .iter()
        .map(|member| member.member_id.to_string())
        .collect::<Vec<_>>();
    let snapshot_keys = store.snapshot_revision_keys()?;
    let report_seed =
        compute_report_seed(input.root_member_id, max_depth, as_of, &member_ids, &snapshot_keys);

    let report = run_rollup(store, input.root_member_id, max_depth, as_of, &report_seed)?;
    Ok(report)
}

fn compute_report_seed(
    root_member_id: MemberId,
    max_depth: u32,
    as_of: OffsetDateTime,
    member_ids: &[String],
    snapshot_keys: &[String],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root_member_id.to_string().as_bytes());
    hasher.update(max_depth.to_string().as_bytes());
    hasher.update(as_of.unix_timestamp().to_string().as_bytes());

    for member_id in member_ids {
        hasher.update(member_id.as_bytes());
    }
    for key in snapshot_keys {
        hasher.update(key.as_bytes());
    }

    let digest = hasher.finalize();
    let digest_hex = format!("{digest:x}");
    format!("rev_{}", &digest_hex[..16])
}

#[cfg(test)]
mod tests {
    use downline_core::ContributionRegime;
    use time::Duration;

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("downline-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn add_member_request(name: &str, upline_id: Option<MemberId>) -> AddMemberRequest {
        AddMemberRequest {
            member_id: None,
            name: name.to_string(),
            title: "Loan Officer".to_string(),
            avatar_uri: None,
            upline_id,
            joined_at: Some(fixture_time()),
        }
    }

    fn add_snapshot_request(
        member_id: MemberId,
        month: u8,
        monthly_volume_cents: i64,
    ) -> AddSnapshotRequest {
        AddSnapshotRequest {
            member_id,
            year: 2026,
            month,
            monthly_volume_cents,
            monthly_loan_count: 5,
            ytd_volume_cents: monthly_volume_cents,
            ytd_loan_count: 5,
            compensation_cents: 0,
            fund_contribution_cents: 0,
            fund_balance_cents: 0,
            recruitment_tier: 1,
            active_recruit_count: 0,
        }
    }

    fn seeded_network(api: &DownlineApi) -> Result<MemberId> {
        let root = api.add_member(add_member_request("Root Officer", None))?;
        let first = api.add_member(add_member_request("First Recruit", Some(root.member_id)))?;
        let second = api.add_member(add_member_request("Second Recruit", Some(root.member_id)))?;
        let leaf = api.add_member(add_member_request("Leaf Recruit", Some(first.member_id)))?;

        api.add_snapshot(add_snapshot_request(first.member_id, 7, 180_000_000))?;
        api.add_snapshot(add_snapshot_request(second.member_id, 7, 120_000_000))?;
        api.add_snapshot(add_snapshot_request(leaf.member_id, 7, 80_000_000))?;
        Ok(root.member_id)
    }

    #[test]
    fn rollup_persists_and_reloads_the_report() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());
        let root_id = seeded_network(&api)?;

        let report = api.run_rollup(RollupRequest {
            root_member_id: root_id,
            max_depth: None,
            as_of: Some(fixture_time()),
        })?;

        assert_eq!(report.rollup.total_contribution_cents, 380_000);
        assert_eq!(report.rollup.member_count, 3);

        let loaded = api.report_show(&report.report_id)?;
        assert_eq!(loaded, report);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn identical_input_state_reproduces_the_identical_report() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());
        let root_id = seeded_network(&api)?;

        let request = RollupRequest {
            root_member_id: root_id,
            max_depth: Some(3),
            as_of: Some(fixture_time()),
        };
        let first = api.run_rollup(request.clone())?;
        let second = api.run_rollup(request)?;

        assert_eq!(first.report_id, second.report_id);
        assert_eq!(first, second);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn unknown_root_is_not_found_not_an_empty_rollup() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());
        let _ = seeded_network(&api)?;

        let missing = MemberId::new();
        let err = match api.run_rollup(RollupRequest {
            root_member_id: missing,
            max_depth: None,
            as_of: Some(fixture_time()),
        }) {
            Ok(_) => panic!("expected NotFound for unknown root"),
            Err(err) => err,
        };
        let not_found = err.chain().any(|cause| {
            cause
                .downcast_ref::<RollupError>()
                .is_some_and(|rollup_err| matches!(rollup_err, RollupError::NotFound(_)))
        });
        assert!(not_found, "error chain should carry NotFound: {err}");

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn views_share_one_pipeline_and_disagree_only_in_shape() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());
        let root_id = seeded_network(&api)?;

        let request = RollupRequest {
            root_member_id: root_id,
            max_depth: None,
            as_of: Some(fixture_time()),
        };

        let fund = api.fund_view(request.clone())?;
        assert_eq!(fund.incoming_contribution_cents, 380_000);
        assert_eq!(fund.regime, ContributionRegime::Contributing);

        let rows = api.leaderboard_view(request.clone())?;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].contribution_cents, 180_000);

        let team = api.team_view(request)?;
        assert_eq!(team.network_size, 3);
        assert_eq!(team.direct_recruit_count, 2);
        assert_eq!(team.total_contribution_cents, fund.incoming_contribution_cents);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn threshold_check_requires_an_existing_member() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());
        let root_id = seeded_network(&api)?;

        // Root has no snapshot yet: zero volume, below the threshold.
        let outcome = api.threshold_check(root_id)?;
        assert!(!outcome.reached());
        assert_eq!(outcome.outgoing_contribution_cents, 0);

        assert!(api.threshold_check(MemberId::new()).is_err());

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn volume_series_returns_a_bounded_window_oldest_first() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());
        let member = api.add_member(add_member_request("Officer", None))?;

        for (month, volume) in [(4, 90_000_000), (5, 110_000_000), (6, 100_000_000)] {
            api.add_snapshot(add_snapshot_request(member.member_id, month, volume))?;
        }

        let points = api.volume_series(member.member_id, 2)?;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].label, "2026-05");
        assert_eq!(points[1].label, "2026-06");
        assert_eq!(points[1].value_cents, 100_000_000);

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }

    #[test]
    fn migrate_dry_run_plans_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = DownlineApi::new(db_path.clone());

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(planned.after_version, None);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));

        let _ = std::fs::remove_file(&db_path);
        Ok(())
    }
}
