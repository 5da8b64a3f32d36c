use std::path::Path;

use anyhow::{anyhow, Context, Result};
use downline_core::{
    Member, MemberId, NetworkReport, NetworkStore, PerformanceSnapshot, RollupError,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS members (
  member_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  title TEXT NOT NULL,
  avatar_uri TEXT,
  upline_id TEXT REFERENCES members(member_id),
  joined_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS performance_snapshots (
  member_id TEXT NOT NULL REFERENCES members(member_id),
  year INTEGER NOT NULL,
  month INTEGER NOT NULL CHECK (month BETWEEN 1 AND 12),
  monthly_volume_cents INTEGER NOT NULL CHECK (monthly_volume_cents >= 0),
  monthly_loan_count INTEGER NOT NULL CHECK (monthly_loan_count >= 0),
  ytd_volume_cents INTEGER NOT NULL CHECK (ytd_volume_cents >= 0),
  ytd_loan_count INTEGER NOT NULL CHECK (ytd_loan_count >= 0),
  compensation_cents INTEGER NOT NULL CHECK (compensation_cents >= 0),
  fund_contribution_cents INTEGER NOT NULL CHECK (fund_contribution_cents >= 0),
  fund_balance_cents INTEGER NOT NULL CHECK (fund_balance_cents >= 0),
  recruitment_tier INTEGER NOT NULL CHECK (recruitment_tier >= 0),
  active_recruit_count INTEGER NOT NULL CHECK (active_recruit_count >= 0),
  PRIMARY KEY (member_id, year, month)
);

CREATE TABLE IF NOT EXISTS network_reports (
  report_id TEXT PRIMARY KEY,
  generated_at TEXT NOT NULL,
  report_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_members_upline ON members(upline_id);
CREATE INDEX IF NOT EXISTS idx_snapshots_member_period
  ON performance_snapshots(member_id, year DESC, month DESC);
";

const MEMBER_COLUMNS: &str = "member_id, name, title, avatar_uri, upline_id, joined_at";

const SNAPSHOT_COLUMNS: &str = "member_id, year, month, monthly_volume_cents, \
     monthly_loan_count, ytd_volume_cents, ytd_loan_count, compensation_cents, \
     fund_contribution_cents, fund_balance_cents, recruitment_tier, active_recruit_count";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

struct MemberRow {
    member_id: String,
    name: String,
    title: String,
    avatar_uri: Option<String>,
    upline_id: Option<String>,
    joined_at: String,
}

struct SnapshotRow {
    member_id: String,
    year: i32,
    month: u8,
    monthly_volume_cents: i64,
    monthly_loan_count: u32,
    ytd_volume_cents: i64,
    ytd_loan_count: u32,
    compensation_cents: i64,
    fund_contribution_cents: i64,
    fund_balance_cents: i64,
    recruitment_tier: u8,
    active_recruit_count: u32,
}

impl SqliteStore {
    /// Open a SQLite-backed network store and configure required runtime
    /// pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema
    /// version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Register one member row. The upline reference, when present, must
    /// already exist; the relation is a tree rooted at members with no
    /// upline.
    ///
    /// # Errors
    /// Returns an error when validation fails, the id is already registered,
    /// or the upline reference is unknown.
    pub fn write_member(&mut self, member: &Member) -> Result<()> {
        member.validate()?;
        let joined_at =
            member.joined_at.format(&Rfc3339).context("failed to format joined_at")?;

        self.conn
            .execute(
                "INSERT INTO members(member_id, name, title, avatar_uri, upline_id, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    member.member_id.to_string(),
                    member.name,
                    member.title,
                    member.avatar_uri,
                    member.upline_id.map(|upline_id| upline_id.to_string()),
                    joined_at,
                ],
            )
            .with_context(|| format!("failed to insert member {}", member.member_id))?;

        Ok(())
    }

    /// Append one monthly snapshot. Snapshots are immutable: re-inserting an
    /// already-recorded `(member, year, month)` period is an error.
    ///
    /// # Errors
    /// Returns an error when validation fails, the member is unknown, or the
    /// period was already recorded.
    pub fn write_snapshot(&mut self, snapshot: &PerformanceSnapshot) -> Result<()> {
        snapshot.validate()?;

        self.conn
            .execute(
                "INSERT INTO performance_snapshots(
                    member_id, year, month, monthly_volume_cents, monthly_loan_count,
                    ytd_volume_cents, ytd_loan_count, compensation_cents,
                    fund_contribution_cents, fund_balance_cents, recruitment_tier,
                    active_recruit_count
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    snapshot.member_id.to_string(),
                    snapshot.year,
                    snapshot.month,
                    snapshot.monthly_volume_cents,
                    snapshot.monthly_loan_count,
                    snapshot.ytd_volume_cents,
                    snapshot.ytd_loan_count,
                    snapshot.compensation_cents,
                    snapshot.fund_contribution_cents,
                    snapshot.fund_balance_cents,
                    snapshot.recruitment_tier,
                    snapshot.active_recruit_count,
                ],
            )
            .with_context(|| {
                format!(
                    "failed to insert snapshot {} for member {}",
                    snapshot.period_label(),
                    snapshot.member_id
                )
            })?;

        Ok(())
    }

    /// All registered members, ordered by id.
    ///
    /// # Errors
    /// Returns an error when the query cannot be executed.
    pub fn list_members(&self) -> Result<Vec<Member>> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members ORDER BY member_id ASC");
        Ok(members_query(&self.conn, &sql, params![])?)
    }

    /// A bounded trailing window of snapshots for one member, newest first.
    ///
    /// # Errors
    /// Returns an error when the query cannot be executed.
    pub fn snapshots_for_member(
        &self,
        member_id: MemberId,
        limit: usize,
    ) -> Result<Vec<PerformanceSnapshot>> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM performance_snapshots
             WHERE member_id = ?1 ORDER BY year DESC, month DESC LIMIT ?2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        Ok(snapshots_query(&self.conn, &sql, params![member_id.to_string(), limit])?)
    }

    /// Sorted `member:period` keys over every recorded snapshot, used to
    /// derive the data revision a report was computed from.
    ///
    /// # Errors
    /// Returns an error when the query cannot be executed.
    pub fn snapshot_revision_keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT member_id, year, month FROM performance_snapshots
                 ORDER BY member_id ASC, year ASC, month ASC",
            )
            .context("failed to prepare snapshot key query")?;

        let rows = stmt
            .query_map([], |row| {
                let member_id: String = row.get(0)?;
                let year: i32 = row.get(1)?;
                let month: u8 = row.get(2)?;
                Ok(format!("{member_id}:{year:04}-{month:02}"))
            })
            .context("failed to query snapshot keys")?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row.context("failed to read snapshot key row")?);
        }
        Ok(keys)
    }

    /// Persist one generated network report as a JSON document.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn save_network_report(&mut self, report: &NetworkReport) -> Result<()> {
        let report_json =
            serde_json::to_string(report).context("failed to serialize network report")?;
        let generated_at =
            report.generated_at.format(&Rfc3339).context("failed to format generated_at")?;

        self.conn
            .execute(
                "INSERT OR REPLACE INTO network_reports(report_id, generated_at, report_json)
                 VALUES (?1, ?2, ?3)",
                params![report.report_id, generated_at, report_json],
            )
            .with_context(|| format!("failed to save network report {}", report.report_id))?;

        Ok(())
    }

    /// Fetch a previously persisted network report.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the stored document cannot
    /// be decoded.
    pub fn get_network_report(&self, report_id: &str) -> Result<Option<NetworkReport>> {
        let report_json: Option<String> = self
            .conn
            .query_row(
                "SELECT report_json FROM network_reports WHERE report_id = ?1",
                params![report_id],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("failed to look up network report {report_id}"))?;

        match report_json {
            Some(body) => Ok(Some(
                serde_json::from_str(&body)
                    .with_context(|| format!("failed to decode network report {report_id}"))?,
            )),
            None => Ok(None),
        }
    }

    /// Run quick-check and foreign-key verification over the database.
    ///
    /// # Errors
    /// Returns an error when the checks themselves cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run sqlite quick_check")?;
        let quick_check_ok = quick_check_message == "ok";

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare foreign_key_check")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ForeignKeyViolation {
                    table: row.get(0)?,
                    rowid: row.get(1)?,
                    parent: row.get(2)?,
                    fk_index: row.get(3)?,
                })
            })
            .context("failed to run foreign_key_check")?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row.context("failed to read foreign_key_check row")?);
        }

        let schema_status = self.schema_status()?;

        Ok(IntegrityReport {
            quick_check_ok,
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

impl NetworkStore for SqliteStore {
    fn member(&self, member_id: MemberId) -> Result<Option<Member>, RollupError> {
        let sql = format!("SELECT {MEMBER_COLUMNS} FROM members WHERE member_id = ?1");
        let mut members = members_query(&self.conn, &sql, params![member_id.to_string()])?;
        Ok(members.pop())
    }

    fn direct_recruits(&self, upline_id: MemberId) -> Result<Vec<Member>, RollupError> {
        let sql = format!(
            "SELECT {MEMBER_COLUMNS} FROM members WHERE upline_id = ?1 ORDER BY member_id ASC"
        );
        members_query(&self.conn, &sql, params![upline_id.to_string()])
    }

    fn latest_snapshot(
        &self,
        member_id: MemberId,
    ) -> Result<Option<PerformanceSnapshot>, RollupError> {
        let sql = format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM performance_snapshots
             WHERE member_id = ?1 ORDER BY year DESC, month DESC LIMIT 1"
        );
        let mut snapshots = snapshots_query(&self.conn, &sql, params![member_id.to_string()])?;
        Ok(snapshots.pop())
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let applied_at =
        OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format applied_at")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, applied_at],
    )
    .with_context(|| format!("failed to record schema version {version}"))?;
    Ok(())
}

fn query_err<E: std::fmt::Display>(err: E) -> RollupError {
    RollupError::Query(err.to_string())
}

fn members_query(
    conn: &Connection,
    sql: &str,
    query_params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<Member>, RollupError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let rows = stmt
        .query_map(query_params, |row| {
            Ok(MemberRow {
                member_id: row.get(0)?,
                name: row.get(1)?,
                title: row.get(2)?,
                avatar_uri: row.get(3)?,
                upline_id: row.get(4)?,
                joined_at: row.get(5)?,
            })
        })
        .map_err(query_err)?;

    let mut members = Vec::new();
    for row in rows {
        members.push(member_from_row(row.map_err(query_err)?)?);
    }
    Ok(members)
}

fn snapshots_query(
    conn: &Connection,
    sql: &str,
    query_params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<PerformanceSnapshot>, RollupError> {
    let mut stmt = conn.prepare(sql).map_err(query_err)?;
    let rows = stmt
        .query_map(query_params, |row| {
            Ok(SnapshotRow {
                member_id: row.get(0)?,
                year: row.get(1)?,
                month: row.get(2)?,
                monthly_volume_cents: row.get(3)?,
                monthly_loan_count: row.get(4)?,
                ytd_volume_cents: row.get(5)?,
                ytd_loan_count: row.get(6)?,
                compensation_cents: row.get(7)?,
                fund_contribution_cents: row.get(8)?,
                fund_balance_cents: row.get(9)?,
                recruitment_tier: row.get(10)?,
                active_recruit_count: row.get(11)?,
            })
        })
        .map_err(query_err)?;

    let mut snapshots = Vec::new();
    for row in rows {
        snapshots.push(snapshot_from_row(row.map_err(query_err)?)?);
    }
    Ok(snapshots)
}

fn parse_member_id(value: &str) -> Result<MemberId, RollupError> {
    MemberId::parse(value)
        .ok_or_else(|| RollupError::Query(format!("stored member id is not a ULID: {value}")))
}

fn member_from_row(row: MemberRow) -> Result<Member, RollupError> {
    let upline_id = match row.upline_id {
        Some(value) => Some(parse_member_id(&value)?),
        None => None,
    };
    let joined_at = OffsetDateTime::parse(&row.joined_at, &Rfc3339)
        .map_err(|err| RollupError::Query(format!("stored joined_at is invalid: {err}")))?;

    Ok(Member {
        member_id: parse_member_id(&row.member_id)?,
        name: row.name,
        title: row.title,
        avatar_uri: row.avatar_uri,
        upline_id,
        joined_at,
    })
}

fn snapshot_from_row(row: SnapshotRow) -> Result<PerformanceSnapshot, RollupError> {
    Ok(PerformanceSnapshot {
        member_id: parse_member_id(&row.member_id)?,
        year: row.year,
        month: row.month,
        monthly_volume_cents: row.monthly_volume_cents,
        monthly_loan_count: row.monthly_loan_count,
        ytd_volume_cents: row.ytd_volume_cents,
        ytd_loan_count: row.ytd_loan_count,
        compensation_cents: row.compensation_cents,
        fund_contribution_cents: row.fund_contribution_cents,
        fund_balance_cents: row.fund_balance_cents,
        recruitment_tier: row.recruitment_tier,
        active_recruit_count: row.active_recruit_count,
    })
}
