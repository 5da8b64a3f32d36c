use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RollupError {
    #[error("member not found: {0}")]
    NotFound(MemberId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query error: {0}")]
    Query(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MemberId(pub Ulid);

impl MemberId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Ulid::from_string(value).ok().map(Self)
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Member {
    pub member_id: MemberId,
    pub name: String,
    pub title: String,
    pub avatar_uri: Option<String>,
    pub upline_id: Option<MemberId>,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

impl Member {
    /// Validate a member row before it enters the network.
    ///
    /// # Errors
    /// Returns [`RollupError::Validation`] when the display name is blank or
    /// the member references itself as its own upline.
    pub fn validate(&self) -> Result<(), RollupError> {
        if self.name.trim().is_empty() {
            return Err(RollupError::Validation("name MUST be non-empty".to_string()));
        }

        if self.upline_id == Some(self.member_id) {
            return Err(RollupError::Validation(
                "member MUST NOT reference itself as its own upline".to_string(),
            ));
        }

        Ok(())
    }
}

/// One monthly performance fact row. Appended once per member per month by
/// an external process and immutable afterwards; the rollup only reads.
///
/// All currency fields are integer cents, so every downstream aggregate is
/// exact and reruns over unchanged data are bit-identical.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PerformanceSnapshot {
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

impl PerformanceSnapshot {
    /// The all-zero snapshot substituted for members with no fact row yet
    /// and for fetches that fail mid-batch. Never persisted.
    #[must_use]
    pub fn absent(member_id: MemberId) -> Self {
        Self {
            member_id,
            year: 0,
            month: 0,
            monthly_volume_cents: 0,
            monthly_loan_count: 0,
            ytd_volume_cents: 0,
            ytd_loan_count: 0,
            compensation_cents: 0,
            fund_contribution_cents: 0,
            fund_balance_cents: 0,
            recruitment_tier: 0,
            active_recruit_count: 0,
        }
    }

    #[must_use]
    pub fn period_label(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }

    /// Validate one monthly fact row against ingestion invariants.
    ///
    /// # Errors
    /// Returns [`RollupError::Validation`] when the period is malformed, any
    /// currency amount is negative, or a YTD field runs behind its monthly
    /// counterpart.
    pub fn validate(&self) -> Result<(), RollupError> {
        if !(1..=12).contains(&self.month) {
            return Err(RollupError::Validation("month MUST be in 1..=12".to_string()));
        }

        if !(2000..=2100).contains(&self.year) {
            return Err(RollupError::Validation(
                "year MUST be a plausible calendar year (2000..=2100)".to_string(),
            ));
        }

        for (field, amount_cents) in [
            ("monthly_volume_cents", self.monthly_volume_cents),
            ("ytd_volume_cents", self.ytd_volume_cents),
            ("compensation_cents", self.compensation_cents),
            ("fund_contribution_cents", self.fund_contribution_cents),
            ("fund_balance_cents", self.fund_balance_cents),
        ] {
            if amount_cents < 0 {
                return Err(RollupError::Validation(format!("{field} MUST be >= 0")));
            }
        }

        if self.ytd_volume_cents < self.monthly_volume_cents {
            return Err(RollupError::Validation(
                "ytd_volume_cents MUST be >= monthly_volume_cents".to_string(),
            ));
        }

        if self.ytd_loan_count < self.monthly_loan_count {
            return Err(RollupError::Validation(
                "ytd_loan_count MUST be >= monthly_loan_count".to_string(),
            ));
        }

        Ok(())
    }
}

pub const CONTRIBUTION_RATE_BASIS_POINTS: i64 = 10;
pub const BONUS_RATE_BASIS_POINTS: i64 = 200;
pub const PERSONAL_VOLUME_THRESHOLD_CENTS: i64 = 250_000_000;
pub const DEFAULT_MAX_DEPTH: u32 = 3;

const BASIS_POINT_SCALE: i64 = 10_000;
const YTD_EXTRAPOLATION_MONTHS: i64 = 8;
const PROJECTION_MONTHS: i64 = 12;

/// The 0.1% fund contribution computed from a member's monthly volume.
/// A policy constant applied at enrichment time, not a stored column.
#[must_use]
pub fn contribution_for_volume(monthly_volume_cents: i64) -> i64 {
    monthly_volume_cents * CONTRIBUTION_RATE_BASIS_POINTS / BASIS_POINT_SCALE
}

/// The flat 2% bonus tier applied once the personal-volume threshold is met.
#[must_use]
pub fn bonus_for_volume(monthly_volume_cents: i64) -> i64 {
    monthly_volume_cents * BONUS_RATE_BASIS_POINTS / BASIS_POINT_SCALE
}

/// Fixed-multiplier estimate from a single-month sample, not a sum of
/// recorded months.
#[must_use]
pub fn extrapolate_ytd(total_contribution_cents: i64) -> i64 {
    total_contribution_cents * YTD_EXTRAPOLATION_MONTHS
}

/// Fixed-multiplier annualization of a single-month sample.
#[must_use]
pub fn project_annual(total_contribution_cents: i64) -> i64 {
    total_contribution_cents * PROJECTION_MONTHS
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContributionRegime {
    Contributing,
    BonusTier,
}

impl ContributionRegime {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contributing => "contributing",
            Self::BonusTier => "bonus_tier",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contributing" => Some(Self::Contributing),
            "bonus_tier" => Some(Self::BonusTier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ThresholdOutcome {
    pub regime: ContributionRegime,
    pub outgoing_contribution_cents: i64,
    pub bonus_compensation_cents: i64,
}

impl ThresholdOutcome {
    #[must_use]
    pub fn reached(self) -> bool {
        self.regime == ContributionRegime::BonusTier
    }
}

/// Two-state compensation policy keyed solely on the member's own monthly
/// volume. Re-evaluated fresh on every call, no hysteresis: crossing back
/// below the threshold immediately reinstates the outgoing contribution.
///
/// Below the threshold the member still contributes 0.1% upward; at or
/// above it the outgoing contribution stops outright (a discrete cut, never
/// a taper) and the flat 2% bonus tier applies.
#[must_use]
pub fn evaluate_threshold(root_monthly_volume_cents: i64) -> ThresholdOutcome {
    if root_monthly_volume_cents >= PERSONAL_VOLUME_THRESHOLD_CENTS {
        ThresholdOutcome {
            regime: ContributionRegime::BonusTier,
            outgoing_contribution_cents: 0,
            bonus_compensation_cents: bonus_for_volume(root_monthly_volume_cents),
        }
    } else {
        ThresholdOutcome {
            regime: ContributionRegime::Contributing,
            outgoing_contribution_cents: contribution_for_volume(root_monthly_volume_cents),
            bonus_compensation_cents: 0,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PartialNode {
    pub member: Member,
    pub level: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NetworkNode {
    pub member: Member,
    pub level: u32,
    pub snapshot: PerformanceSnapshot,
    pub contribution_cents: i64,
}

/// Read-only data access the rollup pipeline depends on.
///
/// Implementations must return direct recruits in a stable order so that a
/// rerun over unchanged data resolves the same node sequence.
pub trait NetworkStore {
    /// Look up a member by id.
    ///
    /// # Errors
    /// Returns [`RollupError::Query`] when the lookup cannot be executed.
    fn member(&self, member_id: MemberId) -> Result<Option<Member>, RollupError>;

    /// All members whose upline reference equals `upline_id`.
    ///
    /// # Errors
    /// Returns [`RollupError::Query`] when the query cannot be executed.
    fn direct_recruits(&self, upline_id: MemberId) -> Result<Vec<Member>, RollupError>;

    /// The most recent monthly snapshot recorded for a member, if any.
    ///
    /// # Errors
    /// Returns [`RollupError::Query`] when the query cannot be executed.
    fn latest_snapshot(
        &self,
        member_id: MemberId,
    ) -> Result<Option<PerformanceSnapshot>, RollupError>;
}

/// Walk the recruiter relation from `root_id` down to `max_depth` levels.
///
/// Explicit worklist expansion, level 1 = direct recruit. Recruits beyond
/// `max_depth` are invisible to the rollup by design, not by data absence.
/// The relation is treated as externally-consistent tree data; termination
/// comes from the depth bound, not from cycle detection.
///
/// A root with zero recruits resolves to an empty list, which is a valid
/// network, not an error.
///
/// # Errors
/// Returns [`RollupError::NotFound`] when `root_id` does not reference an
/// existing member, [`RollupError::Validation`] when `max_depth` is zero,
/// and [`RollupError::Query`] when an edge fetch fails.
pub fn resolve_network<S: NetworkStore>(
    store: &S,
    root_id: MemberId,
    max_depth: u32,
) -> Result<Vec<PartialNode>, RollupError> {
    if max_depth == 0 {
        return Err(RollupError::Validation("max_depth MUST be >= 1".to_string()));
    }

    if store.member(root_id)?.is_none() {
        return Err(RollupError::NotFound(root_id));
    }

    let mut resolved: Vec<PartialNode> = Vec::new();
    let mut worklist: VecDeque<(MemberId, u32)> = VecDeque::new();
    worklist.push_back((root_id, 0));

    while let Some((upline_id, level)) = worklist.pop_front() {
        if level >= max_depth {
            continue;
        }

        for recruit in store.direct_recruits(upline_id)? {
            let child_level = level + 1;
            worklist.push_back((recruit.member_id, child_level));
            resolved.push(PartialNode { member: recruit, level: child_level });
        }
    }

    Ok(resolved)
}

/// Attach the latest performance snapshot and the computed fund
/// contribution to every resolved node.
///
/// Missing data and failed fetches both degrade to the all-zero snapshot;
/// one bad fetch never aborts the rest of the batch. The full batch is
/// settled before this returns, so aggregation never sees partial results.
#[must_use]
pub fn enrich<S: NetworkStore>(store: &S, partial_nodes: Vec<PartialNode>) -> Vec<NetworkNode> {
    partial_nodes
        .into_iter()
        .map(|node| {
            let snapshot = match store.latest_snapshot(node.member.member_id) {
                Ok(Some(snapshot)) => snapshot,
                Ok(None) | Err(_) => PerformanceSnapshot::absent(node.member.member_id),
            };
            let contribution_cents = contribution_for_volume(snapshot.monthly_volume_cents);
            NetworkNode { member: node.member, level: node.level, snapshot, contribution_cents }
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NetworkRollup {
    pub total_contribution_cents: i64,
    pub per_level_contribution_cents: BTreeMap<u32, i64>,
    pub per_level_member_count: BTreeMap<u32, usize>,
    pub member_count: usize,
    pub ytd_contribution_cents: i64,
    pub projected_annual_cents: i64,
}

/// Fold enriched nodes into per-level and whole-network totals.
///
/// Commutative over node order; the network total is the sum of the
/// per-level totals by construction.
#[must_use]
pub fn aggregate(nodes: &[NetworkNode]) -> NetworkRollup {
    let mut per_level_contribution_cents: BTreeMap<u32, i64> = BTreeMap::new();
    let mut per_level_member_count: BTreeMap<u32, usize> = BTreeMap::new();

    for node in nodes {
        *per_level_contribution_cents.entry(node.level).or_insert(0) += node.contribution_cents;
        *per_level_member_count.entry(node.level).or_insert(0) += 1;
    }

    let total_contribution_cents: i64 = per_level_contribution_cents.values().sum();

    NetworkRollup {
        total_contribution_cents,
        per_level_contribution_cents,
        per_level_member_count,
        member_count: nodes.len(),
        ytd_contribution_cents: extrapolate_ytd(total_contribution_cents),
        projected_annual_cents: project_annual(total_contribution_cents),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NetworkReport {
    pub report_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    pub root_member_id: MemberId,
    pub max_depth: u32,
    pub root_snapshot: PerformanceSnapshot,
    pub threshold: ThresholdOutcome,
    pub rollup: NetworkRollup,
    pub nodes: Vec<NetworkNode>,
}

fn make_report_id(generated_at: OffsetDateTime, report_seed: &str) -> Result<String, RollupError> {
    let stamp = generated_at
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| RollupError::Query(format!("invalid generated_at format: {err}")))?;
    Ok(format!("nrpt_{stamp}_{report_seed}"))
}

/// Run the full rollup pipeline for one root member: resolve the downline,
/// enrich every node, aggregate per level, and evaluate the threshold
/// policy against the root's own latest snapshot.
///
/// The acting root id is an explicit parameter; nothing here reads ambient
/// context. `report_seed` scopes the report id to the data revision it was
/// computed from, so identical input state reproduces the identical report.
///
/// # Errors
/// Returns [`RollupError::NotFound`] for an unknown root,
/// [`RollupError::Validation`] for a zero `max_depth` or blank seed, and
/// [`RollupError::Query`] when an edge fetch fails.
pub fn run_rollup<S: NetworkStore>(
    store: &S,
    root_id: MemberId,
    max_depth: u32,
    generated_at: OffsetDateTime,
    report_seed: &str,
) -> Result<NetworkReport, RollupError> {
    if report_seed.trim().is_empty() {
        return Err(RollupError::Validation(
            "report_seed MUST be provided for reproducible report ids".to_string(),
        ));
    }

    let partial_nodes = resolve_network(store, root_id, max_depth)?;
    let nodes = enrich(store, partial_nodes);
    let rollup = aggregate(&nodes);

    let root_snapshot = match store.latest_snapshot(root_id) {
        Ok(Some(snapshot)) => snapshot,
        Ok(None) | Err(_) => PerformanceSnapshot::absent(root_id),
    };
    let threshold = evaluate_threshold(root_snapshot.monthly_volume_cents);
    let report_id = make_report_id(generated_at, report_seed)?;

    Ok(NetworkReport {
        report_id,
        generated_at,
        root_member_id: root_id,
        max_depth,
        root_snapshot,
        threshold,
        rollup,
        nodes,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FundSummary {
    pub root_member_id: MemberId,
    pub regime: ContributionRegime,
    pub fund_balance_cents: i64,
    pub incoming_contribution_cents: i64,
    pub per_level_contribution_cents: BTreeMap<u32, i64>,
    pub outgoing_contribution_cents: i64,
    pub bonus_compensation_cents: i64,
    pub ytd_contribution_cents: i64,
    pub projected_annual_cents: i64,
}

/// Fund-workspace shape of a report: what flows in from the downline, what
/// flows out to the upline, and the current regime.
#[must_use]
pub fn fund_summary(report: &NetworkReport) -> FundSummary {
    FundSummary {
        root_member_id: report.root_member_id,
        regime: report.threshold.regime,
        fund_balance_cents: report.root_snapshot.fund_balance_cents,
        incoming_contribution_cents: report.rollup.total_contribution_cents,
        per_level_contribution_cents: report.rollup.per_level_contribution_cents.clone(),
        outgoing_contribution_cents: report.threshold.outgoing_contribution_cents,
        bonus_compensation_cents: report.threshold.bonus_compensation_cents,
        ytd_contribution_cents: report.rollup.ytd_contribution_cents,
        projected_annual_cents: report.rollup.projected_annual_cents,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LeaderboardRow {
    pub rank: usize,
    pub member_id: MemberId,
    pub name: String,
    pub level: u32,
    pub monthly_volume_cents: i64,
    pub monthly_loan_count: u32,
    pub contribution_cents: i64,
}

/// Downline members ranked by fund contribution, with deterministic
/// tie-breakers: monthly volume descending, then member id ascending.
#[must_use]
pub fn leaderboard_rows(report: &NetworkReport) -> Vec<LeaderboardRow> {
    let mut ranked: Vec<&NetworkNode> = report.nodes.iter().collect();
    ranked.sort_by(|lhs, rhs| {
        rhs.contribution_cents
            .cmp(&lhs.contribution_cents)
            .then_with(|| {
                rhs.snapshot.monthly_volume_cents.cmp(&lhs.snapshot.monthly_volume_cents)
            })
            .then_with(|| lhs.member.member_id.cmp(&rhs.member.member_id))
    });

    ranked
        .into_iter()
        .enumerate()
        .map(|(index, node)| LeaderboardRow {
            rank: index + 1,
            member_id: node.member.member_id,
            name: node.member.name.clone(),
            level: node.level,
            monthly_volume_cents: node.snapshot.monthly_volume_cents,
            monthly_loan_count: node.snapshot.monthly_loan_count,
            contribution_cents: node.contribution_cents,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TeamSummary {
    pub root_member_id: MemberId,
    pub network_size: usize,
    pub direct_recruit_count: usize,
    pub per_level_member_count: BTreeMap<u32, usize>,
    pub total_contribution_cents: i64,
}

/// Profile team-view shape of a report.
#[must_use]
pub fn team_summary(report: &NetworkReport) -> TeamSummary {
    TeamSummary {
        root_member_id: report.root_member_id,
        network_size: report.rollup.member_count,
        direct_recruit_count: report.rollup.per_level_member_count.get(&1).copied().unwrap_or(0),
        per_level_member_count: report.rollup.per_level_member_count.clone(),
        total_contribution_cents: report.rollup.total_contribution_cents,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SeriesPoint {
    pub label: String,
    pub value_cents: i64,
}

/// Chart-ready (label, value) points from a trailing window of monthly
/// snapshots, oldest first. Raw numeric values only; formatting belongs to
/// the presentation layer.
#[must_use]
pub fn volume_series(snapshots: &[PerformanceSnapshot]) -> Vec<SeriesPoint> {
    let mut ordered: Vec<&PerformanceSnapshot> = snapshots.iter().collect();
    ordered.sort_by_key(|snapshot| (snapshot.year, snapshot.month));
    ordered
        .into_iter()
        .map(|snapshot| SeriesPoint {
            label: snapshot.period_label(),
            value_cents: snapshot.monthly_volume_cents,
        })
        .collect()
}
