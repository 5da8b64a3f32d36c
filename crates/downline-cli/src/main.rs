use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use downline_api::{AddMemberRequest, AddSnapshotRequest, DownlineApi, RollupRequest};
use downline_core::MemberId;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

#[derive(Debug, Parser)]
#[command(name = "dl")]
#[command(about = "Downline network rollup CLI")]
struct Cli {
    #[arg(long, default_value = "./downline.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Member {
        #[command(subcommand)]
        command: MemberCommand,
    },
    Snapshot {
        #[command(subcommand)]
        command: SnapshotCommand,
    },
    Network {
        #[command(subcommand)]
        command: NetworkCommand,
    },
    Report {
        #[command(subcommand)]
        command: ReportCommand,
    },
    Series(SeriesArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum MemberCommand {
    Add(MemberAddArgs),
}

#[derive(Debug, Args)]
struct MemberAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "Loan Officer")]
    title: String,
    #[arg(long)]
    avatar_uri: Option<String>,
    #[arg(long)]
    upline: Option<String>,
    #[arg(long)]
    joined_at: Option<String>,
}

#[derive(Debug, Subcommand)]
enum SnapshotCommand {
    Add(SnapshotAddArgs),
}

#[derive(Debug, Args)]
struct SnapshotAddArgs {
    #[arg(long)]
    member: String,
    #[arg(long)]
    year: i32,
    #[arg(long)]
    month: u8,
    #[arg(long)]
    monthly_volume_cents: i64,
    #[arg(long, default_value_t = 0)]
    monthly_loan_count: u32,
    /// Defaults to the monthly volume when the calendar year has just
    /// started or no running total is tracked yet.
    #[arg(long)]
    ytd_volume_cents: Option<i64>,
    #[arg(long)]
    ytd_loan_count: Option<u32>,
    #[arg(long, default_value_t = 0)]
    compensation_cents: i64,
    #[arg(long, default_value_t = 0)]
    fund_contribution_cents: i64,
    #[arg(long, default_value_t = 0)]
    fund_balance_cents: i64,
    #[arg(long, default_value_t = 0)]
    recruitment_tier: u8,
    #[arg(long, default_value_t = 0)]
    active_recruit_count: u32,
}

#[derive(Debug, Subcommand)]
enum NetworkCommand {
    Rollup(NetworkArgs),
    Fund(NetworkArgs),
    Leaderboard(NetworkArgs),
    Team(NetworkArgs),
    Threshold(ThresholdArgs),
}

#[derive(Debug, Args)]
struct NetworkArgs {
    #[arg(long)]
    root: String,
    #[arg(long)]
    max_depth: Option<u32>,
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Args)]
struct ThresholdArgs {
    #[arg(long)]
    member: String,
}

#[derive(Debug, Subcommand)]
enum ReportCommand {
    Show(ReportShowArgs),
}

#[derive(Debug, Args)]
struct ReportShowArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct SeriesArgs {
    #[arg(long)]
    member: String,
    #[arg(long, default_value_t = 12)]
    months: usize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = DownlineApi::new(cli.db);

    match cli.command {
        Command::Db { command } => match command {
            DbCommand::SchemaVersion => print_json(&api.schema_status()?),
            DbCommand::Migrate(args) => print_json(&api.migrate(args.dry_run)?),
            DbCommand::IntegrityCheck => print_json(&api.integrity_check()?),
        },
        Command::Member { command } => match command {
            MemberCommand::Add(args) => {
                let member = api.add_member(AddMemberRequest {
                    member_id: None,
                    name: args.name,
                    title: args.title,
                    avatar_uri: args.avatar_uri,
                    upline_id: args.upline.as_deref().map(parse_member_id).transpose()?,
                    joined_at: args.joined_at.as_deref().map(parse_timestamp).transpose()?,
                })?;
                print_json(&member)
            }
        },
        Command::Snapshot { command } => match command {
            SnapshotCommand::Add(args) => {
                let snapshot = api.add_snapshot(AddSnapshotRequest {
                    member_id: parse_member_id(&args.member)?,
                    year: args.year,
                    month: args.month,
                    monthly_volume_cents: args.monthly_volume_cents,
                    monthly_loan_count: args.monthly_loan_count,
                    ytd_volume_cents: args
                        .ytd_volume_cents
                        .unwrap_or(args.monthly_volume_cents),
                    ytd_loan_count: args.ytd_loan_count.unwrap_or(args.monthly_loan_count),
                    compensation_cents: args.compensation_cents,
                    fund_contribution_cents: args.fund_contribution_cents,
                    fund_balance_cents: args.fund_balance_cents,
                    recruitment_tier: args.recruitment_tier,
                    active_recruit_count: args.active_recruit_count,
                })?;
                print_json(&snapshot)
            }
        },
        Command::Network { command } => match command {
            NetworkCommand::Rollup(args) => print_json(&api.run_rollup(rollup_request(&args)?)?),
            NetworkCommand::Fund(args) => print_json(&api.fund_view(rollup_request(&args)?)?),
            NetworkCommand::Leaderboard(args) => {
                print_json(&api.leaderboard_view(rollup_request(&args)?)?)
            }
            NetworkCommand::Team(args) => print_json(&api.team_view(rollup_request(&args)?)?),
            NetworkCommand::Threshold(args) => {
                print_json(&api.threshold_check(parse_member_id(&args.member)?)?)
            }
        },
        Command::Report { command } => match command {
            ReportCommand::Show(args) => print_json(&api.report_show(&args.id)?),
        },
        Command::Series(args) => {
            print_json(&api.volume_series(parse_member_id(&args.member)?, args.months)?)
        }
    }
}

fn rollup_request(args: &NetworkArgs) -> Result<RollupRequest> {
    Ok(RollupRequest {
        root_member_id: parse_member_id(&args.root)?,
        max_depth: args.max_depth,
        as_of: args.as_of.as_deref().map(parse_timestamp).transpose()?,
    })
}

fn parse_member_id(value: &str) -> Result<MemberId> {
    MemberId::parse(value).ok_or_else(|| anyhow!("invalid member id: {value}"))
}

fn parse_timestamp(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map_err(|err| anyhow!("invalid RFC 3339 timestamp {value}: {err}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
