use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cutoff_core::RankRecord;
use cutoff_match::lookup::{self, SEARCH_LIMIT};
use cutoff_match::{match_ranks, BranchPresets, MatchRequest, PageCursor, DEFAULT_DEVIATION, DEVIATION_CHOICES};
use cutoff_store::{PocketbaseClient, RankStore, StoreConfig};
use cutoff_sync::{parse_target, run_ingest_from_env, IngestConfig, IngestRequest, UploadSource};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "cutoff")]
#[command(about = "Admission cutoff ingestion and rank matching")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Back up the store, then ingest one CSV upload for a year and round.
    Ingest(IngestArgs),
    /// List colleges whose closing rank is near the given rank.
    Match(MatchArgs),
    /// List colleges ten per page, search them, or show one by id.
    Colleges(CollegesArgs),
    /// Show one cutoff entry.
    Cutoff {
        /// College id, or its full name.
        #[arg(long)]
        college: String,
        /// Branch code.
        #[arg(long)]
        branch: String,
        #[arg(long)]
        year: String,
        #[arg(long)]
        round: String,
        #[arg(long)]
        ciwg: bool,
    },
    Presets,
}

#[derive(Debug, Args)]
struct IngestArgs {
    #[arg(long, required_unless_present = "url", conflicts_with = "url")]
    file: Option<PathBuf>,
    /// Attachment URL to download the upload from.
    #[arg(long)]
    url: Option<String>,
    #[arg(long)]
    year: String,
    #[arg(long)]
    round: String,
    /// Name recorded in the backup file name.
    #[arg(long, env = "USER", default_value = "cli")]
    actor: String,
    /// Print the full run summary as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct CollegesArgs {
    #[arg(long, conflicts_with_all = ["alias", "id"])]
    search: Option<String>,
    #[arg(long, conflicts_with = "id")]
    alias: Option<String>,
    /// Show the name and alias of one college.
    #[arg(long)]
    id: Option<String>,
    /// 1-based page of the full listing.
    #[arg(long, default_value_t = 1)]
    page: usize,
}

#[derive(Debug, Args)]
struct MatchArgs {
    /// Rank as typed, separators allowed (e.g. 1,00,000).
    #[arg(long, required_unless_present = "cursor")]
    rank: Option<String>,
    /// Preset label or `Label: kw1, kw2` specification.
    #[arg(long, required_unless_present = "cursor")]
    branch: Option<String>,
    #[arg(long)]
    ciwg: bool,
    #[arg(long, default_value_t = DEFAULT_DEVIATION)]
    deviation: u32,
    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    page: usize,
    /// Page cursor printed by an earlier `match`; overrides the other options.
    #[arg(long)]
    cursor: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest(args) => ingest(args).await?,
        Commands::Match(args) => run_match(args).await?,
        Commands::Colleges(args) => colleges(args).await?,
        Commands::Cutoff {
            college,
            branch,
            year,
            round,
            ciwg,
        } => cutoff(&college, &branch, &year, &round, ciwg).await?,
        Commands::Presets => {
            for preset in load_presets()?.presets {
                println!("{}", preset.spec());
            }
        }
    }

    Ok(())
}

async fn connect() -> Result<PocketbaseClient> {
    let config = StoreConfig::from_env();
    PocketbaseClient::connect(&config)
        .await
        .with_context(|| format!("connecting to store at {}", config.base_url))
}

fn load_presets() -> Result<BranchPresets> {
    let path = std::env::var("CUTOFF_BRANCH_PRESETS").unwrap_or_else(|_| "branch_presets.yaml".to_string());
    BranchPresets::load_or_default(&PathBuf::from(path))
}

async fn ingest(args: IngestArgs) -> Result<()> {
    let target = parse_target(&args.year, &args.round)?;
    let upload = match (args.file, args.url) {
        (Some(path), _) => UploadSource::Path(path),
        (None, Some(url)) => UploadSource::Url(url),
        (None, None) => anyhow::bail!("either --file or --url is required"),
    };

    let summary = run_ingest_from_env(IngestRequest {
        actor: args.actor,
        target,
        upload,
    })
    .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let limit = IngestConfig::from_env().error_report_limit;
    println!(
        "ingest complete: run_id={} year={} round={} parsed={} created={} skipped={} branches_created={} backup={}",
        summary.run_id,
        target.year,
        target.round,
        summary.parsed_rows,
        summary.upsert.created,
        summary.upsert.skipped,
        summary.created_branches.len(),
        summary.backup.created,
    );
    if !summary.row_errors.is_empty() {
        println!("\nRows not ingested:\n{}", summary.row_error_report(limit));
    }
    if !summary.upsert.is_success() {
        println!("\nRows not saved:\n{}", summary.upsert_failure_report(limit));
    }
    if !summary.is_success() {
        anyhow::bail!(
            "{} row errors and {} persistence failures",
            summary.row_errors.len(),
            summary.upsert.failures.len()
        );
    }
    Ok(())
}

async fn run_match(args: MatchArgs) -> Result<()> {
    let cursor = match args.cursor {
        Some(raw) => raw.parse::<PageCursor>()?,
        None => {
            let rank = lookup::parse_rank_text(args.rank.as_deref().unwrap_or_default())?;
            let spec = load_presets()?.resolve_spec(args.branch.as_deref().unwrap_or_default());
            if !DEVIATION_CHOICES.contains(&args.deviation) {
                warn!(deviation = args.deviation, choices = ?DEVIATION_CHOICES, "unusual deviation");
            }
            PageCursor::first(&MatchRequest::new(rank, spec, args.ciwg).with_deviation(args.deviation))
                .with_page(args.page.saturating_sub(1))
        }
    };

    let ranks = connect().await?.list_ranks().await.context("loading ranks")?;
    let pages = match_ranks(&ranks, &cursor.request())?;
    let Some(page) = pages.page(cursor.page) else {
        anyhow::bail!("page {} out of range (1-{})", cursor.page + 1, pages.page_count());
    };

    println!(
        "{} round {} | closing rank >= {} | page {}/{} ({} matches)",
        pages.year,
        pages.round,
        pages.lower_bound,
        cursor.page + 1,
        pages.page_count(),
        pages.total()
    );
    for record in page {
        print_rank(record);
    }
    if let Some(prev) = cursor.prev() {
        println!("prev: {}", prev.encode());
    }
    if let Some(next) = cursor.next(pages.page_count()) {
        println!("next: {}", next.encode());
    }
    Ok(())
}

fn print_rank(record: &RankRecord) {
    println!(
        "{:>8} {:>8}  {} [{}] {} ({})",
        record.primary.open,
        record.primary.close,
        record.college.name,
        record.college.id,
        record.branch.name,
        record.branch.code
    );
}

async fn colleges(args: CollegesArgs) -> Result<()> {
    let colleges = connect().await?.list_colleges().await.context("loading colleges")?;
    if let Some(id) = args.id {
        let college = lookup::find_college(&colleges, &id)?;
        println!("{}", lookup::college_detail(college));
        return Ok(());
    }
    if let Some(alias) = args.alias {
        for college in lookup::colleges_by_alias(&colleges, &alias) {
            println!("{}\t{}", college.id, college.name);
        }
        return Ok(());
    }
    if let Some(search) = args.search {
        for hit in lookup::search_colleges(&colleges, &search, SEARCH_LIMIT) {
            println!("{}\t{}", hit.id, hit.name);
        }
        return Ok(());
    }

    let page = lookup::college_page(&colleges, args.page.saturating_sub(1));
    for college in page.colleges {
        println!("{}\t{}", college.id, college.name);
    }
    println!("{}", page.label());
    if let Some(prev) = page.prev() {
        println!("prev: --page {}", prev + 1);
    }
    if let Some(next) = page.next() {
        println!("next: --page {}", next + 1);
    }
    Ok(())
}

async fn cutoff(college: &str, branch: &str, year: &str, round: &str, ciwg: bool) -> Result<()> {
    let target = parse_target(year, round)?;
    let client = connect().await?;
    let (colleges, ranks) = tokio::try_join!(client.list_colleges(), client.list_ranks())
        .context("loading colleges and ranks")?;

    let college = lookup::find_college(&colleges, college)?;
    match lookup::cutoff_for(&ranks, &college.id, branch, ciwg, target.year, target.round) {
        Ok(record) => {
            println!("{} ({})", record.college.name, record.branch.name);
            println!("Branch Code: {}\nRound {} ({})", record.branch.code, record.round, record.year);
            println!("JEE opening/closing: {} / {}", record.primary.open, record.primary.close);
            if !record.secondary.is_zero() {
                println!("DASA opening/closing: {} / {}", record.secondary.open, record.secondary.close);
            }
            Ok(())
        }
        Err(err) => {
            let codes: Vec<&str> =
                lookup::branches_for_college(&ranks, &college.id, ciwg, target.year, target.round)
                    .into_iter()
                    .map(|b| b.code.as_str())
                    .collect();
            let years = lookup::available_years(&ranks);
            Err(anyhow::Error::new(err).context(format!(
                "branches for this college and round: [{}]; years with data: {:?}",
                codes.join(", "),
                years
            )))
        }
    }
}
