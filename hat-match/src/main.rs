//! hat-match - headless driver for hemilineage matching
//!
//! Subcommands map onto proofreading session operations:
//! `connect`, `search`, `threshold`, `match`, `review`, `results`.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use hat_common::Point3;
use hat_match::display::DisplayKind;
use hat_match::ledger::{HistoryView, LedgerFilter, RowKey};
use hat_match::session::ThresholdSummary;
use hat_match::threshold;
use hat_match::volume::ledger_path_for;
use hat_match::{
    MatchConfig, ProofreadingSession, QueryImage, ResultRow, ResultsLedger, ReviewStatus, ScoringMethods,
    SessionEvent,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "hat-match")]
#[command(about = "Match picked cell-body clusters to atlas hemilineages")]
#[command(version)]
struct Cli {
    /// Config file (default: HAT_MATCH_CONFIG or the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Atlas database (default: HAT_ATLAS_PATH or the config file)
    #[arg(short, long, global = true)]
    atlas: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect to the atlas, check it and remember its path
    Connect,

    /// List candidate hemilineages for a centroid
    Search {
        /// Query centroid "(z, y, x)" in microns
        centroid: Point3,
    },

    /// Threshold an image and report the foreground size
    Threshold {
        image: PathBuf,
        /// Manual threshold instead of Otsu
        #[arg(long)]
        value: Option<f64>,
    },

    /// Score candidates for a point selection and record the results
    Match(MatchArgs),

    /// Set the review status of a result row
    Review {
        #[command(flatten)]
        table: TableArgs,
        #[arg(long)]
        hemilineage: String,
        /// Query centroid of the row
        #[arg(long)]
        centroid: Point3,
        /// not_reviewed, accept, unsure or reject
        #[arg(long)]
        status: ReviewStatus,
    },

    /// Show recorded results
    Results {
        #[command(flatten)]
        table: TableArgs,
        /// Include superseded rows
        #[arg(long)]
        all: bool,
        #[arg(long)]
        status: Option<ReviewStatus>,
        #[arg(long)]
        centroid: Option<Point3>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct TableArgs {
    /// Query image whose results table to use
    #[arg(long, required_unless_present = "ledger")]
    image: Option<PathBuf>,
    /// Results table path
    #[arg(long)]
    ledger: Option<PathBuf>,
}

impl TableArgs {
    fn path(&self) -> Result<PathBuf> {
        match (&self.ledger, &self.image) {
            (Some(ledger), _) => Ok(ledger.clone()),
            (None, Some(image)) => Ok(ledger_path_for(image)),
            (None, None) => bail!("either --image or --ledger is required"),
        }
    }
}

#[derive(Args, Debug)]
struct MatchArgs {
    image: PathBuf,
    /// Clicked points "z,y,x; z,y,x; ..." in microns
    #[arg(long, conflicts_with = "centroid")]
    points: Option<String>,
    /// Which points to use: "1,2,3", "1-5" or "All"
    #[arg(long, default_value = "All")]
    select: String,
    /// Query centroid "(z, y, x)" instead of points
    #[arg(long)]
    centroid: Option<Point3>,
    /// Manual threshold instead of Otsu
    #[arg(long)]
    threshold: Option<f64>,
    #[arg(long, value_enum, default_value_t = MethodArg::Both)]
    methods: MethodArg,
    /// Extra hemilineages to score
    #[arg(long = "add")]
    add: Vec<String>,
    /// Candidates to leave out
    #[arg(long = "remove")]
    remove: Vec<String>,
    /// Results table path (default: next to the image)
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// Accept these hemilineages after scoring
    #[arg(long = "accept")]
    accept: Vec<String>,
    /// Print candidate tract sizes for the viewer
    #[arg(long)]
    show_artifacts: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    Voxel,
    Nblast,
    Both,
}

impl From<MethodArg> for ScoringMethods {
    fn from(arg: MethodArg) -> Self {
        match arg {
            MethodArg::Voxel => ScoringMethods::voxel_only(),
            MethodArg::Nblast => ScoringMethods::nblast_only(),
            MethodArg::Both => ScoringMethods::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = MatchConfig::locator()
        .locate(cli.config.as_deref())
        .context("Failed to locate config file")?;
    let mut config = MatchConfig::load(&config_path).context("Failed to load config")?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting hat-match v{} (config {})",
        env!("CARGO_PKG_VERSION"),
        config_path.display()
    );

    match &cli.command {
        Command::Connect => {
            let session = connect(&cli, &mut config, &config_path).await?;
            let report = session.validate_atlas().await.context("Atlas validation failed")?;
            println!(
                "Connected: {} hemilineages, {} search zones",
                report.hemilineages,
                session.candidate_search().map(|s| s.zones().len()).unwrap_or(0)
            );
            for name in &report.missing_tracts {
                println!("  missing tract mask: {}", name);
            }
            for name in &report.missing_skeletons {
                println!("  missing skeleton: {}", name);
            }
            if let Some(expected) = report.expected.filter(|&n| n != report.hemilineages) {
                println!("  expected {} hemilineages", expected);
            }
            if !report.is_valid() {
                bail!("atlas is incomplete");
            }
        }

        Command::Search { centroid } => {
            let session = connect(&cli, &mut config, &config_path).await?;
            let search = session
                .candidate_search()
                .ok_or_else(|| anyhow!("candidate search unavailable"))?;
            let candidates = search.find_candidates(centroid)?;
            if candidates.is_empty() {
                println!("No candidate hemilineages for {}", centroid);
            }
            for c in candidates {
                println!(
                    "{:<16} distance {:>8.2} um  radius {:>8.2} um{}",
                    c.hemilineage,
                    c.distance,
                    c.radius,
                    if c.mirrored { "  (mirrored)" } else { "" }
                );
            }
        }

        Command::Threshold { image, value } => {
            let image = QueryImage::from_nrrd(image).context("Failed to read image")?;
            let (threshold, automatic) = match value {
                Some(v) => {
                    threshold::validate_manual(&image, *v)?;
                    (*v, false)
                }
                None => (threshold::compute_threshold(&image)?, true),
            };
            let mask = threshold::apply(&image, threshold);
            print_threshold(&ThresholdSummary {
                threshold,
                foreground_voxels: mask.count(),
                automatic,
            });
        }

        Command::Match(args) => run_match(&cli, args, &mut config, &config_path).await?,

        Command::Review {
            table,
            hemilineage,
            centroid,
            status,
        } => {
            let mut ledger = ResultsLedger::load_or_create(table.path()?)?;
            ledger.set_status(&RowKey::new(hemilineage.clone(), *centroid), *status)?;
            ledger.save()?;
            println!("{} at {} set to {}", hemilineage, centroid, status);
        }

        Command::Results {
            table,
            all,
            status,
            centroid,
            json,
        } => {
            let ledger = ResultsLedger::load_or_create(table.path()?)?;
            let filter = LedgerFilter {
                view: if *all { HistoryView::All } else { HistoryView::Latest },
                centroid: *centroid,
                hemilineages: None,
                status: *status,
            };
            let rows: Vec<&ResultRow> = ledger.query(&filter);
            if *json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_rows(rows.into_iter());
            }
        }
    }

    Ok(())
}

async fn connect(cli: &Cli, config: &mut MatchConfig, config_path: &Path) -> Result<ProofreadingSession> {
    let atlas = config
        .resolve_atlas_path(cli.atlas.as_deref())
        .ok_or_else(|| anyhow!("no atlas configured, pass --atlas or set HAT_ATLAS_PATH"))?;
    let mut session = ProofreadingSession::new(config.session_config());
    session
        .connect(&atlas)
        .await
        .with_context(|| format!("Failed to connect to atlas {}", atlas.display()))?;
    if let Err(e) = config.remember_atlas_path(&atlas, config_path) {
        warn!(error = %e, "Could not save atlas path to config");
    }
    Ok(session)
}

fn run_threshold(session: &mut ProofreadingSession, value: Option<f64>) -> Result<ThresholdSummary> {
    let summary = match value {
        Some(v) => session.apply_threshold(v)?,
        None => session.auto_threshold()?,
    };
    Ok(summary)
}

fn print_threshold(summary: &ThresholdSummary) {
    println!(
        "Threshold {} ({}), {} foreground voxels",
        summary.threshold,
        if summary.automatic { "Otsu" } else { "manual" },
        summary.foreground_voxels
    );
}

fn parse_points(text: &str) -> Result<Vec<Point3>> {
    text.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<Point3>().with_context(|| format!("Invalid point '{}'", s)))
        .collect()
}

async fn run_match(cli: &Cli, args: &MatchArgs, config: &mut MatchConfig, config_path: &Path) -> Result<()> {
    let image = QueryImage::from_nrrd(&args.image).context("Failed to read image")?;
    let mut session = connect(cli, config, config_path).await?;
    session.load_image(image)?;
    print_threshold(&run_threshold(&mut session, args.threshold)?);

    match &args.ledger {
        Some(path) => session.open_ledger_at(path.clone())?,
        None => session.open_ledger()?,
    }

    let cycle = match (&args.points, args.centroid) {
        (Some(points), _) => session.select_points(&parse_points(points)?, &args.select)?,
        (None, Some(centroid)) => session.select_centroid(centroid)?,
        (None, None) => bail!("either --points or --centroid is required"),
    };
    println!("Query centroid {}", cycle.centroid);
    for c in &cycle.candidates {
        println!("  candidate {:<16} distance {:.2} um", c.hemilineage, c.distance);
    }
    for name in &args.add {
        session.add_target(name)?;
    }
    for name in &args.remove {
        session.remove_target(name)?;
    }

    if args.show_artifacts {
        let targets = session.cycle().map(|c| c.targets.clone()).unwrap_or_default();
        for artifact in session.candidate_artifacts(&targets, DisplayKind::Tract).await? {
            println!("  {} tract: {} voxels", artifact.hemilineage, artifact.data.len());
        }
    }

    let mut events = session.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::CandidateScored {
                    hemilineage, progress, ..
                } => println!(
                    "[{}/{}] {} scored",
                    progress.completed, progress.total, hemilineage
                ),
                SessionEvent::CandidateFailed {
                    hemilineage,
                    message,
                    progress,
                    ..
                } => println!(
                    "[{}/{}] {} failed: {}",
                    progress.completed, progress.total, hemilineage, message
                ),
                SessionEvent::CandidateSkipped { hemilineage, .. } => {
                    println!("{} already scored, skipped", hemilineage)
                }
                SessionEvent::ScoringCompleted { .. } | SessionEvent::ScoringCancelled { .. } => break,
                _ => {}
            }
        }
    });

    let job = session.start_scoring(args.methods.into())?;
    let cancel = job.cancel_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling scoring");
            cancel.cancel();
        }
    });

    let report = session.complete_scoring(job).await.context("Failed to record scores")?;
    ctrl_c.abort();
    let _ = printer.await;

    if report.cancelled {
        println!(
            "Cancelled: {} scored, {} not scored",
            report.scores.len(),
            report.not_scored.len()
        );
    }
    for name in &args.accept {
        session.set_status(name, ReviewStatus::Accept)?;
    }
    print_rows(session.current_results()?.iter());
    session.finish_review()?;
    Ok(())
}

fn print_rows<'a>(rows: impl Iterator<Item = &'a ResultRow>) {
    println!(
        "{:<16} {:<28} {:>8} {:>8} {:<13} {:>9}",
        "Hemilineage", "query_centroid", "voxel", "NBLAST", "status", "threshold"
    );
    let fmt = |v: Option<f64>| v.map(|v| format!("{:.3}", v)).unwrap_or_else(|| "-".to_string());
    for row in rows {
        println!(
            "{:<16} {:<28} {:>8} {:>8} {:<13} {:>9}{}",
            row.hemilineage,
            row.query_centroid.to_string(),
            fmt(row.voxel_score),
            fmt(row.nblast_score),
            row.status.as_str(),
            fmt(row.threshold),
            row.error.as_deref().map(|e| format!("  error: {}", e)).unwrap_or_default()
        );
    }
}
