#![warn(clippy::unwrap_used, clippy::pedantic)]
#![allow(
    clippy::cast_lossless,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]
use std::{path::PathBuf, time::Duration};

use clap::Parser;
use color_eyre::eyre::{self, bail};
use itertools::Itertools;
use kerbdv::{
    config::Config,
    ffs::StageResult,
    scheduler::{RunStatus, SimulationScheduler, StartOutcome},
    vessel::Vessel,
};
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Predict per-stage delta-v, burn time and TWR for a staged vessel"
)]
struct Cli {
    /// Vessel part list (RON)
    vessel: PathBuf,

    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Atmospheric pressure to evaluate engines at, in atmospheres
    #[arg(long)]
    atm_pressure: Option<f64>,

    /// Gravity used for thrust-to-weight, m/s^2
    #[arg(long)]
    gravity: Option<f64>,

    /// Sum thrust vectors instead of magnitudes
    #[arg(long)]
    cosine_losses: bool,

    /// Log every drain step
    #[arg(long, short)]
    verbose: bool,

    /// Print the stages as RON instead of a table
    #[arg(long)]
    ron: bool,
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("kerbdv=debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(p) = cli.atm_pressure {
        config.simulation.atm_pressure = p;
    }
    if let Some(g) = cli.gravity {
        config.simulation.gravity = g;
    }
    config.simulation.cosine_losses |= cli.cosine_losses;
    config.simulation.verbose |= cli.verbose;

    let vessel = Vessel::load(&cli.vessel)?;
    info!(vessel = %vessel.name, parts = vessel.parts.len(), "loaded vessel");

    let table = config.resource_table();
    let mut scheduler =
        SimulationScheduler::new(config.scheduler.clone(), table, config.simulation.clone());
    scheduler.request_resimulation();

    loop {
        match scheduler.try_start(&vessel) {
            StartOutcome::Started { generation } => debug!(generation, "started"),
            StartOutcome::Throttled { remaining } => std::thread::sleep(remaining),
            StartOutcome::Busy | StartOutcome::Idle | StartOutcome::SnapshotFailed => {}
        }
        if !scheduler.is_pending() && !scheduler.is_in_flight() {
            break;
        }
        scheduler.wait(Duration::from_secs(60));
    }

    let results = scheduler.results();
    match &results.status {
        RunStatus::Ready => {}
        RunStatus::Failed(e) => {
            error!("simulation failed: {e}");
            bail!("simulation failed: {e}");
        }
        RunStatus::NotRun => bail!("simulation did not run"),
    }
    info!(run_time = ?results.run_time, stages = results.stages.len(), "simulation finished");

    if cli.ron {
        let pretty = ron::ser::PrettyConfig::default();
        println!("{}", ron::ser::to_string_pretty(&results.stages, pretty)?);
    } else {
        print_table(&results.stages);
    }
    Ok(())
}

const HEADER: [&str; 10] = [
    "Stage", "Mass", "Start", "End", "Thrust", "ISp", "TWR", "Max TWR", "dV", "Time",
];

fn print_table(stages: &[StageResult]) {
    println!("{}", HEADER.iter().map(|x| format!("{x:>9}")).join(" "));
    for stage in stages.iter().rev() {
        let row = [
            stage.stage_number.to_string(),
            format!("{:.3}", stage.mass),
            format!("{:.3}", stage.start_mass),
            format!("{:.3}", stage.end_mass),
            format!("{:.1}", stage.thrust),
            format!("{:.1}", stage.isp),
            format!("{:.2}", stage.thrust_to_weight),
            format!("{:.2}", stage.max_thrust_to_weight),
            format!("{:.1}", stage.delta_v),
            format!("{:.1}", stage.burn_time),
        ];
        let capped = if stage.drain_capped { " *" } else { "" };
        println!("{}{capped}", row.iter().map(|x| format!("{x:>9}")).join(" "));
    }
    if let Some(top) = stages.last() {
        println!(
            "total: {:.1} m/s over {:.1} s, {:.3} t, {:.0} funds",
            top.total_delta_v, top.total_burn_time, top.total_mass, top.total_cost
        );
    }
}
