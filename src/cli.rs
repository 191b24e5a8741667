use crate::model::{
    ColumnMapping, Lane, OverallStatus, RunnerConfig, SimulationRequest, SimulationStatus,
};
use crate::orchestrator::Orchestrator;
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "optisim",
    version,
    about = "Run the GA and ACO optimizers side by side and report their combined result"
)]
pub struct Cli {
    /// Tabular input file handed to both workers
    pub input: PathBuf,

    /// Production budget
    #[arg(long = "bp")]
    pub production_budget: f64,

    /// Marketing budget
    #[arg(long = "bm")]
    pub marketing_budget: f64,

    /// Logistics budget
    #[arg(long = "bl")]
    pub logistics_budget: f64,

    /// Discount base, between 0.1 and 0.5 by default
    #[arg(long = "d-base")]
    pub discount_base: f64,

    /// Available shelf space
    #[arg(long = "s-max")]
    pub shelf_space: f64,

    /// Shelf space the input products need
    #[arg(long, default_value_t = 0.0)]
    pub required_shelf_space: f64,

    /// Chromosome bits for the genetic algorithm
    #[arg(long, default_value_t = 8)]
    pub chromosome_bits: u32,

    #[arg(long, default_value = "Product")]
    pub col_name: String,
    #[arg(long, default_value = "Price")]
    pub col_price: String,
    #[arg(long, default_value = "Production Cost")]
    pub col_cp: String,
    #[arg(long, default_value = "Marketing Cost")]
    pub col_cm: String,
    #[arg(long, default_value = "Logistics Cost")]
    pub col_cl: String,
    #[arg(long, default_value = "Shelf Space Cost")]
    pub col_shelf_cost: String,
    #[arg(long, default_value = "Age")]
    pub col_age: String,
    #[arg(long, default_value = "Stock")]
    pub col_stock: String,
    #[arg(long, default_value = "Shelf Space")]
    pub col_shelf: String,
    #[arg(long, default_value = "Demand")]
    pub col_demand: String,

    /// JSON configuration file (defaults to <config dir>/optisim/config.json when present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Path to the GA worker script
    #[arg(long)]
    pub ga_script: Option<PathBuf>,

    /// Path to the ACO worker script
    #[arg(long)]
    pub aco_script: Option<PathBuf>,

    /// Interpreter candidates, in priority order (repeatable)
    #[arg(long = "interpreter")]
    pub interpreters: Vec<String>,

    /// Number of worker processes allowed to run at once
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// How often to poll the simulation status
    #[arg(long, default_value = "500ms")]
    pub poll_interval: humantime::Duration,

    /// Print the final status as JSON
    #[arg(long)]
    pub json: bool,

    /// Print a text summary (default)
    #[arg(long)]
    pub text: bool,

    /// Suppress progress output
    #[arg(long)]
    pub silent: bool,
}

pub async fn run(args: Cli) -> Result<OverallStatus> {
    if args.json && args.text {
        return Err(anyhow::anyhow!("--json and --text are mutually exclusive"));
    }

    let cfg = load_config(&args)?;
    let orchestrator = Orchestrator::new(cfg);
    let (out_tx, out_handle) = spawn_output_writer();

    let id = orchestrator
        .submit(build_request(&args))
        .await
        .context("failed to submit simulation")?;
    tracing::info!(simulation_id = %id, "submitted");

    let mut poll = tokio::time::interval(Duration::from(args.poll_interval));
    let mut terminating = false;
    let mut last_line = String::new();

    let final_status = loop {
        // Only the first Ctrl-C terminates; later ones are ignored while we wait.
        let listening = !terminating;
        let ctrl_c = async move {
            if !listening {
                futures::future::pending::<std::io::Result<()>>().await
            } else {
                tokio::signal::ctrl_c().await
            }
        };
        tokio::select! {
            res = ctrl_c => {
                res.context("failed to listen for Ctrl-C")?;
                terminating = true;
                if orchestrator.terminate(&id) && !args.silent {
                    let _ = out_tx.send(OutputLine::Stderr("Terminating…".into()));
                }
            }
            _ = poll.tick() => {
                let status = orchestrator
                    .status(&id)
                    .context("simulation record disappeared")?;
                if !args.silent {
                    let line = progress_line(&status);
                    if line != last_line {
                        let _ = out_tx.send(OutputLine::Stderr(line.clone()));
                        last_line = line;
                    }
                }
                if status.is_terminal() {
                    break status;
                }
            }
        }
    };

    if args.json {
        let out = serde_json::to_string_pretty(&final_status)?;
        let _ = out_tx.send(OutputLine::Stdout(out));
    } else {
        let summary = crate::text_summary::build_text_summary(&final_status);
        for line in summary.lines {
            let _ = out_tx.send(OutputLine::Stdout(line));
        }
    }

    orchestrator.cleanup(&id);
    drop(out_tx);
    let _ = out_handle.await;
    Ok(final_status.overall_status)
}

fn progress_line(status: &SimulationStatus) -> String {
    let lanes: Vec<String> = Lane::ALL
        .iter()
        .map(|lane| {
            let s = status.lane(*lane);
            if s.finished {
                format!("{lane}: done{}", if s.has_error { " (error)" } else { "" })
            } else {
                format!(
                    "{lane}: {:.1}% (eta {:.0}s)",
                    s.progress_percent, s.eta_seconds
                )
            }
        })
        .collect();
    format!("[{}] {}", status.overall_status, lanes.join(" | "))
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("optisim").join("config.json"))
}

fn read_config(path: &Path) -> Result<RunnerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid config {}", path.display()))
}

/// Resolve configuration: explicit file, then the default location, then
/// built-in defaults. CLI flags override whatever was loaded.
pub fn load_config(args: &Cli) -> Result<RunnerConfig> {
    let mut cfg = match args.config.as_deref() {
        Some(path) => read_config(path)?,
        None => match default_config_path().filter(|p| p.is_file()) {
            Some(path) => read_config(&path)?,
            None => RunnerConfig::default(),
        },
    };
    if let Some(p) = args.ga_script.clone() {
        cfg.ga_script = p;
    }
    if let Some(p) = args.aco_script.clone() {
        cfg.aco_script = p;
    }
    if !args.interpreters.is_empty() {
        cfg.interpreters = args.interpreters.clone();
    }
    if let Some(n) = args.pool_size {
        cfg.pool_size = n;
    }
    Ok(cfg)
}

/// Build a `SimulationRequest` from CLI arguments.
pub fn build_request(args: &Cli) -> SimulationRequest {
    SimulationRequest {
        input_path: args.input.clone(),
        production_budget: args.production_budget,
        marketing_budget: args.marketing_budget,
        logistics_budget: args.logistics_budget,
        discount_base: args.discount_base,
        shelf_space_limit: args.shelf_space,
        required_shelf_space: args.required_shelf_space,
        chromosome_bits: args.chromosome_bits,
        columns: ColumnMapping {
            name: args.col_name.clone(),
            price: args.col_price.clone(),
            production_cost: args.col_cp.clone(),
            marketing_cost: args.col_cm.clone(),
            logistics_cost: args.col_cl.clone(),
            shelf_cost: args.col_shelf_cost.clone(),
            age: args.col_age.clone(),
            stock: args.col_stock.clone(),
            shelf: args.col_shelf.clone(),
            demand: args.col_demand.clone(),
        },
    }
}
