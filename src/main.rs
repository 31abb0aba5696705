use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ct_prep::{
    batch::Batch,
    cancel,
    config::Config,
    enums::ScanType,
    ledger::Ledger,
    postprocess::{self, CleanOutcome},
    runner::ProcessRunner,
};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "ct-prep")]
#[command(version, about = "Convert, register and skull-strip DICOM head CT studies", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process every patient not yet in the ledger
    Run {
        /// Directory with one subdirectory per patient
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Root of the NCCT/ and CTA/ output trees
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Ledger CSV file
        #[arg(short, long)]
        report: Option<PathBuf>,
    },
    /// Remove residual skull from CTA volumes using the patient's NCCT
    CleanCta {
        /// Patient ids to clean
        #[arg(required = true)]
        patients: Vec<String>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Clamp the intensities of every volume of one scan type
    Window {
        #[arg(value_enum)]
        scan_type: ScanTypeArg,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ScanTypeArg {
    Ncct,
    Cta,
}

impl From<ScanTypeArg> for ScanType {
    fn from(arg: ScanTypeArg) -> Self {
        match arg {
            ScanTypeArg::Ncct => ScanType::Ncct,
            ScanTypeArg::Cta => ScanType::Cta,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Commands::Run {
            input,
            output,
            report,
        } => {
            if let Some(input) = input {
                config.input = input;
            }
            if let Some(output) = output {
                config.output = output;
            }
            if let Some(report) = report {
                config.report = report;
            }
            run(&config).await
        }
        Commands::CleanCta { patients, output } => {
            if let Some(output) = output {
                config.output = output;
            }
            for patient in &patients {
                info!("PATIENT {}", patient);
                match postprocess::clean_cta(&config, patient)? {
                    CleanOutcome::Cleaned { output, .. } => println!("{patient}: {}", output.display()),
                    CleanOutcome::Skipped(reason) => println!("{patient}: skipped, {reason}"),
                }
            }
            Ok(())
        }
        Commands::Window { scan_type, output } => {
            if let Some(output) = output {
                config.output = output;
            }
            let scan_type = ScanType::from(scan_type);
            let window = config.window.for_type(scan_type);
            println!(" ======================= {scan_type} =========================");
            let count = postprocess::window_directory(&config.type_dir(scan_type), window)?;
            println!("{count} volumes clamped to [{}, {}]", window.min, window.max);
            Ok(())
        }
    }
}

async fn run(config: &Config) -> Result<()> {
    println!(" -== PRESS ENTER TO STOP THIS PROGRAM ==- ");
    println!("It will stop as soon as it finishes the patient it is currently processing.");
    println!("The run can be resumed at any time by calling this program again.\n");

    let cancel = CancellationToken::new();
    cancel::watch_stdin(cancel.clone()).context("starting the key capture thread")?;

    config.init_dirs().context("creating output directories")?;
    let ledger = Ledger::open(&config.report)?;
    let runner = ProcessRunner::new(config.tools.timeout());
    let mut batch = Batch::new(config, &runner, ledger)?;

    let summary = batch.run(&cancel).await?;
    info!(
        "{} patients processed ({} without DICOM, {} with an invalid layout), {} skipped{}",
        summary.processed,
        summary.missing,
        summary.invalid_layout,
        summary.skipped,
        if summary.cancelled { ", stopped on request" } else { "" }
    );
    Ok(())
}
