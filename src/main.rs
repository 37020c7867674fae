use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use massfit::{
    fit, nch_pt_windows, open_parquet, run_batch, FitOptions, Model, Observable, Workspace,
};

/// Fit the three-peak Upsilon mass model to a dimuon dataset and to a batch
/// of multiplicity/momentum sub-selections, collecting every fit into one
/// workspace file.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Parquet file with the dimuon candidates.
    data_file: String,
    /// Output path for the serialized workspace.
    #[arg(short, long, default_value = "ws_fit_result_Nch_pT_combi_cuts.bin")]
    output: String,
    /// Number of worker threads for likelihood evaluation (0 = all cores).
    #[arg(short = 'j', long, default_value_t = 0)]
    threads: usize,
    /// Maximum number of minimizer steps per fit.
    #[arg(long, default_value_t = 4000)]
    max_steps: usize,
    /// Print the minimizer's position and value at every step.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    let options = FitOptions {
        num_threads: if cli.threads == 0 {
            num_cpus::get()
        } else {
            cli.threads
        },
        max_steps: cli.max_steps,
        verbose: cli.verbose,
    };

    let full_data = open_parquet(&cli.data_file, "fitData")
        .with_context(|| format!("failed to load \"{}\"", cli.data_file))?;
    info!(n_events = full_data.len(), "loaded dataset");

    let mut workspace = Workspace::new("fitResults");
    workspace.import_dataset(full_data.clone())?;

    let mut model = Model::new(Observable::dimuon_mass());
    let full_result = fit(&mut model, &full_data, &options)?;
    println!("{} {}", full_result.status, full_result.cov_quality);
    workspace.import_fit_result("fitResult_fullData", full_result)?;
    workspace.save_snapshot(model.snapshot("snap_fullData"))?;

    let selections = nch_pt_windows()?;
    let results = run_batch(&mut workspace, &mut model, &full_data, &selections, &options)?;
    for (name, result) in &results {
        info!(
            selection = name.as_str(),
            status = result.status,
            cov_quality = result.cov_quality,
            fx = result.fx,
            "fit complete"
        );
    }

    workspace
        .write(&cli.output)
        .with_context(|| format!("failed to write \"{}\"", cli.output))?;
    info!(output = cli.output.as_str(), "workspace written");
    Ok(())
}
