use anyhow::{bail, Context, Result};
use std::env;
use std::path::Path;

use bank_aggregates::{
    run_all, run_load, run_transform, LoadOptions, LocalDirFetcher, LogObserver, PipelineConfig,
};

const USAGE: &str = "usage:
  bank-aggregates transform <raw.csv> <aggregates.csv>
  bank-aggregates load <aggregates.csv> <database.db>
  bank-aggregates run <config.json>";

fn main() {
    // Respect RUST_LOG if set, otherwise info
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run() {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let observer = LogObserver::new();

    match args.get(1).map(String::as_str) {
        Some("transform") if args.len() == 4 => {
            let report = run_transform(Path::new(&args[2]), Path::new(&args[3]), &observer)
                .context("Transform stage failed")?;
            log::info!("✅ {}", report.summary());
        }
        Some("load") if args.len() == 4 => {
            let report = run_load(
                Path::new(&args[2]),
                Path::new(&args[3]),
                LoadOptions::default(),
                None,
                &observer,
            )
            .context("Load stage failed")?;
            log::info!("✅ {}", report.summary());
        }
        Some("run") if args.len() == 3 => {
            let config = PipelineConfig::from_file(Path::new(&args[2]))?;
            let fetcher = LocalDirFetcher::new(&config.blob_root);
            let report = run_all(&config, &fetcher, &observer).context("Pipeline run failed")?;
            log::info!(
                "✅ Run complete: {} | {}",
                report.transform.summary(),
                report.load.summary()
            );
        }
        _ => bail!("{}", USAGE),
    }

    Ok(())
}
