//! 🚀 pmx-cli: the front door. Loads config, sets up logging, counts the untriaged.
//!
//! 🎬 *[narrator voice]* "Every night at 3am, a cron job ran this binary.
//! Nobody remembered who scheduled it. Nobody dared to turn it off."
//! 📦 Thin wrapper: flags in, `pmx::run` does the heavy lifting, summary table out. 🦆

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use pmx::RunOptions;
use pmx::metrics::FamilyKind;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// 📊 Measure project health across repositories and write it to the cluster.
#[derive(Debug, Parser)]
#[command(name = "pmx", version, about)]
struct Cli {
    /// 🔧 TOML config file. Defaults to ./pmx.toml when it exists; env vars (PMX_*) otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    /// 📊 Metric family to run. Repeat for more. Defaults to [run].families.
    #[arg(long = "family", value_parser = parse_family)]
    families: Vec<FamilyKind>,

    /// 📅 Date bucket to measure (yyyy-mm-dd). Defaults to today, UTC. Older dates backfill.
    #[arg(long)]
    date: Option<NaiveDate>,

    /// 📚 Repository to measure. Repeat for more. Defaults to [run].repositories, then discovery.
    #[arg(long = "repo")]
    repositories: Vec<String>,
}

// -- 🎯 clap wants a plain error; FamilyKind hands back an anyhow one
fn parse_family(raw: &str) -> std::result::Result<FamilyKind, String> {
    raw.parse::<FamilyKind>().map_err(|err| err.to_string())
}

/// 🚀 main(), where it all begins. The "I pressed F5 and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse flags
/// 3. Load config (the moment of truth)
/// 4. Run every family (send it 🙏)
/// 5. Print the summary, or the error chain and exit 1
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 Set up tracing, because println! debugging is a lifestyle choice
    // we're trying to move past, like flip phones and cargo shorts
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // 🔒 An explicit --config must exist. The default one is optional.
    let config_file = match &cli.config {
        Some(path) => {
            let exists = path.try_exists().with_context(|| {
                format!(
                    "💀 Couldn't check whether the config file exists. Relative paths resolve \
                     against the cwd; use an absolute path to be absolutely certain. Was checking here: '{}'",
                    path.display()
                )
            })?;
            if !exists {
                anyhow::bail!("💀 Config file '{}' isn't there. We looked. Twice.", path.display());
            }
            Some(path.clone())
        }
        None => {
            let fallback = PathBuf::from("pmx.toml");
            fallback.try_exists().unwrap_or(false).then_some(fallback)
        }
    };

    // 🔧 Load the config, where we find out if someone put a tab where a space should be
    let app_config = pmx::app_config::load_config(config_file.as_deref())
        .context("💀 In pmx-cli, main, we couldn't load the config. Check the file and the PMX_* env vars.")?;

    let options = RunOptions {
        date: cli.date.unwrap_or_else(|| Utc::now().date_naive()),
        families: (!cli.families.is_empty()).then_some(cli.families),
        repositories: (!cli.repositories.is_empty()).then_some(cli.repositories),
    };

    // 🚀 SEND IT.
    let result = pmx::run(app_config, options).await;

    match result {
        Ok(reports) => {
            println!("{}", pmx::progress::summary_table(&reports));
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            // -- 🧅 peel the onion of sadness, one layer at a time
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
                let cause_str = cause.to_string();
                if cause_str.contains("error sending request")
                    || cause_str.contains("connection refused")
                    || cause_str.contains("Connection refused")
                    || cause_str.contains("tcp connect error")
                    || cause_str.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }

            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: looks like the cluster isn't reachable. \
                    Double-check [store].url and that OpenSearch is actually running. \
                    If you're using Docker, `docker ps` knows the truth. ☕"
                );
            }

            // 🗑️ Exit with prejudice.
            std::process::exit(1);
        }
    }
}
