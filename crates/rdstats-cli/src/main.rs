use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rdstats_storage::read_snapshot;
use rdstats_sync::{JobConfig, JobProfile, RankedStatsPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rdstats-cli")]
#[command(about = "Ranked deck stats job")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the job once and publish the snapshot.
    Run(ProfileArgs),
    /// Serve `POST /invoke`.
    Serve(ProfileArgs),
    /// Run profiles on their cron schedules until ctrl-c.
    Schedule {
        #[arg(long)]
        profiles_file: Option<PathBuf>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Fetch, decompress and print the published snapshot.
    Show(ProfileArgs),
}

#[derive(Debug, Default, Args)]
struct ProfileArgs {
    /// `ranked-decks` or `ranked-archetypes`.
    #[arg(long)]
    profile: Option<String>,
    #[arg(long)]
    threshold: Option<u64>,
    #[arg(long, conflicts_with = "no_cards")]
    include_cards: bool,
    #[arg(long)]
    no_cards: bool,
    /// Write to a local directory instead of the object store.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

impl ProfileArgs {
    fn apply(&self, config: &mut JobConfig) -> Result<()> {
        if let Some(name) = &self.profile {
            config.profile = JobProfile::builtin(name)
                .with_context(|| format!("unknown profile `{name}`"))?;
        }
        if let Some(threshold) = self.threshold {
            config.profile.threshold = threshold;
        }
        if self.include_cards {
            config.profile.include_cards = true;
        }
        if self.no_cards {
            config.profile.include_cards = false;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = Some(dir.clone());
            config.store_endpoint = None;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("RDSTATS_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = JobConfig::from_env()?;
    tracing::debug!(profile = %config.profile.name, "loaded job config from env");

    match cli.command.unwrap_or(Commands::Run(ProfileArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config)?;
            let pipeline = RankedStatsPipeline::from_config(&config, config.profile.clone())?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} profile={} patch={} rows={} published={} undecodable={} destination={} sha256={}",
                summary.run_id,
                summary.profile,
                summary.patch_number,
                summary.rows,
                summary.published_results,
                summary.undecodable_decks,
                summary.destination,
                summary.sha256
            );
        }
        Commands::Serve(args) => {
            args.apply(&mut config)?;
            rdstats_web::serve(config).await?;
        }
        Commands::Schedule {
            profiles_file,
            output_dir,
        } => {
            if profiles_file.is_some() {
                config.profiles_file = profiles_file;
            }
            if output_dir.is_some() {
                config.output_dir = output_dir;
                config.store_endpoint = None;
            }
            config.scheduler_enabled = true;
            rdstats_sync::run_scheduler(config).await?;
        }
        Commands::Show(args) => {
            args.apply(&mut config)?;
            let store = config.snapshot_store()?;
            let destination = config.destination_for(&config.profile);
            let Some(stats) = read_snapshot(store.as_ref(), &destination).await? else {
                bail!("nothing published at {destination}");
            };
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
