use anyhow::Result;
use clap::Parser;
use coordination::FleetConfig;
use fleet::app;
use fleet::cli::{Cli, Command};
use fleet::render;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = FleetConfig::load(cli.config.as_deref())?;

    match &cli.command {
        Command::Run { seed } => app::run(&config, seed.as_deref()).await?,
        Command::Tick => {
            let report = app::tick_once(&config).await?;
            print!("{}", render::tick_summary(&report));
        }
        Command::List { status, json } => {
            let snapshot = app::status(&config)?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                print!("{}", render::task_table(&snapshot, *status));
            }
        }
        Command::Health { json } => {
            let issues = app::health(&config).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&issues)?);
            } else {
                print!("{}", render::health_report(&issues));
            }
        }
        Command::Config => print!("{}", toml::to_string_pretty(&config)?),
        command => {
            let commands = command.task_commands()?.unwrap_or_default();
            let paths = app::submit(&config, &commands)?;
            println!(
                "Queued {} command(s) in {}",
                paths.len(),
                config.inbox_dir().display()
            );
        }
    }

    Ok(())
}
