use std::path::{Path, PathBuf};
use std::process;

use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use devpulse_lib::commands::db::parse_day_key;
use devpulse_lib::commands::settings::{load_settings_from_disk, save_settings_to_disk};
use devpulse_lib::models::day::PeriodKind;
use devpulse_lib::{Error, ProgressApp, Result};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "devpulse", about = "Daily progress scores from git activity", version)]
struct Cli {
    /// Repository to operate on.
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score today's changes, summarize them and persist the result.
    Generate {
        /// Day to attribute the run to (YYYY-MM-DD). Defaults to today.
        #[arg(long)]
        date: Option<String>,
    },

    /// Fold new commits into today's counts.
    Poll {
        /// Run a single tick and exit instead of polling until Ctrl-C.
        #[arg(long)]
        once: bool,
    },

    /// Show one stored day.
    Day {
        /// Date (YYYY-MM-DD). Defaults to today.
        date: Option<String>,
    },

    /// Show stored days in an inclusive range.
    Range { start: String, end: String },

    /// Show week, month or year rollups.
    Period {
        #[arg(value_enum)]
        kind: PeriodArg,

        /// Rollup key (e.g. 2024-W02, 2024-01, 2024). Lists all rollups when omitted.
        key: Option<String>,

        /// Attach summary text to the rollup.
        #[arg(long, requires = "key")]
        summary: Option<String>,
    },

    /// Copy the progress store to a file.
    Export { dest: PathBuf },

    /// Replace the progress store with a previously exported file.
    Import { source: PathBuf },

    /// Show settings, or merge a JSON object into them.
    Settings {
        #[arg(long)]
        set: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PeriodArg {
    Week,
    Month,
    Year,
}

impl From<PeriodArg> for PeriodKind {
    fn from(arg: PeriodArg) -> Self {
        match arg {
            PeriodArg::Week => PeriodKind::Week,
            PeriodArg::Month => PeriodKind::Month,
            PeriodArg::Year => PeriodKind::Year,
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Commands::Settings { set } = &cli.command {
        return cmd_settings(&cli.repo, set.as_deref());
    }

    let mut app = ProgressApp::new();
    app.open_repository(&cli.repo).await?;
    let result = dispatch(&mut app, cli.command).await;
    app.close().await?;
    result
}

async fn dispatch(app: &mut ProgressApp, command: Commands) -> Result<()> {
    match command {
        Commands::Generate { date } => {
            let date = date_or_today(date.as_deref())?;
            let status = app.active()?.orchestrator.run(date).await;
            print_json(&status)
        }
        Commands::Poll { once: true } => {
            let session = app.active()?;
            session.poller().tick_and_record(today()).await;
            print_json(&session.poller().status())
        }
        Commands::Poll { once: false } => {
            let session = app.active_mut()?;
            session.start_polling();
            log::info!(
                "polling every {}s, Ctrl-C to stop",
                session.settings.poll_interval.as_secs()
            );
            tokio::signal::ctrl_c().await?;
            print_json(&session.poller().status())
        }
        Commands::Day { date } => {
            let date = date_or_today(date.as_deref())?;
            let store = app.active()?.store.lock().await;
            print_json(&store.get_day(date)?)
        }
        Commands::Range { start, end } => {
            let (start, end) = (parse_day_key(&start)?, parse_day_key(&end)?);
            let store = app.active()?.store.lock().await;
            print_json(&store.get_days_range(start, end)?)
        }
        Commands::Period { kind, key, summary } => {
            let kind = PeriodKind::from(kind);
            let store = app.active()?.store.lock().await;
            match key {
                Some(key) => {
                    if let Some(summary) = summary {
                        store.set_period_summary(kind, &key, &summary)?;
                    }
                    print_json(&store.get_period(kind, &key)?)
                }
                None => print_json(&store.list_periods(kind)?),
            }
        }
        Commands::Export { dest } => {
            let store = app.active()?.store.lock().await;
            store.export_to(&dest)?;
            log::info!("exported progress store to {}", dest.display());
            Ok(())
        }
        Commands::Import { source } => {
            let mut store = app.active()?.store.lock().await;
            let backup = store.import_from(&source)?;
            log::info!("previous store saved as {}", backup.display());
            Ok(())
        }
        Commands::Settings { set } => {
            let path = app.active()?.path();
            cmd_settings(&path, set.as_deref())
        }
    }
}

fn cmd_settings(repo: &Path, set: Option<&str>) -> Result<()> {
    let settings = match set {
        Some(raw) => {
            let incoming: serde_json::Value = serde_json::from_str(raw)?;
            if !incoming.is_object() {
                return Err(Error::Settings("expected a JSON object".to_string()));
            }
            save_settings_to_disk(repo, incoming)?
        }
        None => load_settings_from_disk(repo)?,
    };
    print_json(&settings)
}

fn date_or_today(raw: Option<&str>) -> Result<NaiveDate> {
    match raw {
        Some(raw) => parse_day_key(raw),
        None => Ok(today()),
    }
}

fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
