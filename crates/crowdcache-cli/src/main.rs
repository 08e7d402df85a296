//! crowdcache - headless driver for the congestion cache.
//!
//! Opens the same on-disk cache the dashboard uses, runs one command against
//! it and saves dashboard state on exit.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::{FixedOffset, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crowdcache_core::models::AgeBracket;
use crowdcache_core::utils::{age_display, format_percent, format_population_range, truncate_string};
use crowdcache_core::{ApiClient, Config, Dashboard, LocationView, SnapshotSource, UserPreferences, ViewSource};

/// Width of the name column in tables
const NAME_WIDTH: usize = 24;

#[derive(Parser, Debug)]
#[command(name = "crowdcache")]
#[command(version, about = "Cache and rank real-time city congestion data")]
struct Cli {
    /// Proxy base URL (overrides config and CROWDCACHE_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Cache directory (overrides config and CROWDCACHE_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show cached locations and collection progress
    Status,
    /// Show one location, from cache when fresh
    Select {
        /// Location name or alias
        name: String,
    },
    /// Pre-fetch important locations until everything is cached
    Collect,
    /// Rank cached locations against preferences
    Recommend {
        /// Prefer quiet places (saved for later runs)
        #[arg(long, conflicts_with = "busy")]
        quiet: bool,
        /// Prefer lively places (saved for later runs)
        #[arg(long)]
        busy: bool,
        /// Preferred age bracket (0, 10s, 20s, ... 70s)
        #[arg(long)]
        age: Option<AgeBracket>,
        /// Preferred category id (repeatable)
        #[arg(long = "category")]
        categories: Vec<String>,
    },
    /// Rank cached locations by the share of one age bracket
    Ages {
        bracket: AgeBracket,
    },
    /// Search the area directory
    Search {
        text: String,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard flushes the file log and must be held until exit.
fn init_tracing(config: &Config) -> Result<Option<WorkerGuard>> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = if config.log_to_file {
        let dir = config.log_dir()?;
        std::fs::create_dir_all(&dir)?;
        let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "crowdcache.log"));
        (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let mut config = Config::load()?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }

    let _log_guard = init_tracing(&config)?;
    info!(api = %config.api_base_url, "crowdcache starting");

    let client = ApiClient::new(&config.api_base_url, config.request_timeout(), config.local_offset())?;
    let source: Arc<dyn SnapshotSource> = Arc::new(client.clone());
    let mut dashboard = Dashboard::open(&config, source)?;

    if matches!(
        cli.command,
        Commands::Select { .. } | Commands::Recommend { .. } | Commands::Search { .. }
    ) {
        if let Err(e) = dashboard.load_directory(&client).await {
            warn!(error = %e, "Could not load area directory, using built-in list");
        }
    }

    let result = run(cli.command, &mut dashboard, config.local_offset()).await;
    dashboard.close().await?;
    result
}

async fn run(command: Commands, dashboard: &mut Dashboard, offset: FixedOffset) -> Result<()> {
    match command {
        Commands::Status => {
            let status = dashboard.status().await;
            let progress = dashboard.collection_progress().await;
            let updated = status
                .last_updated_at
                .map(|at| age_display((Utc::now() - at).num_minutes()))
                .unwrap_or_else(|| "never".to_string());
            println!("Cached locations: {} (last update {})", status.count, updated);
            println!(
                "Important locations: {}/{} cached{}",
                progress.loaded_important,
                progress.total_important,
                if progress.paused { " (collection paused)" } else { "" }
            );
            for id in status.ids {
                println!("  {}", id);
            }
        }
        Commands::Select { name } => {
            let view = dashboard.select_location(&name).await?;
            print_view(&view, offset);
        }
        Commands::Collect => {
            if !dashboard.start_collection() {
                println!("Collector not started (paused or already running)");
                return Ok(());
            }
            let mut rx = dashboard.collector().subscribe();
            loop {
                let progress = *rx.borrow_and_update();
                println!(
                    "Collected {}/{} important locations",
                    progress.loaded_important, progress.total_important
                );
                if !progress.in_progress || rx.changed().await.is_err() {
                    break;
                }
            }
        }
        Commands::Recommend {
            quiet,
            busy,
            age,
            categories,
        } => {
            let congestion = match (quiet, busy) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let preferences = merge_preferences(dashboard.preferences(), congestion, age, categories);
            dashboard.set_preferences(preferences);

            let entries = dashboard.get_recommendations().await;
            if entries.is_empty() {
                println!("Nothing cached yet; run `crowdcache collect` first");
            }
            for (rank, entry) in entries.iter().enumerate() {
                println!(
                    "{}. {:<width$} {:>6.1}  {}",
                    rank + 1,
                    truncate_string(&entry.snapshot.display_name, NAME_WIDTH),
                    entry.score,
                    entry.snapshot.congestion_level,
                    width = NAME_WIDTH
                );
                for reason in &entry.match_reasons {
                    println!("     - {}", reason);
                }
            }
        }
        Commands::Ages { bracket } => {
            for snapshot in dashboard.rank_by_age(bracket).await {
                println!(
                    "{:<width$} {:>7}",
                    truncate_string(&snapshot.display_name, NAME_WIDTH),
                    format_percent(snapshot.age_rate(bracket)),
                    width = NAME_WIDTH
                );
            }
        }
        Commands::Search { text } => {
            let results = dashboard.search(&text);
            if results.is_empty() {
                println!("No matching locations");
            }
            for hit in results {
                println!(
                    "{:>3}  {}{}",
                    hit.score,
                    hit.area.name,
                    hit.area
                        .category
                        .as_deref()
                        .map(|c| format!(" [{}]", c))
                        .unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

/// Apply command-line overrides on top of the saved preferences. Anything
/// not given on the command line keeps its saved value.
fn merge_preferences(
    current: &UserPreferences,
    prefer_quiet: Option<bool>,
    age: Option<AgeBracket>,
    categories: Vec<String>,
) -> UserPreferences {
    UserPreferences {
        prefer_quiet: prefer_quiet.unwrap_or(current.prefer_quiet),
        preferred_age_bracket: age.unwrap_or(current.preferred_age_bracket),
        preferred_categories: if categories.is_empty() {
            current.preferred_categories.clone()
        } else {
            categories.into_iter().collect()
        },
    }
}

fn print_view(view: &LocationView, offset: FixedOffset) {
    let s = &view.snapshot;
    let origin = match &view.source {
        ViewSource::Cache => "cached".to_string(),
        ViewSource::Network => "live".to_string(),
        ViewSource::Degraded { reason } => format!("DEGRADED, fetch failed: {}", reason),
    };
    println!("{} ({})", s.display_name, origin);
    println!(
        "  Congestion: {} [{}]",
        s.congestion_level,
        s.congestion_level.color()
    );
    if let Some(ref message) = s.congestion_message {
        println!("  {}", message);
    }
    println!(
        "  Population: {}",
        format_population_range(s.population_min, s.population_max)
    );
    println!(
        "  Gender: male {} / female {}",
        format_percent(s.gender.male),
        format_percent(s.gender.female)
    );
    let ages: Vec<String> = AgeBracket::ALL
        .iter()
        .map(|b| format!("{} {}", b.label(), format_percent(s.age_rate(*b))))
        .collect();
    println!("  Ages: {}", ages.join(", "));
    if let Some(ref forecast) = s.forecast {
        for point in forecast {
            println!(
                "  Forecast {}: {} ({})",
                point.at.with_timezone(&offset).format("%H:%M"),
                point.congestion_level,
                format_population_range(point.population_min, point.population_max)
            );
        }
    }
    println!(
        "  Data age: {}",
        age_display((Utc::now() - view.cached_at).num_minutes())
    );
}
