use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use ers_offline::config::Config;
use ers_offline::engine::OfflineEngine;
use ers_offline::event::{Event, EventHandler};
use ers_offline::logging;
use ers_offline::outbox::DurableOutbox;
use ers_offline::tiles::Bounds;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ers-offline")]
#[command(about = "Offline cache, outbox and sync for the ambulance dispatch client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ers-offline/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log at debug level
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the app shell and static assets
  Install,
  /// Delete cache generations other than the current ones
  Activate,
  /// Replay queued writes and buffered locations now
  Sync,
  /// Print queued writes as JSON
  Outbox,
  /// List the tiles a prefetch would download
  PlanTiles {
    #[command(flatten)]
    viewport: Viewport,
    /// Show at most this many tiles
    #[arg(long)]
    limit: Option<usize>,
  },
  /// Download tiles around a viewport into the tile cache
  Prefetch {
    #[command(flatten)]
    viewport: Viewport,
  },
  /// Buffer a position sample for the next sync
  RecordLocation {
    ambulance_id: String,
    #[arg(allow_hyphen_values = true)]
    latitude: f64,
    #[arg(allow_hyphen_values = true)]
    longitude: f64,
  },
  /// Store an assignment as the offline fallback
  CacheEmergency {
    /// JSON file holding the assignment; stdin when omitted
    #[arg(short, long)]
    file: Option<PathBuf>,
  },
  /// Probe connectivity and sync whenever it returns
  Watch,
}

#[derive(clap::Args, Debug)]
struct Viewport {
  #[arg(long, allow_hyphen_values = true)]
  north: f64,
  #[arg(long, allow_hyphen_values = true)]
  south: f64,
  #[arg(long, allow_hyphen_values = true)]
  east: f64,
  #[arg(long, allow_hyphen_values = true)]
  west: f64,
  /// Current map zoom
  #[arg(long)]
  zoom: u8,
}

impl Viewport {
  fn bounds(&self) -> Bounds {
    Bounds::new(self.north, self.south, self.east, self.west)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let log_dir = logging::default_log_dir(&Config::data_dir()?);
  let _logging = logging::init_logging(&log_dir, args.verbose)?;

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let engine = OfflineEngine::open(config)?;

  match args.command {
    Command::Install => {
      let count = engine.install().await?;
      println!("Precached {} assets", count);
    }
    Command::Activate => {
      let dropped = engine.activate()?;
      if dropped.is_empty() {
        println!("No stale caches");
      }
      for namespace in dropped {
        println!("Deleted {}", namespace);
      }
    }
    Command::Sync => {
      let report = engine.sync().await?;
      println!(
        "Attempted {}, delivered {}, still queued {}, locations synced {}",
        report.attempted, report.delivered, report.failed, report.locations_synced
      );
    }
    Command::Outbox => {
      let items = engine.outbox().list_all()?;
      println!("{}", serde_json::to_string_pretty(&items)?);
    }
    Command::PlanTiles { viewport, limit } => {
      let (planned, tiles) = engine.prefetcher().plan(&viewport.bounds(), viewport.zoom);
      let config = engine.config();
      for tile in tiles.iter().take(limit.unwrap_or(usize::MAX)) {
        println!("{}\t{}", tile, tile.url(&config.tile_url_template, &config.tile_subdomain));
      }
      info!(planned, kept = tiles.len(), "Planned tiles");
    }
    Command::Prefetch { viewport } => {
      let report = engine.prefetch(&viewport.bounds(), viewport.zoom).await;
      println!(
        "Planned {}, cached {}, already cached {}, failed {}",
        report.planned, report.cached, report.skipped, report.failed
      );
    }
    Command::RecordLocation {
      ambulance_id,
      latitude,
      longitude,
    } => {
      if !engine.record_location(&ambulance_id, latitude, longitude) {
        return Err(eyre!("Failed to store location update"));
      }
    }
    Command::CacheEmergency { file } => {
      let text = match file {
        Some(path) => std::fs::read_to_string(&path)
          .map_err(|e| eyre!("Failed to read {}: {}", path.display(), e))?,
        None => std::io::read_to_string(std::io::stdin())?,
      };
      let payload =
        serde_json::from_str(&text).map_err(|e| eyre!("Invalid assignment JSON: {}", e))?;
      let snapshot = engine.cache_emergency(payload)?;
      println!("Cached assignment {}", snapshot.id.as_deref().unwrap_or("(no id)"));
    }
    Command::Watch => {
      let config = engine.config();
      let probe = config.resolve(&config.probe.path)?;
      let interval = Duration::from_secs(config.probe.interval_secs.max(1));
      let mut events = EventHandler::new(Arc::clone(engine.fetcher()), probe, interval);
      let mut first = true;

      while let Some(event) = events.next().await {
        match event {
          Event::Connectivity(state) => {
            // Writes queued by an earlier run go out on the first successful probe
            let result = if first && state.is_online() {
              engine.sync().await.map(Some)
            } else {
              engine.set_online(state.is_online()).await
            };
            first = false;
            match result {
              Ok(Some(report)) => {
                println!("Synced {} of {} queued writes", report.delivered, report.attempted)
              }
              Ok(None) => {}
              // The next transition retries
              Err(e) => error!(error = %e, "Sync pass failed"),
            }
          }
          Event::Shutdown => break,
        }
      }
    }
  }

  Ok(())
}
