//! Binary entrypoint for the Grenzwanderer developer CLI.
//!
//! Plays through progression offline against a local sled store, with map points
//! seeded from `<data_dir>/points.json` and an in-memory backend.
//!
//! Commands:
//! - `init` - write a starter config, a sample point seed and the device id
//! - `status` - print player, quests and discoveries
//! - `scan <code>` - discover a point by its QR payload
//! - `locate <lat> <lng>` / `locate --no-fix` - discover a point by position
//! - `quest start|advance|complete|track` - drive a quest directly
//! - `research <point>` - mark a discovered point as researched
//! - `grant [--credits N] [--item ID]...` - hand out credits and items locally
//! - `reset` - wipe local progression (the device id is kept)
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use grenzwanderer::config::Config;
use grenzwanderer::progression::{
    parse_point_seed, system_clock, BindingKind, Coordinates, EventOutcome, Identity,
    InMemoryBackend, MapPoint, PersistenceWriter, PointType, ProgressionEngine, ProgressionEvent,
    ProgressionStorage, QuestProgressRecord,
};

#[derive(Parser)]
#[command(name = "grenzwanderer")]
#[command(about = "Offline play-testing for Grenzwanderer progression")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "grenzwanderer.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a starter configuration and point seed
    Init,
    /// Show player state, quests and discoveries
    Status,
    /// Discover a point from a scanned QR payload
    Scan { code: String },
    /// Discover a point from a position fix
    Locate {
        #[arg(allow_negative_numbers = true, required_unless_present = "no_fix")]
        lat: Option<f64>,
        #[arg(allow_negative_numbers = true, required_unless_present = "no_fix")]
        lng: Option<f64>,
        /// Pretend the device has no fix (uses the configured fallback position)
        #[arg(long)]
        no_fix: bool,
    },
    /// Drive a quest directly
    Quest {
        #[command(subcommand)]
        action: QuestAction,
    },
    /// Mark a discovered point as researched
    Research { point: String },
    /// Grant credits and items locally
    Grant {
        #[arg(long, default_value_t = 0)]
        credits: u64,
        #[arg(long = "item")]
        items: Vec<String>,
    },
    /// Wipe local progression
    Reset,
}

#[derive(Subcommand)]
enum QuestAction {
    Start { quest: String, step: String },
    Advance { quest: String, step: String },
    Complete { quest: String },
    /// Track a quest (omit the id to stop tracking)
    Track { quest: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        return init(&cli.config).await;
    }

    let config = Config::load(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    let storage = Arc::new(ProgressionStorage::open(config.storage.db_path())?);
    let device_id = storage.device_id()?;
    let loaded = storage.load_state()?;
    let points = load_points(&config.storage.points_path()).await?;

    let clock = system_clock();
    let identity = Identity::anonymous(&device_id);
    let backend = InMemoryBackend::new(clock.clone()).with_points(points.clone());
    if let Some(snapshot) = &loaded.quests {
        for progress in snapshot.quests.values() {
            backend.put_quest_record(&identity.actor(), QuestProgressRecord::from_progress(progress));
        }
    }
    let writer = PersistenceWriter::spawn(storage.clone(), config.sync.max_pending);
    let mut engine = ProgressionEngine::new(identity, Arc::new(backend), clock, config.engine_settings())
        .with_loaded_state(loaded)
        .with_points(points)
        .with_persistence(writer);

    let result = run(&mut engine, cli.command).await;
    engine.shutdown().await?;
    result
}

async fn run(engine: &mut ProgressionEngine, command: Commands) -> Result<()> {
    match command {
        Commands::Init => {}
        Commands::Status => print_status(engine),
        Commands::Scan { code } => {
            let outcome = engine.dispatch(ProgressionEvent::scan(&code)).await?;
            print_outcome(&outcome);
        }
        Commands::Locate { lat, lng, no_fix } => {
            let coordinates = match (no_fix, lat, lng) {
                (true, _, _) => None,
                (false, Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
                _ => return Err(anyhow!("locate needs <lat> <lng> or --no-fix")),
            };
            let outcome = engine.dispatch(ProgressionEvent::location(coordinates)).await?;
            print_outcome(&outcome);
        }
        Commands::Quest { action } => {
            let event = match action {
                QuestAction::Start { quest, step } => ProgressionEvent::start(&quest, &step),
                QuestAction::Advance { quest, step } => ProgressionEvent::advance(&quest, &step),
                QuestAction::Complete { quest } => ProgressionEvent::complete(&quest),
                QuestAction::Track { quest } => {
                    engine.set_tracked_quest(quest.as_deref()).await;
                    println!("Tracking: {}", quest.as_deref().unwrap_or("-"));
                    return Ok(());
                }
            };
            let outcome = engine.dispatch(event).await?;
            print_outcome(&outcome);
        }
        Commands::Research { point } => {
            if engine.mark_researched(&point).await? {
                println!("Researched {}", point);
            } else {
                println!("{} was already researched", point);
            }
        }
        Commands::Grant { credits, items } => {
            let outcome = engine
                .dispatch(ProgressionEvent::Grant { credits, items })
                .await?;
            print_outcome(&outcome);
        }
        Commands::Reset => {
            engine.reset().await;
            println!("Local progression cleared.");
        }
    }
    Ok(())
}

async fn init(config_path: &str) -> Result<()> {
    info!("Initializing new configuration");
    let cfg = Config::default();
    if tokio::fs::metadata(config_path).await.is_ok() {
        warn!("{} already exists; leaving it untouched", config_path);
    } else {
        Config::create_default(config_path).await?;
        info!("Configuration file created at {}", config_path);
    }

    tokio::fs::create_dir_all(&cfg.storage.data_dir).await?;
    let points_path = cfg.storage.points_path();
    if tokio::fs::metadata(&points_path).await.is_err() {
        let seed = serde_json::to_string_pretty(&sample_points())?;
        tokio::fs::write(&points_path, seed).await?;
        info!("Sample points written to {}", points_path);
    }

    let storage = ProgressionStorage::open(cfg.storage.db_path())?;
    let device_id = storage.device_id()?;
    storage.flush()?;
    println!("Initialized. Device id: {}", device_id);
    Ok(())
}

async fn load_points(path: &str) -> Result<Vec<MapPoint>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("No point seed at {}; the map is empty", path);
            return Ok(Vec::new());
        }
        Err(e) => return Err(anyhow!("Failed to read point seed {}: {}", path, e)),
    };
    let points = parse_point_seed(&content)
        .map_err(|e| anyhow!("Failed to load point seed {}: {}", path, e))?;
    info!("Loaded {} points from {}", points.len(), path);
    Ok(points)
}

fn sample_points() -> Vec<MapPoint> {
    vec![
        MapPoint::new(
            "schwabentor",
            Coordinates::new(47.9929, 7.8546),
            PointType::Location,
        )
        .with_radius(80.0)
        .with_binding(
            "old_town",
            BindingKind::Start {
                step: "find_the_gate".to_string(),
            },
        ),
        MapPoint::new(
            "freiburg_cathedral",
            Coordinates::new(47.9955, 7.8522),
            PointType::Quest,
        )
        .with_phase_requirement(1)
        .with_binding(
            "old_town",
            BindingKind::Objective {
                step: "climb_the_tower".to_string(),
            },
        ),
        MapPoint::new("martinstor", Coordinates::new(47.9946, 7.8494), PointType::Npc).with_binding(
            "old_town",
            BindingKind::Reward {
                credits: 15,
                items: vec!["tower_key".to_string()],
            },
        ),
    ]
}

fn print_outcome(outcome: &EventOutcome) {
    match outcome {
        EventOutcome::Quest {
            quest_id,
            changed,
            sync,
        } => println!(
            "Quest {}: {} ({:?})",
            quest_id,
            if *changed { "updated" } else { "unchanged" },
            sync
        ),
        EventOutcome::Discovered {
            point_key,
            first_time,
            effect,
            used_fallback_position,
        } => {
            if *used_fallback_position {
                println!("(no position fix, used fallback position)");
            }
            if *first_time {
                println!("Discovered {}", point_key);
            } else {
                println!("{} was already discovered", point_key);
            }
            if let Some(effect) = effect {
                println!("  -> {:?}", effect);
            }
        }
        EventOutcome::Granted { credits, new_items } => {
            println!("Granted {} credits, new items: {:?}", credits, new_items)
        }
    }
}

fn print_status(engine: &ProgressionEngine) {
    let player = engine.player().state();
    println!("Actor:    {}", engine.identity().actor());
    println!("Phase:    {}", player.phase);
    println!("Credits:  {}", player.credits);
    println!("Health:   {} ({:?})", player.health, player.status);
    println!("Items:    {:?}", player.inventory);
    if !player.flags.is_empty() {
        println!("Flags:    {:?}", player.flags);
    }
    println!(
        "Tracked:  {}",
        engine.quests().tracked_quest_id().unwrap_or("-")
    );
    for quest in engine.quests().iter() {
        println!(
            "  quest {:<24} {:<20} updated {}",
            quest.id,
            quest.step,
            quest.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    let actor = engine.identity().actor();
    for discovery in engine.discoveries().for_actor(&actor) {
        println!(
            "  found {:<24} {}{}",
            discovery.point_key,
            discovery.discovered_at.format("%Y-%m-%d %H:%M"),
            if discovery.researched_at.is_some() { " (researched)" } else { "" }
        );
    }
    println!("Points loaded: {}", engine.catalog().len());
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => config
            .as_ref()
            .and_then(|c| c.logging.level.parse().ok())
            .unwrap_or(log::LevelFilter::Info),
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when attached to a terminal.
        let is_tty = atty::is(atty::Stream::Stderr);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
