use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use pending_updates::core::Column;
use pending_updates::entity::RegistryLock;
use pending_updates::{
    AttributeMap, Clock, DataType, EntityRegistry, EntityResolver, EntityTable, FilePendingStore,
    ParentRef, PassStatus, PendingConfig, PendingUpdates, SystemClock, UpdateOutcome, Value,
    spawn_reconcile_worker,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const ENTITIES_FILE: &str = "entities.json";
const PENDING_FILE: &str = "pending_mutations.json";

#[derive(Parser)]
#[command(name = "pending-updates")]
#[command(about = "Schedule delayed and self-reverting entity updates")]
struct Cli {
    /// Directory holding the entity and pending mutation snapshots
    #[arg(long, global = true, default_value = ".pending-updates")]
    data_dir: PathBuf,

    /// Reject windows reaching further than this many days
    #[arg(long, global = true)]
    max_postpone_days: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create or replace an entity type
    Define {
        #[arg(long)]
        entity_type: String,
        /// NAME:TYPE with TYPE one of integer, float, text, boolean; a trailing `!` means NOT NULL
        #[arg(long = "column", required = true)]
        columns: Vec<String>,
        /// Attributes pending updates may change
        #[arg(long)]
        fillable: Vec<String>,
    },
    /// Insert an entity and print its id
    Insert {
        #[arg(long)]
        entity_type: String,
        #[arg(long = "set")]
        values: Vec<String>,
    },
    /// Print an entity as JSON
    Show {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        id: String,
    },
    /// Delete an entity together with its pending mutation
    Delete {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        id: String,
    },
    /// Schedule an update for an entity
    Schedule {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        id: String,
        #[arg(long = "set", required = true)]
        values: Vec<String>,
        /// Apply after this long, e.g. 30s, 10m, 3h, 2d
        #[arg(long)]
        delay_for: Option<String>,
        /// Revert this long after the update was applied
        #[arg(long)]
        keep_for: Option<String>,
        #[arg(long)]
        start_from: Option<String>,
        #[arg(long)]
        revert_at: Option<String>,
    },
    /// Run one reconciler pass
    Check,
    /// Run reconciler passes periodically until Ctrl-C
    Watch {
        #[arg(long, default_value_t = 60)]
        interval_secs: u64,
    },
    /// Print all pending mutations
    List,
    /// Tell whether an entity has a pending mutation
    Has {
        #[arg(long)]
        entity_type: String,
        #[arg(long)]
        id: String,
    },
}

struct App {
    registry: Arc<EntityRegistry>,
    service: PendingUpdates,
    entities_path: PathBuf,
}

impl App {
    async fn open(data_dir: &Path, config: PendingConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let entities_path = data_dir.join(ENTITIES_FILE);

        let registry = EntityRegistry::load(&entities_path, clock.clone())
            .await
            .with_context(|| format!("Failed to load '{}'", entities_path.display()))?
            .persist_to(&entities_path);

        let pending_path = data_dir.join(PENDING_FILE);
        let store = FilePendingStore::open(&pending_path)
            .await
            .with_context(|| format!("Failed to open '{}'", pending_path.display()))?;

        let service = PendingUpdates::new(Arc::new(store), clock, config)?;
        Ok(Self {
            registry: Arc::new(registry),
            service,
            entities_path,
        })
    }

    async fn lock_entities(&self) -> Result<RegistryLock<'_>> {
        self.registry
            .lock_snapshot(&self.entities_path)
            .await
            .with_context(|| format!("Failed to lock '{}'", self.entities_path.display()))
    }

    async fn save_entities(&self, snapshot: RegistryLock<'_>) -> Result<()> {
        snapshot
            .save()
            .await
            .with_context(|| format!("Failed to write '{}'", self.entities_path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = PendingConfig::from_env()?;
    if let Some(days) = cli.max_postpone_days {
        config = config.max_postpone_days(days);
    }
    config.validate()?;

    let app = App::open(&cli.data_dir, config).await?;
    run(&app, cli.command).await
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn define(
    path: &Path,
    entity_type: &str,
    columns: &[String],
    fillable: Vec<String>,
) -> Result<()> {
    let columns = columns
        .iter()
        .map(|raw| parse_column(raw))
        .collect::<Result<Vec<_>>>()?;
    if let Some(unknown) = fillable
        .iter()
        .find(|name| !columns.iter().any(|column| &column.name == *name))
    {
        bail!("Fillable attribute '{}' is not a column", unknown);
    }

    let table = EntityTable::new(entity_type, columns, Arc::new(SystemClock)).fillable(fillable);
    EntityRegistry::define_in(path, table)
        .await
        .with_context(|| format!("Failed to write '{}'", path.display()))?;

    println!("Defined entity type: {}", entity_type);
    Ok(())
}

async fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Define {
            entity_type,
            columns,
            fillable,
        } => define(&app.entities_path, &entity_type, &columns, fillable).await?,
        Command::Insert {
            entity_type,
            values,
        } => {
            let values = parse_assignments(&values)?;
            let snapshot = app.lock_entities().await?;
            let id = app.registry.table(&entity_type)?.insert(values).await?;
            app.save_entities(snapshot).await?;
            println!("{}", id);
        }
        Command::Show { entity_type, id } => {
            let row = app
                .registry
                .table(&entity_type)?
                .get(&id)
                .await
                .ok_or_else(|| anyhow!("Entity {}:{} not found", entity_type, id))?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Command::Delete { entity_type, id } => {
            let snapshot = app.lock_entities().await?;
            let deleted = app.registry.table(&entity_type)?.delete(&id).await;
            if !deleted {
                bail!("Entity {}:{} not found", entity_type, id);
            }
            app.save_entities(snapshot).await?;
            let parent = ParentRef::new(entity_type, id);
            if app.service.forget(&parent).await?.is_some() {
                println!("Deleted {} and its pending mutation", parent);
            } else {
                println!("Deleted {}", parent);
            }
        }
        Command::Schedule {
            entity_type,
            id,
            values,
            delay_for,
            keep_for,
            start_from,
            revert_at,
        } => {
            let parent = ParentRef::new(entity_type, id);
            let mut entity = app
                .registry
                .resolve(&parent)
                .await?
                .ok_or_else(|| anyhow!("Entity {} not found", parent))?;

            let mut postponer = app.service.postpone(entity.as_mut());
            if let Some(raw) = delay_for {
                postponer = postponer.delay_for(parse_duration(&raw)?)?;
            }
            if let Some(raw) = keep_for {
                postponer = postponer.keep_for(parse_duration(&raw)?)?;
            }
            if let Some(raw) = start_from {
                postponer = postponer.start_from_str(&raw)?;
            }
            if let Some(raw) = revert_at {
                postponer = postponer.revert_at_str(&raw)?;
            }

            match postponer.update(parse_assignments(&values)?).await? {
                UpdateOutcome::Scheduled(mutation) => {
                    println!("{}", serde_json::to_string_pretty(&mutation)?);
                }
                UpdateOutcome::NoChange => println!("Nothing to change for {}", parent),
            }
        }
        Command::Check => {
            let reconciler = app.service.reconciler(app.registry.clone());
            match reconciler.run_pass().await? {
                PassStatus::Completed => println!("Pending updates checked"),
                PassStatus::AlreadyRunning => println!("A pass is already running"),
            }
        }
        Command::Watch { interval_secs } => {
            let reconciler = Arc::new(app.service.reconciler(app.registry.clone()));
            let worker =
                spawn_reconcile_worker(reconciler, StdDuration::from_secs(interval_secs))?;
            println!("Watching pending updates every {}s, Ctrl-C to stop", interval_secs);
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            let passes = worker.completed_passes();
            worker.stop().await?;
            println!("Stopped after {} passes", passes);
        }
        Command::List => {
            for mutation in app.service.store().list().await? {
                println!("{}", serde_json::to_string(&mutation)?);
            }
        }
        Command::Has { entity_type, id } => {
            let parent = ParentRef::new(entity_type, id);
            println!("{}", app.service.has_pending_mutation(&parent).await?);
        }
    }
    Ok(())
}

fn parse_column(raw: &str) -> Result<Column> {
    let (name, ty) = raw
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid column '{}'. Expected format: name:type", raw))?;
    let (ty, not_null) = match ty.trim().strip_suffix('!') {
        Some(ty) => (ty, true),
        None => (ty.trim(), false),
    };
    let data_type = match ty.to_ascii_lowercase().as_str() {
        "integer" | "int" => DataType::Integer,
        "float" => DataType::Float,
        "text" => DataType::Text,
        "boolean" | "bool" => DataType::Boolean,
        other => bail!("Unknown column type '{}'", other),
    };

    let column = Column::new(name.trim(), data_type);
    Ok(if not_null { column.not_null() } else { column })
}

fn parse_assignments(raw: &[String]) -> Result<AttributeMap> {
    raw.iter()
        .map(|assignment| {
            let (key, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow!("Invalid assignment '{}'. Expected key=value", assignment))?;
            Ok((key.trim().to_string(), parse_value(value)))
        })
        .collect()
}

/// JSON scalars keep their type, anything else is text.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::Text(raw.to_string()))
}

fn parse_duration(raw: &str) -> Result<chrono::Duration> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '-')
        .ok_or_else(|| anyhow!("Duration '{}' needs a unit (s, m, h, d)", raw))?;
    let (count, unit) = raw.split_at(split);
    let count: i64 = count
        .parse()
        .with_context(|| format!("Invalid duration '{}'", raw))?;

    let duration = match unit {
        "s" => chrono::Duration::try_seconds(count),
        "m" => chrono::Duration::try_minutes(count),
        "h" => chrono::Duration::try_hours(count),
        "d" => chrono::Duration::try_days(count),
        other => bail!("Unknown duration unit '{}'", other),
    };
    duration.ok_or_else(|| anyhow!("Duration '{}' is out of range", raw))
}
