use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use pm_mirror::config::Config;
use pm_mirror::logging;
use pm_mirror::resource::ResourceType;
use pm_mirror::sync::{
  Reconciler, SnapshotSource, SqliteMetadataStore, SyncCoordinator, SyncMetadata,
};
use pm_mirror::webhook::{DeliveryResponse, WebhookDelivery, WebhookIngest};
use pm_mirror::ResourceCache;

#[derive(Parser, Debug)]
#[command(name = "pm-mirror")]
#[command(about = "Mirror project-management resources into a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pm-mirror/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Directory for log files (default: platform data dir)
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run one reconciliation pass
  Sync {
    /// Deadline in seconds (default: sync.initial_timeout_secs)
    #[arg(long)]
    timeout: Option<u64>,
  },
  /// Refetch every resource of one type
  Resync {
    /// projects, milestones, issues or sprints
    resource_type: ResourceType,
    /// Re-apply resources whose version is already mirrored
    #[arg(long)]
    force: bool,
  },
  /// Show recorded sync metadata
  Status {
    #[arg(long = "type")]
    resource_type: Option<ResourceType>,
  },
  /// Process one webhook delivery
  Webhook {
    /// Declared event kind (issues, milestone, projects_v2_item, ...)
    #[arg(long)]
    event: String,
    #[arg(long)]
    delivery: String,
    /// sha256=<hex> signature over the payload
    #[arg(long)]
    signature: Option<String>,
    /// Payload file (default: stdin)
    #[arg(long)]
    payload: Option<PathBuf>,
  },
  /// Reconcile on a schedule until interrupted
  Watch,
}

#[derive(Serialize)]
struct StatusRow {
  #[serde(flatten)]
  metadata: SyncMetadata,
  stale: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;

  let log_dir = match args.log_dir {
    Some(dir) => dir,
    None => logging::default_log_dir()?,
  };
  let _guard = logging::init(&log_dir)?;

  let coordinator = Arc::new(build_coordinator(&config)?);

  match args.command {
    Command::Sync { timeout } => {
      let timeout = timeout
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.initial_timeout());
      let report = coordinator.perform_initial_sync(timeout).await?;
      print_json(&report)?;
    }
    Command::Resync {
      resource_type,
      force,
    } => {
      let report = coordinator.sync_resource_type(resource_type, force).await?;
      print_json(&report)?;
    }
    Command::Status { resource_type } => {
      let rows: Vec<StatusRow> = coordinator
        .get_all_metadata()?
        .into_iter()
        .filter(|m| resource_type.map_or(true, |t| m.resource_type == t))
        .map(|metadata| StatusRow {
          stale: coordinator.needs_sync(Some(&metadata)),
          metadata,
        })
        .collect();
      print_json(&rows)?;
    }
    Command::Webhook {
      event,
      delivery,
      signature,
      payload,
    } => {
      let body = read_payload(payload.as_deref())?;
      let ingest = WebhookIngest::new(Config::webhook_secret(), config.webhook.allow_unsigned);
      let delivery = WebhookDelivery {
        event_kind: event,
        delivery_id: delivery,
        signature,
        body,
      };
      let response = ingest.handle_delivery(&delivery, &coordinator).await;
      print_json(&response)?;
      if let DeliveryResponse::Rejected { reason } = response {
        return Err(eyre!("Delivery rejected: {}", reason));
      }
    }
    Command::Watch => watch(coordinator, &config).await?,
  }

  Ok(())
}

fn build_coordinator(config: &Config) -> Result<SyncCoordinator> {
  let cache = Arc::new(ResourceCache::new(config.default_ttl()));
  let metadata = SqliteMetadataStore::open(&config.metadata_path()?)
    .map_err(|e| eyre!("Failed to open metadata store: {}", e))?;
  let source = SnapshotSource::new(config.source.snapshot_path.clone());

  Ok(
    SyncCoordinator::new(cache, Arc::new(metadata), Arc::new(source))
      .with_stale_after(config.stale_after())
      .with_concurrency(config.sync.concurrency),
  )
}

/// Print applied changes until Ctrl-C, reconciling in the background.
async fn watch(coordinator: Arc<SyncCoordinator>, config: &Config) -> Result<()> {
  let mut events = coordinator.subscribe();
  let reconciler = Reconciler::start(Arc::clone(&coordinator), config.reconcile_schedule());
  info!("watching, press Ctrl-C to stop");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      received = events.recv() => match received {
        Ok(event) => println!("{}", serde_json::to_string(&event)?),
        Err(RecvError::Lagged(missed)) => eprintln!("missed {} events", missed),
        Err(RecvError::Closed) => break,
      },
    }
  }

  reconciler
    .stop()
    .await
    .map_err(|e| eyre!("Failed to stop reconciler: {}", e))?;
  print_json(&coordinator.cache().stats())
}

fn read_payload(path: Option<&std::path::Path>) -> Result<Vec<u8>> {
  match path {
    Some(path) => std::fs::read(path)
      .map_err(|e| eyre!("Failed to read payload {}: {}", path.display(), e)),
    None => {
      let mut body = Vec::new();
      std::io::stdin()
        .read_to_end(&mut body)
        .map_err(|e| eyre!("Failed to read payload from stdin: {}", e))?;
      Ok(body)
    }
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let json = serde_json::to_string_pretty(value)
    .map_err(|e| eyre!("Failed to serialize output: {}", e))?;
  println!("{}", json);
  Ok(())
}
