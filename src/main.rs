use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use hearth::clock::SystemClock;
use hearth::connectivity::{ConnectivityMonitor, HttpProbe, ReachabilityProvider};
use hearth::sync::{FlushResult, SyncEvent};
use hearth::transport::HttpTransport;
use hearth::{Config, Method, OfflineClient, Payload};

#[derive(Parser, Debug)]
#[command(name = "hearth")]
#[command(about = "Offline-first client for the household coordination API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hearth/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read an endpoint, falling back to the local cache
  Get {
    endpoint: String,
    /// Query parameters as a JSON object
    #[arg(short, long)]
    query: Option<String>,
  },
  /// Create a resource (queued when offline)
  Post { endpoint: String, data: String },
  /// Replace a resource (queued when offline)
  Put { endpoint: String, data: String },
  /// Update part of a resource (queued when offline)
  Patch { endpoint: String, data: String },
  /// Delete a resource (queued when offline)
  Delete { endpoint: String },
  /// Replay queued mutations now
  Sync,
  /// Show cache and queue sizes
  Stats,
  /// Drop cached responses
  ClearCache {
    /// Only entries under this endpoint prefix
    prefix: Option<String>,
  },
  /// Discard every queued mutation
  PurgeQueue,
  /// Stay running: probe connectivity and replay the queue on reconnect
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = setup_logging();

  let config = Config::load(args.config.as_deref())?;

  let probe: Arc<dyn ReachabilityProvider> = Arc::new(HttpProbe::new(
    Arc::new(HttpTransport::new(&config)?),
    config.connectivity.probe_endpoint.clone(),
    config.request_timeout(),
  ));
  let monitor = ConnectivityMonitor::new(
    probe.check().await,
    Duration::from_millis(config.connectivity.debounce_ms),
    Arc::new(SystemClock),
  );
  info!(online = monitor.is_online(), "starting");

  let client = OfflineClient::from_config(&config, monitor.clone())?;

  match args.command {
    Command::Get { endpoint, query } => {
      let query = query.as_deref().map(parse_payload).transpose()?;
      print_json(&client.request(Method::Get, &endpoint, query).await?)?;
    }
    Command::Post { endpoint, data } => mutate(&client, Method::Post, &endpoint, Some(&data)).await?,
    Command::Put { endpoint, data } => mutate(&client, Method::Put, &endpoint, Some(&data)).await?,
    Command::Patch { endpoint, data } => {
      mutate(&client, Method::Patch, &endpoint, Some(&data)).await?
    }
    Command::Delete { endpoint } => mutate(&client, Method::Delete, &endpoint, None).await?,
    Command::Sync => {
      let mut events = client.subscribe_events();
      let result = client.sync_queued_operations().await;
      while let Ok(event) = events.try_recv() {
        print_event(&event);
      }
      match result {
        FlushResult::Completed(report) => println!(
          "replayed {}, rejected {}, {:?}",
          report.replayed, report.rejected, report.outcome
        ),
        FlushResult::Coalesced => println!("sync already in progress"),
        FlushResult::Offline => println!("offline; nothing sent"),
      }
    }
    Command::Stats => print_json(&client.cache_stats()?)?,
    Command::ClearCache { prefix } => {
      let removed = client.clear_cache(prefix.as_deref())?;
      println!("removed {} cached responses", removed);
    }
    Command::PurgeQueue => {
      let purged = client.purge_outbox()?;
      println!("discarded {} queued mutations", purged);
    }
    Command::Watch => watch(&client, &monitor, probe, &config).await?,
  }

  Ok(())
}

async fn mutate(client: &OfflineClient, method: Method, endpoint: &str, data: Option<&str>) -> Result<()> {
  let payload = data.map(parse_payload).transpose()?;
  let outcome = client.request(method, endpoint, payload).await?;
  if outcome.is_queued() {
    eprintln!("queued; pending confirmation from the server");
  }
  print_json(&outcome)
}

async fn watch(
  client: &OfflineClient,
  monitor: &ConnectivityMonitor,
  probe: Arc<dyn ReachabilityProvider>,
  config: &Config,
) -> Result<()> {
  let mut events = client.subscribe_events();
  let mut connectivity = monitor.watch();
  let poller = monitor.spawn_polling(
    probe,
    Duration::from_secs(config.connectivity.probe_interval_secs),
  );
  client.init();

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      Ok(()) = connectivity.changed() => {
        let state = *connectivity.borrow_and_update();
        println!("{}", if state.is_online { "online" } else { "offline" });
      }
      Ok(event) = events.recv() => print_event(&event),
    }
  }

  client.teardown();
  poller.abort();
  Ok(())
}

fn parse_payload(data: &str) -> Result<Payload> {
  let value: serde_json::Value =
    serde_json::from_str(data).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
  Ok(Payload::from_value(value)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

fn print_event(event: &SyncEvent) {
  match event {
    SyncEvent::Replayed { id, status } => println!("{} confirmed (HTTP {})", id, status),
    SyncEvent::Deferred(transient) => println!("{}", transient),
    SyncEvent::Rejected(rejection) => println!("{}", rejection),
  }
}

/// Log to a daily file in the data directory, or stderr if that is unavailable.
fn setup_logging() -> Option<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hearth=info"));

  match Config::data_dir().and_then(|dir| ensure_dir(&dir)) {
    Ok(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "hearth.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    Err(_) => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

fn ensure_dir(dir: &Path) -> Result<PathBuf> {
  std::fs::create_dir_all(dir)?;
  Ok(dir.to_path_buf())
}
