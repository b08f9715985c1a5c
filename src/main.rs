mod logging;

use agrisync::cache::{CacheProxy, CacheStorage, NoopStorage, StoreStorage};
use agrisync::clock::{self, Clock, SystemClock};
use agrisync::config::{self, Config};
use agrisync::connectivity::Connectivity;
use agrisync::http::{build_client, HttpFetcher};
use agrisync::knowledge::KnowledgeCache;
use agrisync::settings;
use agrisync::store::{Store, SCHEMA_VERSION};
use agrisync::sync::{
  Attachment, ChatMessage, HttpMessageSender, Scheduler, SyncEvent, SyncOutcome, SyncQueue,
};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "agrisync")]
#[command(about = "Offline-first message queue and cache for the AgriBot chat server")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/agrisync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Do not contact the server; queue and read from cache only
  #[arg(long, global = true)]
  offline: bool,

  /// Also log to stderr
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a chat message and deliver it if the server is reachable
  Send {
    message: String,
    /// Image to attach (png, jpg, jpeg, gif or webp, at most 10 MiB)
    #[arg(long)]
    image: Option<PathBuf>,
  },
  /// Deliver queued messages now
  Sync,
  /// Show queue depth, failed messages and cache state
  Status,
  /// Give failed messages a fresh retry budget
  RetryFailed,
  /// Drop a queued or failed message
  Discard { id: i64 },
  /// Read reference data
  Knowledge {
    #[command(subcommand)]
    command: KnowledgeCommand,
  },
  /// GET a server path through the cache proxy
  Fetch {
    path: String,
    /// Treat the request as a page navigation (offline page on failure)
    #[arg(long)]
    navigate: bool,
  },
  /// Stay running: probe connectivity and sync in the background
  Run,
}

#[derive(Subcommand, Debug)]
enum KnowledgeCommand {
  /// Print a category payload
  Get { category: String },
  /// Search cached payloads
  Search {
    query: String,
    /// Restrict to a category (repeatable)
    #[arg(short, long)]
    category: Vec<String>,
    #[arg(short, long, default_value_t = 20)]
    limit: usize,
  },
  /// Refetch every category
  Refresh {
    /// Only refresh when the cache version changed or the last refresh is stale
    #[arg(long)]
    if_due: bool,
  },
}

/// Shared handles for one invocation.
struct Engine {
  config: Config,
  store: Arc<Store>,
  client: reqwest::Client,
  base_url: Url,
  connectivity: Connectivity,
  clock: Arc<dyn Clock>,
}

impl Engine {
  async fn open(config: Config, offline: bool) -> Result<Self> {
    let path = config.storage.resolve_path()?;
    let store = Store::open_or_degrade(&path, SCHEMA_VERSION)?;
    if !store.is_durable() {
      eprintln!("warning: could not open {}; changes will not persist", path.display());
    }

    let client = build_client(config.server.request_timeout())?;
    let base_url = Url::parse(&config.server.url)
      .map_err(|e| eyre!("Invalid server url '{}': {}", config.server.url, e))?;

    let connectivity = Connectivity::new(false);
    if !offline {
      let health = base_url
        .join(&config.connectivity.health_path)
        .map_err(|e| eyre!("Invalid health path: {}", e))?;
      connectivity.check(&client, &health).await;
    }

    Ok(Self {
      config,
      store: Arc::new(store),
      client,
      base_url,
      connectivity,
      clock: Arc::new(SystemClock),
    })
  }

  fn queue(&self) -> SyncQueue<HttpMessageSender> {
    SyncQueue::new(
      Arc::clone(&self.store),
      HttpMessageSender::new(self.client.clone(), self.base_url.clone()),
      self.connectivity.clone(),
      Arc::clone(&self.clock),
      self.config.sync.clone(),
    )
  }

  fn knowledge(&self) -> KnowledgeCache<HttpFetcher> {
    KnowledgeCache::new(
      HttpFetcher::new(self.client.clone()),
      Arc::clone(&self.store),
      self.connectivity.clone(),
      Arc::clone(&self.clock),
      self.base_url.clone(),
      self.config.knowledge.clone(),
    )
  }

  fn proxy(&self) -> CacheProxy<HttpFetcher, Box<dyn CacheStorage>> {
    let storage: Box<dyn CacheStorage> = if self.config.cache.enabled {
      Box::new(StoreStorage::new(Arc::clone(&self.store)))
    } else {
      Box::new(NoopStorage)
    };
    CacheProxy::new(
      HttpFetcher::new(self.client.clone()),
      storage,
      &self.config.cache,
      self.base_url.clone(),
      Arc::clone(&self.clock),
    )
  }

  fn chat_message(&self, message: String) -> ChatMessage {
    ChatMessage {
      message,
      user_name: self.config.server.user_name.clone(),
      user_region: self.config.server.user_region.clone(),
      language: self.config.server.language.clone(),
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&config::data_dir()?.join("logs"), args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let engine = Engine::open(config, args.offline).await?;
  tracing::info!(
    command = ?args.command,
    online = engine.connectivity.is_online(),
    durable = engine.store.is_durable(),
    "Starting"
  );

  match args.command {
    Command::Send { message, image } => send(&engine, message, image).await,
    Command::Sync => sync(&engine).await,
    Command::Status => status(&engine),
    Command::RetryFailed => retry_failed(&engine).await,
    Command::Discard { id } => discard(&engine, id),
    Command::Knowledge { command } => knowledge(&engine, command).await,
    Command::Fetch { path, navigate } => fetch(&engine, &path, navigate).await,
    Command::Run => run(&engine).await,
  }
}

async fn send(engine: &Engine, message: String, image: Option<PathBuf>) -> Result<()> {
  let attachment = match image {
    Some(path) => Some(Attachment::from_path(&path).await?),
    None => None,
  };

  let queue = engine.queue();
  let mut events = queue.subscribe();
  let id = queue
    .enqueue(engine.chat_message(message), attachment)
    .await?;
  println!("Queued message {}", id);

  if !engine.connectivity.is_online() {
    println!("Offline: it will be sent once the server is reachable");
    return Ok(());
  }

  finish_sweep(&queue, &mut events).await?;
  let still_queued = queue
    .pending_actions()?
    .iter()
    .chain(queue.failed_actions()?.iter())
    .any(|action| action.id == Some(id));
  if still_queued {
    println!("Message {} could not be delivered yet; see `agrisync status`", id);
  } else {
    println!("Message {} delivered", id);
  }
  Ok(())
}

/// Run a sweep, or wait for the one already in progress to finish.
async fn finish_sweep(
  queue: &SyncQueue<HttpMessageSender>,
  events: &mut broadcast::Receiver<SyncEvent>,
) -> Result<()> {
  if queue.sync().await? != SyncOutcome::AlreadyRunning {
    return Ok(());
  }
  if !queue.is_syncing() {
    // Held by another process; its events never reach this one.
    println!("Another agrisync process is syncing; queued messages go out with it");
    return Ok(());
  }

  loop {
    match events.recv().await {
      Ok(SyncEvent::SyncCompleted { .. }) => return Ok(()),
      Ok(SyncEvent::SyncFailed { error }) => return Err(eyre!("Sync failed: {}", error)),
      Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
      Err(broadcast::error::RecvError::Closed) => return Ok(()),
    }
  }
}

async fn sync(engine: &Engine) -> Result<()> {
  match engine.queue().sync().await? {
    SyncOutcome::Completed(summary) => println!(
      "Sent {}, failed {}, {} still pending",
      summary.sent, summary.failed, summary.remaining
    ),
    SyncOutcome::AlreadyRunning => println!("A sync is already in progress"),
    SyncOutcome::Offline => println!("Offline: nothing sent"),
  }
  Ok(())
}

fn status(engine: &Engine) -> Result<()> {
  let queue = engine.queue();
  let stats = queue.stats()?;

  println!(
    "Server:     {} ({})",
    engine.base_url,
    if engine.connectivity.is_online() { "online" } else { "offline" }
  );
  match engine.store.path() {
    Some(path) if engine.store.is_durable() => {
      println!("Store:      {} (schema v{})", path.display(), engine.store.schema_version())
    }
    _ => println!("Store:      in memory only"),
  }
  println!("Pending:    {}", stats.pending);
  println!("Failed:     {}", stats.failed);

  if let Some(last_run) = queue.last_run()? {
    let at = clock::from_millis(last_run.finished_at).unwrap_or_default();
    println!(
      "Last sync:  {} (sent {}, failed {})",
      at.format("%Y-%m-%d %H:%M:%S UTC"),
      last_run.sent,
      last_run.failed
    );
  }

  for action in queue.failed_actions()? {
    println!(
      "  #{} {:?} after {} attempts: {}",
      action.id.unwrap_or_default(),
      action.content.message,
      action.retry_count,
      action.last_error.as_deref().unwrap_or("unknown error")
    );
  }

  let knowledge = engine.knowledge();
  let cached = knowledge.cached_categories()?;
  println!("Knowledge:  {} of {} categories cached", cached.len(), knowledge.categories().len());
  for category in cached {
    println!(
      "  {:<18} {}{}",
      category.category,
      category.last_updated.format("%Y-%m-%d %H:%M"),
      if category.expired { " (expired)" } else { "" }
    );
  }
  Ok(())
}

async fn retry_failed(engine: &Engine) -> Result<()> {
  let queue = engine.queue();
  let mut events = queue.subscribe();
  let report = queue.retry_failed_actions().await?;
  println!("Reset {} failed messages", report.reset);
  if report.rejected > 0 {
    println!("{} kept failed: attachment no longer valid", report.rejected);
  }

  if report.reset > 0 && engine.connectivity.is_online() {
    finish_sweep(&queue, &mut events).await?;
    let stats = queue.stats()?;
    println!("{} pending, {} failed", stats.pending, stats.failed);
  }
  Ok(())
}

fn discard(engine: &Engine, id: i64) -> Result<()> {
  if engine.queue().delete_action(id)? {
    println!("Discarded message {}", id);
    Ok(())
  } else {
    Err(eyre!("No queued message with id {}", id))
  }
}

async fn knowledge(engine: &Engine, command: KnowledgeCommand) -> Result<()> {
  let knowledge = engine.knowledge();
  match command {
    KnowledgeCommand::Get { category } => match knowledge.get(&category).await? {
      Some(result) => {
        if result.from_cache {
          eprintln!(
            "(cached {})",
            result.last_updated.format("%Y-%m-%d %H:%M UTC")
          );
        }
        println!("{}", serde_json::to_string_pretty(&result.payload)?);
      }
      None => return Err(eyre!("No data for {} (offline and not cached)", category)),
    },
    KnowledgeCommand::Search {
      query,
      category,
      limit,
    } => {
      let categories = (!category.is_empty()).then_some(category.as_slice());
      let hits = knowledge.search(&query, categories, Some(limit));
      if hits.is_empty() {
        println!("No matches");
      }
      for hit in hits {
        println!("[{}] {}{} ({})", hit.score, hit.category, hit.pointer, hit.text);
      }
    }
    KnowledgeCommand::Refresh { if_due } => {
      let report = if if_due {
        knowledge.refresh_if_due().await?
      } else if engine.connectivity.is_online() {
        Some(knowledge.refresh_cache().await?)
      } else {
        return Err(eyre!("Server unreachable, cannot refresh"));
      };
      match report {
        Some(report) => {
          println!("Refreshed: {}", report.refreshed.join(", "));
          if !report.failed.is_empty() {
            println!("Failed:    {}", report.failed.join(", "));
          }
        }
        None => println!("Knowledge cache is up to date"),
      }
    }
  }
  Ok(())
}

async fn fetch(engine: &Engine, path: &str, navigate: bool) -> Result<()> {
  let proxy = engine.proxy();
  proxy.activate();
  let response = if navigate {
    proxy.navigate(path).await?
  } else {
    proxy.get(path).await?
  };

  eprintln!(
    "{} {:?} {}",
    response.status,
    response.source,
    response.content_type.as_deref().unwrap_or("-")
  );
  println!("{}", response.text());
  Ok(())
}

async fn run(engine: &Engine) -> Result<()> {
  let now = engine.clock.now_millis();
  match settings::purge_expired_metadata(&engine.store, now) {
    Ok(0) => {}
    Ok(purged) => tracing::info!(purged, "Purged expired cache metadata"),
    Err(e) => tracing::warn!(error = %e, "Failed to purge cache metadata"),
  }

  let proxy = engine.proxy();
  proxy.activate();
  let knowledge = Arc::new(engine.knowledge());
  if engine.connectivity.is_online() {
    proxy.precache(&engine.config.cache.precache).await;
    if let Err(e) = knowledge.initialize_cache().await {
      tracing::warn!(error = %e, "Knowledge cache initialization failed");
    }
  }

  let queue = engine.queue();
  let mut events = queue.subscribe();
  let probe = engine.connectivity.spawn_probe(
    engine.client.clone(),
    engine
      .base_url
      .join(&engine.config.connectivity.health_path)
      .map_err(|e| eyre!("Invalid health path: {}", e))?,
    engine.config.connectivity.probe_interval(),
  );
  let scheduler = Scheduler::new(
    queue.clone(),
    engine.connectivity.clone(),
    engine.config.sync.interval(),
  )
  .with_knowledge(knowledge)
  .spawn();

  if let Err(e) = queue.sync().await {
    tracing::warn!(error = %e, "Initial sync failed");
  }

  // One JSON line per event for whatever is watching stdout.
  let printer = tokio::spawn(async move {
    loop {
      match events.recv().await {
        Ok(event) => match serde_json::to_string(&event) {
          Ok(line) => println!("{}", line),
          Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
        },
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          tracing::warn!(missed, "Event printer lagged")
        }
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });

  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
  tracing::info!("Shutting down");

  scheduler.abort();
  probe.abort();
  printer.abort();
  Ok(())
}
