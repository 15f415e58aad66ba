use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use quarry_core::{Event, EventMessage};
use quarry_query::CollectionService;
use quarry_store::{MemCollections, MemStore};
use quarry_subs::{ChannelSender, SearchRequest, Service, StaticSpaces, SubsConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

mod fixture;

use fixture::{Fixture, Script, Step};

#[derive(Parser, Debug)]
#[command(name = "quarryctl", version, about = "Quarry CLI: live queries over a fixture")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug)]
struct EngineArgs {
    /// Upstream coalescing window in milliseconds
    #[arg(long = "batch-ms", env = "QUARRY_BATCH_MS", global = true, default_value_t = 250)]
    batch_ms: u64,
    /// Pending ids before the batcher flushes early
    #[arg(long = "batch-cap", env = "QUARRY_BATCH_CAP", global = true, default_value_t = 4096)]
    batch_cap: usize,
    /// Records buffered ahead of the batcher
    #[arg(long = "feed-cap", env = "QUARRY_FEED_CAP", global = true, default_value_t = 65536)]
    feed_cap: usize,
    /// Capacity of internal output queues
    #[arg(long = "queue-cap", env = "QUARRY_QUEUE_CAP", global = true, default_value_t = 1024)]
    queue_cap: usize,
    /// Time zone offset for date quick options
    #[arg(long = "tz-offset-secs", env = "QUARRY_TZ_OFFSET_SECS", global = true, default_value_t = 0, allow_negative_numbers = true)]
    tz_offset_secs: i32,
}

impl EngineArgs {
    fn config(&self) -> SubsConfig {
        SubsConfig {
            batch_window: Duration::from_millis(self.batch_ms),
            batch_cap: self.batch_cap.max(1),
            feed_cap: self.feed_cap.max(1),
            queue_cap: self.queue_cap.max(1),
            tz_offset_secs: self.tz_offset_secs,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one search over a fixture and print the window
    Search {
        /// Fixture file (YAML or JSON)
        fixture: PathBuf,
        /// Search request file (YAML or JSON)
        request: PathBuf,
    },
    /// Subscribe, replay a script of mutations and print the resulting events
    Replay {
        fixture: PathBuf,
        /// Script file with subscriptions and steps
        script: PathBuf,
    },
    /// Subscribe, then apply JSON steps read line by line from stdin
    Watch {
        fixture: PathBuf,
        /// Script file with subscriptions (its steps run first)
        script: PathBuf,
    },
}

const DEFAULT_LOG: &str = "quarryctl=info,quarry_subs=info,quarry_store=warn,quarry_query=warn,warn";

/// Logs go to stderr so `--output json` keeps stdout machine-readable.
fn init_tracing() {
    let filter = match std::env::var("QUARRY_LOG") {
        Ok(spec) => tracing_subscriber::EnvFilter::from_str(&spec).unwrap_or_else(|e| {
            eprintln!("quarryctl: ignoring QUARRY_LOG ({e})");
            tracing_subscriber::EnvFilter::new(DEFAULT_LOG)
        }),
        Err(_) => tracing_subscriber::EnvFilter::new(DEFAULT_LOG),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

/// Exposes the engine counters (`subs_*`, `store_*`) when `QUARRY_METRICS_ADDR` is set.
fn init_metrics() {
    let Ok(addr) = std::env::var("QUARRY_METRICS_ADDR") else { return };
    let sock = match addr.parse::<std::net::SocketAddr>() {
        Ok(sock) => sock,
        Err(_) => {
            warn!(addr = %addr, "metrics: QUARRY_METRICS_ADDR is not host:port; exporter disabled");
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(addr = %sock, "metrics: serving engine counters"),
        Err(e) => warn!(error = %e, "metrics: exporter not installed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = cli.engine.config();
    match cli.command {
        Commands::Search { fixture: path, request } => {
            let fixture: Fixture = fixture::load(&path)?;
            let req: SearchRequest = fixture::load(&request)?;
            run_search(cli.output, config, fixture, req).await
        }
        Commands::Replay { fixture: path, script: script_path } => {
            let fixture: Fixture = fixture::load(&path)?;
            let script: Script = fixture::load(&script_path)?;
            run_session(cli.output, config, fixture, script, false).await
        }
        Commands::Watch { fixture: path, script: script_path } => {
            let fixture: Fixture = fixture::load(&path)?;
            let script: Script = fixture::load(&script_path)?;
            run_session(cli.output, config, fixture, script, true).await
        }
    }
}

struct Session {
    service: Service,
    store: Arc<MemStore>,
    collections: Arc<MemCollections>,
    space_id: String,
}

fn open(fixture: &Fixture, config: SubsConfig) -> (Session, mpsc::Receiver<Event>) {
    let (store, collections) = fixture.populate();
    let space_id = fixture.space_id().to_string();
    let spaces = StaticSpaces::new().with_space(&space_id, store.clone(), Some(collections.clone() as Arc<dyn CollectionService>));
    let (sender, events) = ChannelSender::new(config.queue_cap);
    let service = Service::new(Arc::new(spaces), Arc::new(sender), config);
    (Session { service, store, collections, space_id }, events)
}

async fn run_search(output: Output, config: SubsConfig, fixture: Fixture, mut req: SearchRequest) -> Result<()> {
    let (session, _events) = open(&fixture, config);
    if req.space_id.is_empty() {
        req.space_id = session.space_id.clone();
    }
    let resp = session.service.search(req).await.context("search")?;
    match output {
        Output::Json => {
            let doc = serde_json::json!({
                "subId": resp.sub_id,
                "records": resp.records.iter().map(|d| &**d).collect::<Vec<_>>(),
                "dependencies": resp.dependencies.iter().map(|d| &**d).collect::<Vec<_>>(),
                "counters": resp.counters,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Output::Human => {
            for d in &resp.records {
                println!("{}\t{}", d.id(), serde_json::to_string(&**d)?);
            }
            if !resp.dependencies.is_empty() {
                println!("-- dependencies");
                for d in &resp.dependencies {
                    println!("{}\t{}", d.id(), serde_json::to_string(&**d)?);
                }
            }
            println!("-- total {} prev {} next {}", resp.counters.total, resp.counters.prev_count, resp.counters.next_count);
        }
    }
    session.service.close().await;
    Ok(())
}

async fn run_session(output: Output, config: SubsConfig, fixture: Fixture, script: Script, follow_stdin: bool) -> Result<()> {
    let settle = config.batch_window + Duration::from_millis(50);
    let (session, events) = open(&fixture, config);
    let mut printers = vec![spawn_printer(output, events)];
    printers.extend(subscribe(&session, output, &script).await?);

    for step in &script.steps {
        apply_step(&session, step, settle).await?;
    }

    if follow_stdin {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = signal::ctrl_c() => {
                    info!("interrupt received; closing");
                    break;
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("reading stdin")? else { break };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Step>(line) {
                        Ok(step) => {
                            if let Err(e) = apply_step(&session, &step, settle).await {
                                warn!(error = %e, "watch: step failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "watch: invalid step"),
                    }
                }
            }
        }
    }

    tokio::time::sleep(settle).await;
    session.service.close().await;
    drop(session);
    for printer in printers {
        if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
            warn!("printer did not finish after close");
        }
    }
    Ok(())
}

async fn subscribe(session: &Session, output: Output, script: &Script) -> Result<Vec<JoinHandle<()>>> {
    let mut printers = Vec::new();
    for req in &script.search {
        let mut req = req.clone();
        if req.space_id.is_empty() {
            req.space_id = session.space_id.clone();
        }
        let mut resp = session.service.search(req).await.context("search")?;
        info!(sub_id = %resp.sub_id, records = resp.records.len(), total = resp.counters.total, "replay: subscribed");
        if let Some(queue) = resp.output.take() {
            printers.push(spawn_queue_printer(output, resp.sub_id.clone(), queue));
        }
    }
    for req in &script.ids {
        let mut req = req.clone();
        if req.space_id.is_empty() {
            req.space_id = session.space_id.clone();
        }
        let resp = session.service.subscribe_ids(req).await.context("subscribe ids")?;
        info!(sub_id = %resp.sub_id, records = resp.records.len(), "replay: subscribed ids");
    }
    for req in &script.groups {
        let mut req = req.clone();
        if req.space_id.is_empty() {
            req.space_id = session.space_id.clone();
        }
        let resp = session.service.subscribe_groups(req).await.context("subscribe groups")?;
        let ids: Vec<&str> = resp.groups.iter().map(|g| g.id.as_str()).collect();
        info!(sub_id = %resp.sub_id, groups = ?ids, "replay: subscribed groups");
    }
    Ok(printers)
}

async fn apply_step(session: &Session, step: &Step, settle: Duration) -> Result<()> {
    if matches!(step, Step::Flush) {
        tokio::time::sleep(settle).await;
        return Ok(());
    }
    step.apply(&session.store, &session.collections)
}

fn spawn_printer(output: Output, mut events: mpsc::Receiver<Event>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            for msg in &ev.messages {
                print_message(output, &ev.space_id, msg);
            }
        }
    })
}

fn spawn_queue_printer(output: Output, sub_id: String, mut queue: mpsc::Receiver<EventMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let label = format!("queue:{}", sub_id);
        while let Some(msg) = queue.recv().await {
            print_message(output, &label, &msg);
        }
    })
}

fn print_message(output: Output, source: &str, msg: &EventMessage) {
    let body = match serde_json::to_string(msg) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to encode event");
            return;
        }
    };
    match output {
        Output::Json => println!("{}", body),
        Output::Human => println!("[{}] {:<24} {}", source, msg.kind(), body),
    }
}
