use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use geo_upload::artifact::Artifact;
use geo_upload::artifact_store::ArtifactStore;
use geo_upload::clock::TokioClock;
use geo_upload::config::AppConfig;
use geo_upload::counter::CounterStore;
use geo_upload::engine::{
    DrainOutcome, EnqueueOutcome, Engine, EngineParts, EngineSettings, EngineState, Snapshot,
};
use geo_upload::signals::{AppPhase, ConnectivityWatcher, LifecycleWatcher, spawn_tcp_probe};
use geo_upload::uploader::HttpUploader;
use geo_upload::{Error, Result};
use reqwest::Url;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a config TOML (built-in defaults when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate and persist photos, then upload them if the network is up
    Enqueue {
        /// JPEG files to queue
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Only persist; leave uploading to a later `drain` or `run`
        #[arg(long)]
        offline: bool,
    },
    /// Upload everything left in the queue
    Drain,
    /// Print upload progress and the files still queued
    Status,
    /// Stay resident: probe connectivity and drain on every reachability edge
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(args.log_json);

    let doc = geo_upload::config::load_or_default(args.config.as_deref())?;
    let cfg = doc.app_config()?;

    match args.cmd {
        Command::Enqueue { paths, offline } => cmd_enqueue(&cfg, &paths, offline).await,
        Command::Drain => cmd_drain(&cfg).await,
        Command::Status => cmd_status(&cfg),
        Command::Run => cmd_run(&cfg).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

struct Session {
    engine: Arc<Engine>,
    connectivity: ConnectivityWatcher,
    lifecycle: LifecycleWatcher,
    upload_url: Url,
}

fn open_session(cfg: &AppConfig, connected: bool) -> Result<Session> {
    let paths = geo_upload::workspace::init_dirs(&cfg.storage)?;
    let uploader = HttpUploader::from_config(&cfg.uploader)?;
    let upload_url = uploader.url().clone();
    let connectivity = ConnectivityWatcher::new(connected);
    let lifecycle = LifecycleWatcher::new(AppPhase::Foreground);

    let engine = Engine::new(EngineParts {
        store: ArtifactStore::new(paths.cache_dir.clone()),
        counters: CounterStore::new(paths.counter_file.clone()),
        uploader: Arc::new(uploader),
        connectivity: connectivity.clone(),
        lifecycle: lifecycle.clone(),
        clock: Arc::new(TokioClock),
        settings: EngineSettings::from_config(cfg),
    });
    tracing::debug!(root = %paths.root.display(), url = %upload_url, "session opened");

    Ok(Session {
        engine: Arc::new(engine),
        connectivity,
        lifecycle,
        upload_url,
    })
}

async fn cmd_enqueue(cfg: &AppConfig, paths: &[PathBuf], offline: bool) -> Result<()> {
    let session = open_session(cfg, !offline)?;
    let mut rejected = 0usize;

    for path in paths {
        let artifact = match Artifact::from_path(path) {
            Ok(a) => Some(a),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read photo");
                None
            }
        };
        match session.engine.enqueue(artifact).await {
            EnqueueOutcome::Queued(loc) => {
                println!("queued    {} -> {}", path.display(), loc.display())
            }
            EnqueueOutcome::Rejected(reason) => {
                rejected += 1;
                println!("rejected  {}: {reason}", path.display());
            }
            EnqueueOutcome::NotPersisted => {
                rejected += 1;
                println!("failed    {}: could not store photo", path.display());
            }
        }
    }

    print_snapshot(&session.engine.snapshot());
    if rejected > 0 {
        return Err(Error::msg(format!("{rejected} photo(s) not queued")));
    }
    fail_on_permanent(&session.engine.snapshot())
}

async fn cmd_drain(cfg: &AppConfig) -> Result<()> {
    let session = open_session(cfg, true)?;
    match session.engine.drain().await {
        DrainOutcome::Empty => println!("queue is empty"),
        DrainOutcome::AlreadyRunning => println!("a drain is already running"),
        DrainOutcome::Finished(report) => println!(
            "uploaded {}, handed off {}, dropped {}",
            report.uploaded, report.registered_background, report.dropped
        ),
    }
    let snap = session.engine.snapshot();
    print_snapshot(&snap);
    fail_on_permanent(&snap)
}

fn cmd_status(cfg: &AppConfig) -> Result<()> {
    let paths = geo_upload::workspace::load_paths(&cfg.storage)?;
    let rec = CounterStore::new(paths.counter_file.clone()).load();
    let pending = ArtifactStore::new(paths.cache_dir.clone()).enumerate();

    if !rec.has_queued_uploads() && pending.is_empty() {
        println!("nothing queued");
        return Ok(());
    }
    println!("{}/{} images", rec.uploaded, rec.queued);
    println!("pending: {}", pending.len());
    for p in &pending {
        println!("  {}", p.display());
    }
    if rec.outstanding() != pending.len() as u64 {
        println!("note: counters will be reconciled with the cache directory on next start");
    }
    Ok(())
}

async fn cmd_run(cfg: &AppConfig) -> Result<()> {
    let session = open_session(cfg, false)?;

    let probe = match probe_addr(cfg, &session.upload_url) {
        Some(addr) => {
            tracing::info!(%addr, "probing connectivity");
            let interval = Duration::from_secs(cfg.connectivity.probe_interval_secs.max(1));
            Some(spawn_tcp_probe(session.connectivity.clone(), addr, interval))
        }
        None => {
            tracing::warn!("no probe address; assuming the network is reachable");
            session.connectivity.set_connected(true);
            None
        }
    };

    let mut progress = session.engine.subscribe();
    let engine_loop = tokio::spawn(session.engine.clone().run());
    session.lifecycle.activate();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let snap = progress.borrow_and_update().clone();
                tracing::info!(state = ?snap.state, progress = %snap.progress_text(), pending = snap.pending, "progress");
            }
            res = &mut shutdown => {
                if let Err(e) = res {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                tracing::info!("shutting down; queued photos stay on disk");
                break;
            }
        }
    }

    engine_loop.abort();
    if let Some(p) = probe {
        p.abort();
    }
    Ok(())
}

fn probe_addr(cfg: &AppConfig, upload_url: &Url) -> Option<String> {
    if let Some(addr) = cfg.connectivity.probe_addr.as_deref()
        && !addr.trim().is_empty()
    {
        return Some(addr.trim().to_string());
    }
    let host = upload_url.host_str()?;
    let port = upload_url.port_or_known_default()?;
    Some(format!("{host}:{port}"))
}

fn print_snapshot(snap: &Snapshot) {
    let state = match &snap.state {
        EngineState::Idle => "idle".to_string(),
        EngineState::Uploading => "uploading".to_string(),
        EngineState::Success(r) => format!("uploaded ({})", r.remote_locator),
        EngineState::Failure(e) => format!("failed ({e})"),
        EngineState::PermanentFailure(reason) => format!("stopped ({reason})"),
    };
    println!(
        "{}  pending {}  state {}",
        snap.progress_text(),
        snap.pending,
        state
    );
}

fn fail_on_permanent(snap: &Snapshot) -> Result<()> {
    match &snap.state {
        EngineState::PermanentFailure(reason) => Err(Error::msg(reason.clone())),
        _ => Ok(()),
    }
}
