// JDWP Monitor - stream a live target's events as JSON lines
//
// Subscribes to class, thread and (optionally) exception events and prints
// every delivered EventSet on stdout.

use anyhow::{Context, Result};
use clap::Parser;
use jdwp_engine::{Connection, EventKind, EventSet, QueueError, RequestKind, SuspendPolicy};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::{MonitorSettings, Overrides, SuspendMode};

#[derive(Debug, Parser)]
#[command(name = "jdwp-monitor", version, about)]
struct Args {
    /// Target host
    #[arg(long)]
    host: Option<String>,

    /// Target JDWP port
    #[arg(long)]
    port: Option<u16>,

    /// JSON settings file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Only report classes matching this pattern (repeatable)
    #[arg(long = "class", value_name = "PATTERN")]
    classes: Vec<String>,

    /// Do not report classes matching this pattern (repeatable)
    #[arg(long, value_name = "PATTERN")]
    exclude: Vec<String>,

    /// Also report caught and uncaught exceptions
    #[arg(long)]
    exceptions: bool,

    /// Suspend policy for every subscription
    #[arg(long, value_enum)]
    suspend: Option<SuspendMode>,
}

impl Args {
    fn settings(self) -> Result<MonitorSettings> {
        let base = match &self.config {
            Some(path) => MonitorSettings::load(path)?,
            None => MonitorSettings::default(),
        };
        base.merge(Overrides {
            host: self.host,
            port: self.port,
            classes: self.classes,
            exclude: self.exclude,
            exceptions: self.exceptions,
            suspend: self.suspend,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Tracing to stderr only - stdout carries event output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("jdwp_monitor=info,jdwp_engine=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = Args::parse().settings()?;
    let policy = SuspendPolicy::from(settings.suspend);

    info!("Attaching to {}:{}", settings.host, settings.port());
    let conn = Connection::connect_with_config(&settings.host, settings.port(), settings.engine.clone())
        .await
        .with_context(|| format!("connecting to {}:{}", settings.host, settings.port()))?;

    let version = conn.version().await.context("querying target version")?;
    info!(
        "Target: {} {} (JDWP {}.{})",
        version.vm_name, version.vm_version, version.jdwp_major, version.jdwp_minor
    );
    let threads = conn.all_threads().await.context("listing target threads")?;
    info!("{} live threads", threads.len());

    subscribe(&conn, &settings, policy).await?;

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
                stop.cancel();
            }
        }
    });

    let result = stream_events(&conn, &stop).await;
    conn.disconnect().await;
    info!("Detached");
    result
}

async fn subscribe(conn: &Connection, settings: &MonitorSettings, policy: SuspendPolicy) -> Result<()> {
    let prepare = conn.create_request(RequestKind::ClassPrepare);
    for pattern in &settings.classes {
        conn.add_class_filter(prepare, Some(pattern))
            .with_context(|| format!("class filter {:?}", pattern))?;
    }
    for pattern in &settings.exclude {
        conn.add_class_exclusion_filter(prepare, Some(pattern))
            .with_context(|| format!("class exclusion filter {:?}", pattern))?;
    }

    let mut requests = vec![
        prepare,
        conn.create_request(RequestKind::ThreadStart),
        conn.create_request(RequestKind::ThreadDeath),
    ];
    if settings.exceptions {
        requests.push(conn.create_request(RequestKind::Exception {
            exception_type: None,
            caught: true,
            uncaught: true,
        }));
    }

    for id in requests {
        conn.set_suspend_policy(id, policy)?;
        conn.enable_request(id)
            .await
            .with_context(|| format!("enabling request {}", id))?;
    }
    info!("Subscribed with suspend policy {:?}", policy);
    Ok(())
}

async fn stream_events(conn: &Connection, stop: &CancellationToken) -> Result<()> {
    let stdout = std::io::stdout();

    loop {
        let set = match conn.recv_event_cancellable(stop).await {
            Ok(set) => set,
            Err(QueueError::Closed) => {
                warn!("Target connection closed");
                return Ok(());
            }
            Err(QueueError::Cancelled) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let line = serde_json::to_string(&set).context("encoding event set")?;
        {
            let mut out = stdout.lock();
            writeln!(out, "{}", line)?;
            out.flush()?;
        }

        if is_vm_death(&set) {
            info!("Target VM is exiting");
            return Ok(());
        }
        if set.suspend_policy != SuspendPolicy::None {
            conn.resume_event_set(&set)
                .await
                .context("resuming after event set")?;
        }
    }
}

fn is_vm_death(set: &EventSet) -> bool {
    set.events
        .iter()
        .any(|event| matches!(event.details, EventKind::VMDeath))
}
