//! realm-bus - scripted demo session
//!
//! Attaches a few realms hosting the `eventemitter` module, subscribes one
//! callback per realm, emits test events and prints what each callback saw.
//!
//!   realm-bus --realms 3 --rounds 2
//!   RUST_LOG=realm_bus=debug realm-bus

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;
use realm_bus::modules::diagnostic_catalog;
use realm_bus::modules::event_emitter::{MONITORING_EVENT, TEST_EVENT};
use realm_bus::{
    AddressableHandle, Command, ContextDescriptor, ContextId, Event, Listener,
    RootMessageHandler, SessionConfig,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// realm-bus - command routing and event subscription demo
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Session config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides sessionId from the config file
    #[arg(long)]
    session_id: Option<String>,

    /// Overrides commandTimeoutMs from the config file
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Number of realms to attach
    #[arg(short, long, default_value_t = 2)]
    realms: u64,

    /// emitTestEvent calls per realm and phase
    #[arg(long, default_value_t = 1)]
    rounds: u32,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => SessionConfig::default(),
        };
        if let Some(session_id) = &self.session_id {
            config.session_id = session_id.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.command_timeout_ms = Some(timeout_ms);
        }
        Ok(config)
    }
}

struct Subscriber {
    descriptor: ContextDescriptor,
    listener: Listener<Event>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl Subscriber {
    fn new(context_id: ContextId) -> Self {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = Listener::new(move |_, event: &Event| {
            let text = event.payload["text"].as_str().unwrap_or_default().to_string();
            sink.lock().unwrap_or_else(|e| e.into_inner()).push(text);
        });
        Self {
            descriptor: ContextDescriptor { context_id },
            listener,
            seen,
        }
    }

    fn count(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

async fn emit_round(root: &RootMessageHandler, realms: &[ContextId], rounds: u32) -> Result<()> {
    for _ in 0..rounds {
        for context_id in realms {
            let destination = AddressableHandle::Realm {
                context_id: *context_id,
            };
            let command = Command::new("eventemitter", "emitTestEvent", destination);
            root.handle_command(command)
                .await
                .with_context(|| format!("emitTestEvent failed at realm#{}", context_id))?;
        }
    }
    Ok(())
}

async fn report(root: &RootMessageHandler, phase: &str, subscribers: &[Subscriber]) -> Result<()> {
    println!("== {}", phase);
    for subscriber in subscribers {
        let destination = subscriber.descriptor.destination();
        let subscribed = root
            .events_dispatcher()
            .is_subscribed(TEST_EVENT, &destination)
            .await?;
        println!(
            "  {:<10} subscribed={:<5} received={}",
            destination.to_string(),
            subscribed,
            subscriber.count()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.session_config()?;
    debug!("Session config: {:?}", config);

    let root = RootMessageHandler::with_config(config, diagnostic_catalog());
    let realms: Vec<ContextId> = (1..=cli.realms).map(ContextId).collect();
    for context_id in &realms {
        root.attach_realm(*context_id);
    }

    let monitoring = Arc::new(Mutex::new(0usize));
    let counter = monitoring.clone();
    root.on(
        MONITORING_EVENT,
        Listener::new(move |_, _: &Event| *counter.lock().unwrap_or_else(|e| e.into_inner()) += 1),
    );

    let subscribers: Vec<Subscriber> = realms.iter().copied().map(Subscriber::new).collect();
    for subscriber in &subscribers {
        root.events_dispatcher()
            .subscribe(TEST_EVENT, &subscriber.descriptor, subscriber.listener.clone())
            .await?;
    }

    emit_round(&root, &realms, cli.rounds).await?;
    report(&root, "all realms subscribed", &subscribers).await?;

    if let Some(first) = subscribers.first() {
        root.events_dispatcher()
            .unsubscribe(TEST_EVENT, &first.descriptor, &first.listener)
            .await;
        emit_round(&root, &realms, cli.rounds).await?;
        report(&root, "first realm unsubscribed", &subscribers).await?;
    }

    let echo = root
        .handle_command(
            Command::new("eventemitter", "echo", AddressableHandle::realm(1))
                .with_params(json!({"session": root.session_id()})),
        )
        .await;
    println!("== echo at realm#1: {:?}", echo);

    root.destroy().await;
    println!(
        "== monitoring events: {}",
        *monitoring.lock().unwrap_or_else(|e| e.into_inner())
    );
    Ok(())
}
