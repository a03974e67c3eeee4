//! # cadenced — the Cadence scan daemon
//!
//! Loads schedule definitions and entities, spawns instances for every
//! entity whose start condition is reached, then ticks the scan loop:
//! fire due instances, catch them up past now, persist.
//!
//! Usage:
//!   cadenced                                   # defaults under ~/.cadence
//!   cadenced --definitions ./defs --tick 30    # custom definitions dir + tick
//!   cadenced --entities ./entities.json -v     # file-backed entities, verbose

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cadence_channels::{ConsoleChannel, TelegramChannel, WebhookChannel};
use cadence_core::entity::{MemoryEntityRepository, StaticEntity, StaticRecipientResolver};
use cadence_core::traits::{DeliveryChannel, NullAuditSink, NullCallbackDetector};
use cadence_core::types::DeliveryMethod;
use cadence_core::CadenceConfig;
use cadence_engine::{run_scan_loop, DefinitionStore, LifecycleController, SqliteInstanceStore};

#[derive(Parser)]
#[command(name = "cadenced", version, about = "⏰ Cadence — recurring notification engine")]
struct Cli {
    /// Config file path (default ~/.cadence/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Definitions directory (default ~/.cadence/definitions)
    #[arg(long)]
    definitions: Option<PathBuf>,

    /// Entities file: JSON map of scope → entity list
    #[arg(long)]
    entities: Option<PathBuf>,

    /// Instance database path (overrides config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Seconds between scan ticks (overrides config)
    #[arg(long)]
    tick: Option<u64>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "cadence=debug" } else { "cadence=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => CadenceConfig::load_from(path)?,
        None => CadenceConfig::load()?,
    };

    let db_path = cli
        .db
        .unwrap_or_else(|| PathBuf::from(&config.engine.db_path));
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let instances = Arc::new(SqliteInstanceStore::open(&db_path)?);
    tracing::info!("💾 Instance store: {}", db_path.display());

    let definitions_dir = cli.definitions.unwrap_or_else(DefinitionStore::default_path);
    let definitions = DefinitionStore::new(&definitions_dir).load();
    tracing::info!("📋 Loaded {} definition(s) from {}", definitions.len(), definitions_dir.display());

    let entities = Arc::new(load_entities(cli.entities.as_deref())?);

    let mut controller = LifecycleController::new(
        instances,
        entities,
        Arc::new(StaticRecipientResolver::new()),
        Arc::new(NullCallbackDetector),
        Arc::new(NullAuditSink),
        &config.engine,
    );
    register_channels(&mut controller, &config);

    // Initial sweep: every saved definition re-evaluates its scope, so
    // instances exist before the first tick.
    let controller = Arc::new(controller);
    let now = Utc::now();
    for definition in definitions {
        controller.definition_saved(definition, now).await;
    }

    run_scan_loop(controller, cli.tick.unwrap_or(config.engine.tick_secs)).await;
    Ok(())
}

/// Wire configured channels to delivery methods. The console channel
/// always backs the test methods; the webhook channel (an SMS/email
/// gateway bridge) carries the real ones, with Telegram preferred for
/// plain messages when configured.
fn register_channels(controller: &mut LifecycleController, config: &CadenceConfig) {
    let console = Arc::new(ConsoleChannel::new());
    controller.register_channel(DeliveryMethod::Test, console.clone());
    controller.register_channel(DeliveryMethod::CallbackTest, console);

    if let Some(webhook) = &config.channel.webhook {
        if webhook.enabled {
            let channel: Arc<dyn DeliveryChannel> = Arc::new(WebhookChannel::new(webhook.clone()));
            controller.register_channel(DeliveryMethod::Sms, channel.clone());
            controller.register_channel(DeliveryMethod::Callback, channel.clone());
            controller.register_channel(DeliveryMethod::Email, channel);
            tracing::info!("🌐 Webhook channel → {}", webhook.url);
        }
    }
    if let Some(telegram) = &config.channel.telegram {
        if telegram.enabled && !telegram.bot_token.is_empty() {
            let channel: Arc<dyn DeliveryChannel> = Arc::new(TelegramChannel::new(telegram.clone()));
            controller.register_channel(DeliveryMethod::Sms, channel.clone());
            controller.register_channel(DeliveryMethod::Callback, channel);
            tracing::info!("✈️ Telegram channel enabled");
        }
    }
}

/// Load the entities file: `{"<scope>": [entity, ...], ...}`.
fn load_entities(path: Option<&std::path::Path>) -> Result<MemoryEntityRepository> {
    let mut repo = MemoryEntityRepository::new();
    let Some(path) = path else {
        return Ok(repo);
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading entities file {}", path.display()))?;
    let scopes: HashMap<String, Vec<StaticEntity>> =
        serde_json::from_str(&json).with_context(|| format!("parsing {}", path.display()))?;
    let mut count = 0usize;
    for (scope, entities) in scopes {
        for entity in entities {
            repo.insert(&scope, entity);
            count += 1;
        }
    }
    tracing::info!("🗃️ Loaded {count} entities from {}", path.display());
    Ok(repo)
}
