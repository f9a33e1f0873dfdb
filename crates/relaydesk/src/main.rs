//! `RelayDesk` - bulk relay manager
//!
//! Imports relay credentials, validates them and dispatches campaigns
//! across the valid ones. Results go to stdout as JSON; logs go to stderr.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod cli;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use relaydesk_core::relay::RelayRepository;
use relaydesk_core::{
    BatchImporter, CampaignRequest, CoreConfig, DispatchScheduler, MailTransport, RelayCredential,
    RelayStore, RelayValidator, SqliteRelayRepository,
};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaydesk=info,relaydesk_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = CoreConfig::load(&app_dir(dirs::config_dir()).join("config.json")).await?;
    let app = App::open(config).await?;

    match cli.command {
        Command::Import {
            file,
            format,
            delimiter,
            validate,
        } => app.import(file, format.into(), delimiter, validate).await,
        Command::Validate => app.validate().await,
        Command::List => app.list().await,
        Command::PurgeInvalid => app.purge_invalid().await,
        Command::Send { campaign } => app.send(campaign).await,
    }
}

fn app_dir(base: Option<PathBuf>) -> PathBuf {
    base.unwrap_or_else(|| PathBuf::from(".")).join("relaydesk")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Relay as shown by `list`. Never includes the secret.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RelaySummary {
    id: String,
    label: String,
    kind: relaydesk_core::relay::ProviderKind,
    valid: bool,
    last_error: Option<String>,
    sent_today: u32,
    daily_quota: Option<u32>,
}

impl From<&RelayCredential> for RelaySummary {
    fn from(relay: &RelayCredential) -> Self {
        Self {
            id: relay.id.to_string(),
            label: relay.label(),
            kind: relay.provider_kind(),
            valid: relay.is_valid(),
            last_error: relay.last_error().map(str::to_string),
            sent_today: relay.sent_today,
            daily_quota: relay.daily_quota,
        }
    }
}

/// The wired-up core.
struct App {
    config: CoreConfig,
    store: Arc<RelayStore>,
    transport: Arc<MailTransport>,
}

impl App {
    async fn open(config: CoreConfig) -> Result<Self> {
        let data_dir = app_dir(dirs::data_dir());
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("creating {}", data_dir.display()))?;

        let db_path = data_dir.join("relaydesk.db");
        let repo = SqliteRelayRepository::new(db_path.to_str().unwrap_or("relaydesk.db")).await?;
        let store = RelayStore::open(Arc::new(repo) as Arc<dyn RelayRepository>).await?;
        info!(relays = store.len().await, db = %db_path.display(), "Opened relay store");

        let transport = Arc::new(MailTransport::new(config.helo_name.clone(), config.send_timeout()));
        Ok(Self {
            config,
            store: Arc::new(store),
            transport,
        })
    }

    fn validator(&self) -> RelayValidator {
        RelayValidator::new(Arc::clone(&self.transport) as _, &self.config)
    }

    async fn import(
        &self,
        file: PathBuf,
        format: relaydesk_core::FormatHint,
        delimiter: Option<u8>,
        validate: bool,
    ) -> Result<()> {
        let bytes = tokio::fs::read(&file)
            .await
            .with_context(|| format!("reading {}", file.display()))?;

        let mut importer = BatchImporter::new(&self.config);
        if let Some(delimiter) = delimiter {
            importer = importer.with_delimiter(delimiter);
        }
        let result = if validate {
            importer
                .import_and_validate(&bytes, format, &self.validator())
                .await?
        } else {
            importer.import(&bytes, format)?
        };

        for relay in &result.configs {
            self.store.upsert(relay.clone()).await?;
        }
        info!(
            file = %file.display(),
            imported = result.success,
            failed = result.failed,
            "Import finished"
        );
        print_json(&result)
    }

    async fn validate(&self) -> Result<()> {
        let report = self.validator().validate_store(&self.store).await?;
        print_json(&report)
    }

    async fn list(&self) -> Result<()> {
        let relays: Vec<RelaySummary> = self.store.list_all().await.iter().map(RelaySummary::from).collect();
        print_json(&relays)
    }

    async fn purge_invalid(&self) -> Result<()> {
        let removed: Vec<String> = self
            .store
            .remove_invalid()
            .await?
            .into_iter()
            .map(|id| id.to_string())
            .collect();
        print_json(&serde_json::json!({ "removed": removed }))
    }

    async fn send(&self, campaign: PathBuf) -> Result<()> {
        let contents = tokio::fs::read_to_string(&campaign)
            .await
            .with_context(|| format!("reading {}", campaign.display()))?;
        let request: CampaignRequest =
            serde_json::from_str(&contents).with_context(|| format!("parsing {}", campaign.display()))?;

        let scheduler = DispatchScheduler::new(Arc::clone(&self.store), Arc::clone(&self.transport) as _, &self.config);
        let mut handle = scheduler.submit(request).await?;

        let cancel = handle.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling campaign");
                cancel.cancel();
            }
        });

        while let Some(event) = handle.events.recv().await {
            if event.terminal {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        print_json(&handle.join().await?)
    }
}
