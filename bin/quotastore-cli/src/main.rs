//! Quotastore CLI - Admin Command Line Interface
//!
//! Inspect and maintain a storage root: initialize/migrate it, report
//! usage, clear origins and pin origins against eviction.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use quotastore_common::{
    ClientType, OriginAttributesPattern, OriginMetadata, PersistenceType, QuotaConfig,
};
use quotastore_db::StorageLayout;
use quotastore_engine::{Client, DirectorySizeClient, QuotaManager};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "quotastore-cli")]
#[command(about = "Quotastore Admin CLI")]
#[command(version)]
struct Args {
    /// Storage root directory (overrides the config file)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Configuration file path (TOML)
    #[arg(short, long, default_value = "/etc/quotastore/quotastore.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize (and migrate) the storage root
    Init,
    /// Report usage
    Usage {
        /// Report one origin instead of the whole pool
        #[arg(long)]
        origin: Option<String>,
        /// Emit JSON
        #[arg(long)]
        json: bool,
    },
    /// Clear storages
    Clear {
        #[command(subcommand)]
        action: ClearCommands,
    },
    /// Pin an origin's default-persistence data against eviction
    Persist {
        /// Origin, e.g. https://example.com
        origin: String,
    },
}

#[derive(Subcommand, Debug)]
enum ClearCommands {
    /// Clear one origin
    Origin {
        origin: String,
        /// Restrict to one repository (permanent/temporary/default/private)
        #[arg(long)]
        persistence: Option<String>,
    },
    /// Clear every origin sharing a prefix (suffix-stripped origin)
    Prefix { origin: String },
    /// Clear origins whose attributes match key=value pairs
    Pattern { pattern: String },
    /// Clear the private-browsing repository
    Private,
    /// Wipe the whole storage tree
    All,
}

fn load_config(args: &Args) -> Result<QuotaConfig> {
    let mut config = if args.config.exists() {
        let text = std::fs::read_to_string(&args.config)
            .with_context(|| format!("reading {}", args.config.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", args.config.display()))?
    } else {
        QuotaConfig::default()
    };
    if let Some(root) = &args.root {
        config.storage.root.clone_from(root);
    }
    Ok(config)
}

fn build_manager(config: QuotaConfig) -> QuotaManager {
    let layout = StorageLayout::new(&config.storage.root);
    let clients: Vec<Arc<dyn Client>> = vec![
        Arc::new(DirectorySizeClient::new(ClientType::KeyValue, layout.clone())),
        Arc::new(DirectorySizeClient::new(ClientType::Cache, layout.clone())),
        Arc::new(DirectorySizeClient::new(ClientType::LocalStorage, layout)),
    ];
    QuotaManager::new(config, clients)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&args.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;
    let manager = build_manager(config);

    match args.command {
        Commands::Init => {
            manager.initialize_temporary_storage().await?;
            println!(
                "storage ready: usage {} / limit {} bytes (group limit {})",
                manager.total_usage(),
                manager.config().storage.temporary_storage_limit,
                manager.group_limit(),
            );
        }
        Commands::Usage { origin, json } => {
            manager.initialize_temporary_storage().await?;
            if let Some(origin) = origin {
                let metadata = OriginMetadata::new(origin.clone(), PersistenceType::Default);
                let usage = manager.get_origin_usage(&metadata).await?;
                if json {
                    println!(
                        "{}",
                        serde_json::json!({ "origin": origin, "usage": usage })
                    );
                } else {
                    println!("{origin}: {usage} bytes");
                }
            } else {
                let total = manager.total_usage();
                let limit = manager.config().storage.temporary_storage_limit;
                if json {
                    println!("{}", serde_json::json!({ "usage": total, "limit": limit }));
                } else {
                    println!("{total} / {limit} bytes");
                }
            }
        }
        Commands::Clear { action } => {
            match action {
                ClearCommands::Origin {
                    origin,
                    persistence,
                } => {
                    let persistence_type = match persistence.as_deref() {
                        Some(name) => Some(
                            PersistenceType::from_directory_name(name)
                                .with_context(|| format!("unknown repository: {name}"))?,
                        ),
                        None => None,
                    };
                    let metadata = OriginMetadata::new(origin, PersistenceType::Default);
                    manager
                        .clear_storages_for_origin(persistence_type, &metadata, None)
                        .await?;
                }
                ClearCommands::Prefix { origin } => {
                    manager.clear_storages_for_origin_prefix(&origin).await?;
                }
                ClearCommands::Pattern { pattern } => {
                    manager
                        .clear_storages_for_attributes_pattern(
                            &OriginAttributesPattern::parse(&pattern),
                        )
                        .await?;
                }
                ClearCommands::Private => manager.clear_private_repository().await?,
                ClearCommands::All => manager.clear_storage().await?,
            }
            println!("cleared");
        }
        Commands::Persist { origin } => {
            let metadata = OriginMetadata::new(origin.clone(), PersistenceType::Default);
            manager.persist_origin(&metadata).await?;
            println!("persisted {origin}");
        }
    }

    manager.shutdown_storage().await?;
    tokio::task::spawn_blocking(move || manager.shutdown())
        .await
        .context("joining shutdown")?;
    Ok(())
}
