use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use checkout_core::adapters::{MemoryStore, PostgresStore};
use checkout_core::cli::{self, Cli, Commands, DbCommands, ProductCommands};
use checkout_core::config::{Config, LogFormat};
use checkout_core::ports::Store;
use checkout_core::{create_app, db, secrets, AppState, RouterSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let command = Cli::parse()
        .command
        .unwrap_or(Commands::Serve { in_memory: false });

    let mut config = Config::from_env()?;
    init_tracing(config.log_format);

    secrets::resolve_secrets(&mut config).await?;

    match command {
        Commands::Serve { in_memory } => serve(config, in_memory).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Product(ProductCommands::Create {
            name,
            price,
            category,
        }) => cli::handle_product_create(&config, name, price, category).await,
        Commands::Config => cli::handle_config_validate(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
    }
}

async fn serve(config: Config, in_memory: bool) -> anyhow::Result<()> {
    let store: Arc<dyn Store> = if in_memory {
        tracing::warn!("Using in-memory store; data is lost on exit");
        Arc::new(MemoryStore::new())
    } else {
        let pool = db::create_pool(&config).await?;
        db::run_migrations(&pool).await?;
        Arc::new(PostgresStore::new(pool))
    };

    let state = AppState::from_config(&config, store)?;
    let app = create_app(state, RouterSettings::from_config(&config));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!(
        esewa = %config.esewa.gateway_url,
        khalti = %config.khalti.gateway_url,
        "listening on {}",
        addr
    );

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
