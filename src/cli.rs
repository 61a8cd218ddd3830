use bigdecimal::BigDecimal;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::adapters::PostgresStore;
use crate::config::Config;
use crate::services::checkout::NewProduct;
use crate::AppState;

#[derive(Parser)]
#[command(name = "checkout-core")]
#[command(about = "Checkout Core - eSewa and Khalti payment verification service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve {
        /// Keep products and purchases in process memory instead of Postgres
        #[arg(long)]
        in_memory: bool,
    },

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Product catalog commands
    #[command(subcommand)]
    Product(ProductCommands),

    /// Configuration validation
    Config,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[derive(Subcommand)]
pub enum ProductCommands {
    /// Add a product to the catalog
    Create {
        #[arg(long)]
        name: String,
        /// Price in rupees, at most two decimals
        #[arg(long)]
        price: BigDecimal,
        #[arg(long)]
        category: String,
    },
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    crate::db::run_migrations(&pool).await?;

    println!("✓ Database migrations completed");
    Ok(())
}

pub async fn handle_product_create(
    config: &Config,
    name: String,
    price: BigDecimal,
    category: String,
) -> anyhow::Result<()> {
    let pool = crate::db::create_pool(config).await?;
    let state = AppState::from_config(config, Arc::new(PostgresStore::new(pool)))?;

    let product = state
        .checkout
        .create_product(NewProduct {
            name,
            price,
            category,
        })
        .await?;

    println!("✓ Product created");
    println!("  Id: {}", product.id);
    println!("  Name: {}", product.name);
    println!("  Price: {}", product.price);
    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");
    config.validate()?;

    println!("Configuration:");
    println!("  Server Port: {}", config.server_port);
    println!("  Database URL: {}", mask_password(&config.database_url));
    println!("  Callback Base URL: {}", config.callback_base_url);
    println!("  Storefront URL: {}", config.storefront_url);
    println!("  eSewa Gateway URL: {}", config.esewa.gateway_url);
    println!("  eSewa Status URL: {}", config.esewa.status_url);
    println!("  eSewa Product Code: {}", config.esewa.product_code);
    println!("  eSewa Secret Key: {}", mask_secret(&config.esewa.secret_key));
    println!("  Khalti Gateway URL: {}", config.khalti.gateway_url);
    println!("  Khalti Secret Key: {}", mask_secret(&config.khalti.secret_key));
    println!("  Gateway Timeout: {}s", config.gateway_timeout_secs);

    println!("✓ Configuration is valid");
    Ok(())
}

fn mask_password(url: &str) -> String {
    if let Some(at_pos) = url.rfind('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            if let Some(slash_pos) = url[..colon_pos].rfind("//") {
                let prefix = &url[..slash_pos + 2];
                let user = &url[slash_pos + 2..colon_pos];
                let suffix = &url[at_pos..];
                return format!("{}{}:****{}", prefix, user, suffix);
            }
        }
    }
    url.to_string()
}

fn mask_secret(secret: &str) -> String {
    match secret.chars().count() {
        0 => "(not set)".to_string(),
        n if n <= 4 => "****".to_string(),
        n => {
            let tail: String = secret.chars().skip(n - 2).collect();
            format!("****{}", tail)
        }
    }
}
