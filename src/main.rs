use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parish_ledger::cli::{self, AuthorityCommands, Cli, Commands, DbCommands, DeviceCommands};
use parish_ledger::config::Config;
use parish_ledger::{create_app, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    // Setup logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(Commands::Db(DbCommands::Migrate)) => cli::handle_db_migrate(&config).await,
        Some(Commands::Config) => cli::handle_config_validate(&config),
        Some(Commands::Device(command)) => match command {
            DeviceCommands::Donate {
                organization,
                branch,
                amount,
                currency,
                category,
            } => {
                cli::handle_device_donate(&config, organization, branch, amount, currency, category)
                    .await
            }
            DeviceCommands::CheckIn {
                organization,
                branch,
                member,
                service,
            } => cli::handle_device_check_in(&config, organization, branch, member, service).await,
            DeviceCommands::List { status } => cli::handle_device_list(&config, status).await,
            DeviceCommands::Sync => cli::handle_device_sync(&config).await,
            DeviceCommands::Run => cli::handle_device_run(&config).await,
            DeviceCommands::Revive { tx_id } => cli::handle_device_revive(&config, tx_id).await,
            DeviceCommands::Clear { tx_id } => cli::handle_device_clear(&config, tx_id).await,
            DeviceCommands::Reverse { tx_id } => cli::handle_device_reverse(&config, tx_id).await,
        },
        Some(Commands::Authority(AuthorityCommands::Reverse {
            organization,
            tx_id,
        })) => cli::handle_authority_reverse(&config, organization, tx_id).await,
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let allocator = cli::build_allocator(&config).await?;
    tracing::info!("Database migrations completed");

    let app = create_app(AppState {
        allocator: Arc::new(allocator),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    tracing::info!("listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
