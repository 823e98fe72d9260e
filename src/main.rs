use clap::Parser;
use emabot::api::BinanceFuturesClient;
use emabot::commands::CommandHandler;
use emabot::{BotConfig, Exchange, Result, TradingEngine};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

/// EMA crossover bot for Binance USDⓈ-M futures
#[derive(Parser, Debug)]
#[command(name = "emabot", version)]
struct Args {
    /// Use the Binance futures testnet
    #[arg(long)]
    testnet: bool,

    /// Start trading immediately instead of waiting for /startbot
    #[arg(long)]
    autostart: bool,

    /// Override the REST base URL
    #[arg(long)]
    base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let mut config = BotConfig::load()?;
    if args.testnet {
        config.testnet = true;
    }
    if args.base_url.is_some() {
        config.base_url = args.base_url;
    }

    tracing::info!("🚀 emabot starting");
    tracing::info!("  Config: {:?}", config);

    if !config.has_credentials() {
        tracing::warn!(
            "⚠️  BINANCE_API_KEY / BINANCE_API_SECRET not set, signed calls will fail"
        );
    }

    let (key, secret) = (config.api_key.clone(), config.api_secret.clone());
    let client = match (&config.base_url, config.testnet) {
        (Some(url), _) => BinanceFuturesClient::with_base_url(url, key, secret)?,
        (None, true) => BinanceFuturesClient::testnet(key, secret)?,
        (None, false) => BinanceFuturesClient::new(key, secret)?,
    };
    let exchange: Arc<dyn Exchange> = Arc::new(client);

    let engine = Arc::new(TradingEngine::new(exchange, config));
    let handler = CommandHandler::new(engine.clone());

    if args.autostart {
        if let Err(e) = engine.start().await {
            tracing::error!("❌ Autostart failed: {}", e);
        }
    }

    println!("{}", handler.help_text());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⚠️  Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => println!("{}", handler.handle(&line).await),
                    Ok(None) => {
                        // stdin closed: keep trading until Ctrl+C
                        tokio::signal::ctrl_c().await?;
                        tracing::info!("⚠️  Received Ctrl+C, shutting down...");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("Failed to read command: {}", e);
                        break;
                    }
                }
            }
        }
    }

    engine.stop();
    tracing::info!("👋 Shutdown complete");
    Ok(())
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("emabot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
