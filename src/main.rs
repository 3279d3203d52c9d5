use std::path::PathBuf;
use std::sync::Arc;

use feed_notifier::commands::CommandHandler;
use feed_notifier::config::Config;
use feed_notifier::db::Repository;
use feed_notifier::feed::FeedFetcher;
use feed_notifier::notify::{LogNotifier, Notifier, TelegramNotifier, TelegramUpdates};
use feed_notifier::service::FeedService;
use feed_notifier::shutdown::Shutdown;
use feed_notifier::{AppError, Result};

struct Args {
    config: Option<PathBuf>,
    once: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        once: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::config("--config needs a path"))?;
                args.config = Some(PathBuf::from(path));
            }
            "--once" => args.once = true,
            other => return Err(AppError::config(format!("unknown argument: {other}"))),
        }
    }
    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let repository = Arc::new(Repository::new(&config.db_path).await?);
    let fetcher = Arc::new(FeedFetcher::new(config.impersonate_hosts.clone())?);
    let bot_token = config.bot_token.as_deref().filter(|t| !t.trim().is_empty());
    let notifier: Arc<dyn Notifier> = match bot_token {
        Some(token) => Arc::new(TelegramNotifier::new(token)?),
        None => {
            tracing::warn!("no bot_token configured, notifications will only be logged");
            Arc::new(LogNotifier::new())
        }
    };

    let service = Arc::new(FeedService::new(&config, repository, fetcher, notifier)?);
    let seeded = service.seed_feeds().await?;
    tracing::info!(seeded, db = %config.db_path, "feeds ready");

    if args.once {
        service.run_once().await?;
        let sent = service.shutdown().await;
        tracing::info!(sent, "done");
        return Ok(());
    }

    let shutdown = Shutdown::new();
    let started = service.start_scheduler(shutdown.signal()).await?;
    tracing::info!(sources = started, "polling");

    let commands = match bot_token {
        Some(token) => {
            let handler = Arc::new(CommandHandler::new(Arc::clone(&service)));
            Some(handler.serve(TelegramUpdates::new(token)?, shutdown.signal()))
        }
        None => None,
    };
    service.alert("feed notifier started");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c, shutting down");
    }
    tracing::info!("shutting down");
    shutdown.trigger();
    if let Some(commands) = commands {
        if let Err(e) = commands.await {
            tracing::error!(error = %e, "command loop ended abnormally");
        }
    }
    service.alert("feed notifier stopped");

    let sent = service.shutdown().await;
    tracing::info!(sent, "bye");
    Ok(())
}
