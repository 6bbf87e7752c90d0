use env_logger;
use flood_control::config::{Config, StoreBackend};
use flood_control::retry::RetryPolicy;
use flood_control::{
    spawn_sweeper, FloodControl, MemoryStore, RedisStore, Result as FloodControlResult,
    SlidingWindowFloodControl, WindowStore,
};
use log::{error, info};
use std::env;
use std::sync::Arc;
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config_path = env::args().nth(1).unwrap_or_else(|| "Config.toml".to_string());
    let config = Config::load(&config_path)?;
    info!(
        "Loaded {}: {} requests per {}s window",
        config_path, config.flood_control.max_requests, config.flood_control.window_seconds
    );

    match config.store.backend {
        StoreBackend::Memory => run(MemoryStore::new(), &config).await,
        StoreBackend::Redis => {
            let retry = RetryPolicy::from_config(&config.retry_strategy);
            let store = RedisStore::connect(&config.store, retry).await?;
            run(store, &config).await
        }
    }
}

/// Reads one user id per line from stdin and answers with the verdict.
async fn run<S: WindowStore + 'static>(
    store: S,
    config: &Config,
) -> Result<(), Box<dyn std::error::Error>> {
    let flood_control = Arc::new(SlidingWindowFloodControl::new(
        store,
        &config.flood_control,
    )?);

    let sweeper = if config.sweeper.enabled {
        Some(spawn_sweeper(Arc::clone(&flood_control), &config.sweeper))
    } else {
        None
    };

    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = match line.parse::<i64>() {
            Ok(user_id) => verdict(user_id, flood_control.add_request(user_id).await).to_string(),
            Err(_) => format!("error: {:?} is not a user id", line),
        };

        stdout
            .write_all(format!("{} {}\n", line, reply).as_bytes())
            .await?;
        stdout.flush().await?;
    }

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    Ok(())
}

fn verdict(user_id: i64, outcome: FloodControlResult<bool>) -> &'static str {
    match outcome {
        Ok(true) => "admitted",
        Ok(false) => "rejected",
        Err(e) => {
            error!("Flood control unavailable for user {}: {}", user_id, e);
            "rejected (store error)"
        }
    }
}
