//! DEX limit-order bot
//!
//! Run with: cargo run --bin dex_bot -- [config.toml]

use std::path::Path;

use dex_limit_bot::BotRunner;

#[tokio::main]
async fn main() {
    // APP__* overrides may live in .env
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("config.toml");
    if !Path::new(config_path).exists() {
        eprintln!("Config file '{}' not found. Copy config.example.toml to get started.", config_path);
        std::process::exit(1);
    }

    let runner = match BotRunner::new(config_path) {
        Ok(runner) => runner,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run().await {
        eprintln!("Bot execution error: {}", e);
        std::process::exit(1);
    }
}
