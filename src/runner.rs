use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{Settings, TradingMode};
use crate::errors::{BotError, BotResult};
use crate::market::{DexApiProvider, MarketDataProvider, MarketRegistry, OrderGateway, PaperExchange, RemoteSignerGateway};
use crate::notify::{spawn_worker, EventKind, HttpTransport, Notifier};
use crate::strategy::{BotContext, Strategy, StrategyKind};
use crate::tracking::{OrderStateWriter, TrackedOrderStore};

/// Runner for the trading bot
pub struct BotRunner {
    settings: Settings,
}

impl BotRunner {
    /// Create a new runner from a configuration file
    pub fn new(config_path: impl AsRef<Path>) -> BotResult<Self> {
        let path = config_path.as_ref();
        let path = path
            .to_str()
            .ok_or_else(|| BotError::Config(format!("config path {} is not valid UTF-8", path.display())))?;
        Self::from_settings(Settings::new(path)?)
    }

    /// Create a runner from already loaded settings; invalid settings are rejected here
    pub fn from_settings(settings: Settings) -> BotResult<Self> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Id stamped on every event; falls back to `{account}-{strategy}`
    fn instance_id(&self) -> String {
        self.settings
            .bot
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.settings.bot.account, self.settings.bot.strategy.as_str()))
    }

    fn init_logging(&self) {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", &self.settings.log.level);
        }
        env_logger::try_init().ok();
    }

    /// Run the bot until SIGINT or SIGTERM
    pub async fn run(self) -> BotResult<()> {
        self.init_logging();
        info!(
            "Starting {} bot for {} ({} mode)",
            self.settings.bot.strategy.as_str(),
            self.settings.bot.account,
            self.settings.bot.mode.as_str()
        );

        let (markets, provider, gateway) = self.connect().await?;
        self.run_with(markets, provider, gateway, shutdown_signal()).await
    }

    /// Build the market-data provider and order gateway for the configured mode
    /// and load the market listing once
    async fn connect(&self) -> BotResult<(MarketRegistry, Arc<dyn MarketDataProvider>, Arc<dyn OrderGateway>)> {
        let api = Arc::new(DexApiProvider::new(&self.settings.api)?);

        match self.settings.bot.mode {
            TradingMode::Paper => {
                info!("Initializing PAPER exchange over {}", self.settings.api.base_url);
                let paper = Arc::new(PaperExchange::with_feed(api));
                for (code, amount) in self.settings.paper.normalized_balances() {
                    info!("Paper balance {}: {}", code, amount);
                    paper.set_balance(&code, amount).await;
                }
                let markets = MarketRegistry::load(paper.as_ref()).await?;
                let provider: Arc<dyn MarketDataProvider> = paper.clone();
                let gateway: Arc<dyn OrderGateway> = paper;
                Ok((markets, provider, gateway))
            }
            TradingMode::Live => {
                info!("Initializing LIVE gateway");
                let markets = MarketRegistry::load(api.as_ref()).await?;
                let gateway: Arc<dyn OrderGateway> = Arc::new(RemoteSignerGateway::new(
                    &self.settings.gateway,
                    &self.settings.bot.account,
                    markets.clone(),
                )?);
                let provider: Arc<dyn MarketDataProvider> = api;
                Ok((markets, provider, gateway))
            }
        }
    }

    fn start_notifier(&self, instance_id: &str) -> BotResult<(Notifier, Option<JoinHandle<()>>)> {
        let settings = &self.settings.notifications;
        match settings.endpoint.as_deref() {
            Some(endpoint) => {
                let (notifier, queue) = Notifier::channel(instance_id, settings.queue_capacity);
                let transport = Arc::new(HttpTransport::new(endpoint, settings.timeout_secs)?);
                info!("Delivering notifications to {}", endpoint);
                Ok((notifier, Some(spawn_worker(queue, transport, settings))))
            }
            None => {
                info!("No notification endpoint configured, events are only logged");
                Ok((Notifier::disabled(instance_id), None))
            }
        }
    }

    /// Poll the strategy over the given collaborators until `shutdown` resolves,
    /// then cancel tracked orders and drain the notification queue.
    ///
    /// A poll in progress always runs to completion before shutdown is handled.
    pub async fn run_with<F>(
        self,
        markets: MarketRegistry,
        provider: Arc<dyn MarketDataProvider>,
        gateway: Arc<dyn OrderGateway>,
        shutdown: F,
    ) -> BotResult<()>
    where
        F: Future<Output = ()>,
    {
        let bot = &self.settings.bot;
        let instance_id = self.instance_id();
        let (notifier, worker) = self.start_notifier(&instance_id)?;
        info!("Loaded {} markets", markets.len());

        let state_dir = bot.state_dir.as_deref();
        let store = TrackedOrderStore::new(state_dir, bot.instance_id.as_deref());
        if !store.is_enabled() {
            warn!("bot.state_dir or bot.instance_id not set, tracked orders will not survive a restart");
        }
        let snapshots = OrderStateWriter::new(state_dir, bot.instance_id.as_deref());

        let mut strategy = StrategyKind::from_settings(&self.settings, store)?;
        let ctx = BotContext {
            account: bot.account.clone(),
            markets: Arc::new(markets),
            provider,
            gateway,
            notifier,
            execution: self.settings.execution.clone(),
        };

        strategy.initialize(&ctx).await?;
        let symbols = strategy.symbols();
        info!("Strategy '{}' initialized for {}", strategy.name(), symbols.join(", "));
        ctx.notifier.emit(
            EventKind::BotStarted,
            json!({
                "strategy": strategy.name(),
                "mode": bot.mode.as_str(),
                "account": bot.account,
                "symbols": symbols,
            }),
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(bot.poll_interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = strategy.trade(&ctx).await {
                        error!("Poll failed: {}", e);
                        ctx.notifier.emit(
                            EventKind::BotError,
                            json!({ "strategy": strategy.name(), "error": e.to_string() }),
                        );
                    }
                    snapshots.record(ctx.provider.as_ref(), &ctx.account, &symbols).await;
                }
            }
        }

        let outcome = strategy.cancel_own_orders(&ctx).await;
        if let Err(e) = &outcome {
            error!("Failed to cancel tracked orders: {}", e);
        }
        ctx.notifier.emit(
            EventKind::BotStopped,
            json!({ "strategy": strategy.name(), "clean": outcome.is_ok() }),
        );
        ctx.notifier.flush().await;
        ctx.notifier.shutdown().await;
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Notification worker ended abnormally: {}", e);
            }
        }
        if ctx.notifier.dropped_count() > 0 {
            warn!("{} notifications were dropped on a full queue", ctx.notifier.dropped_count());
        }

        info!("Bot stopped");
        Ok(())
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{paper_exchange, xpr_market, SYMBOL};
    use rust_decimal_macros::dec;

    const GRID_CONFIG: &str = r#"
        [bot]
        account = "trader"
        strategy = "grid"
        poll_interval_secs = 60

        [execution]
        batch_pause_ms = 0
        rebalance_pause_ms = 0

        [[grid.pairs]]
        symbol = "XPR_XUSDC"
        upper_limit = "60"
        lower_limit = "40"
        grid_levels = 4
        bid_amount_per_level = "100"
    "#;

    #[test]
    fn test_live_mode_requires_signer() {
        let mut settings = Settings::from_toml(GRID_CONFIG).unwrap();
        settings.bot.mode = TradingMode::Live;

        let result = BotRunner::from_settings(settings);
        assert!(matches!(result, Err(BotError::Config(_))));
    }

    #[test]
    fn test_default_instance_id() {
        let runner = BotRunner::from_settings(Settings::from_toml(GRID_CONFIG).unwrap()).unwrap();
        assert_eq!(runner.instance_id(), "trader-grid");
    }

    #[tokio::test]
    async fn test_polls_then_cancels_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::from_toml(GRID_CONFIG).unwrap();
        settings.bot.instance_id = Some("runner-test".into());
        settings.bot.state_dir = Some(dir.path().to_path_buf());

        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(1000)).await;
        exchange.set_balance("XUSDC", dec!(100)).await;
        exchange.set_price(SYMBOL, dec!(0.005)).await.unwrap();

        let runner = BotRunner::from_settings(settings).unwrap();
        runner
            .run_with(
                MarketRegistry::new(vec![xpr_market()]),
                exchange.clone(),
                exchange.clone(),
                tokio::time::sleep(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert_eq!(exchange.submitted_orders().await.len(), 3);
        assert_eq!(exchange.cancelled_ids().await.len(), 3);
        assert!(exchange.open_orders().await.is_empty());
        assert!(dir.path().join("runner-test-order-state.json").exists());
        assert!(!dir.path().join("runner-test-tracked-orders.json").exists());
    }
}
