#![deny(unreachable_pub)]
pub mod config;
pub mod decimal;
pub mod errors;
pub mod market;
pub mod notify;
pub mod runner;
pub mod strategy;
pub mod tracking;

pub use config::{Settings, StrategyType, TradingMode};
pub use decimal::{quantity_and_adjusted_total, SizedAmount};
pub use errors::{BotError, BotResult};
pub use market::{
    DexApiProvider, Market, MarketDataProvider, MarketRegistry, OpenOrder, OrderGateway, OrderSide, PaperExchange,
    RemoteSignerGateway, Token, TradeOrder,
};
pub use notify::{BotEvent, EventKind, Notifier};
pub use runner::BotRunner;
pub use strategy::{BotContext, Strategy, StrategyKind};
pub use tracking::{TrackedOrder, TrackedOrderStore, TrackedRole};
