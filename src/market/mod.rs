//! Exchange-facing collaborators
//!
//! Market metadata and order types, the read-only [`MarketRegistry`], and the
//! two seams the strategies talk to the exchange through:
//!
//! - [`MarketDataProvider`]: prices, order books, open orders, balances
//! - [`OrderGateway`]: order submission, cancellation, withdrawal
//!
//! Live trading pairs [`DexApiProvider`] with [`RemoteSignerGateway`]; paper
//! trading routes both seams through a [`PaperExchange`].

mod gateway;
mod http;
mod paper;
mod provider;
mod registry;
mod retry;
mod signer;
mod types;

pub use gateway::{submit_in_batches, OrderGateway, PartialSubmission};
pub use http::DexApiProvider;
pub use paper::PaperExchange;
pub use provider::MarketDataProvider;
pub use registry::MarketRegistry;
pub use retry::RetryPolicy;
pub use signer::{RemoteSignerGateway, StagedOrder};
pub use types::{BookLevel, Market, OpenOrder, OrderBook, OrderSide, Token, TradeOrder};
