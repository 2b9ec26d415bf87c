//! Market data over the exchange's public REST API

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::provider::MarketDataProvider;
use super::retry::RetryPolicy;
use super::types::{BookLevel, Market, OpenOrder, OrderBook, OrderSide, Token};
use crate::config::ApiSettings;
use crate::errors::{BotError, BotResult};

/// Upper bound on open orders requested per pair
const OPEN_ORDERS_LIMIT: usize = 250;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct RawToken {
    code: String,
    precision: u32,
    contract: String,
}

impl From<RawToken> for Token {
    fn from(raw: RawToken) -> Self {
        Token::new(raw.code, raw.precision, raw.contract)
    }
}

#[derive(Debug, Deserialize)]
struct RawMarket {
    market_id: u64,
    symbol: String,
    maker_fee: Decimal,
    taker_fee: Decimal,
    bid_token: RawToken,
    ask_token: RawToken,
}

impl From<RawMarket> for Market {
    fn from(raw: RawMarket) -> Self {
        Market {
            market_id: raw.market_id,
            symbol: raw.symbol,
            maker_fee: raw.maker_fee,
            taker_fee: raw.taker_fee,
            bid_token: raw.bid_token.into(),
            ask_token: raw.ask_token.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDailyStat {
    symbol: String,
    close: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawDepthLevel {
    level: Decimal,
    #[serde(default)]
    bid: Decimal,
    #[serde(default)]
    ask: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawDepth {
    #[serde(default)]
    bids: Vec<RawDepthLevel>,
    #[serde(default)]
    asks: Vec<RawDepthLevel>,
}

/// Order ids come back as strings from some endpoints and numbers from others
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Number(u64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            RawId::Text(s) => s,
            RawId::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawOpenOrder {
    order_id: RawId,
    /// 1 = BUY, 2 = SELL
    order_side: u8,
    price: Decimal,
    quantity_curr: Decimal,
}

impl RawOpenOrder {
    fn into_open_order(self, symbol: &str) -> BotResult<OpenOrder> {
        let side = match self.order_side {
            1 => OrderSide::Buy,
            2 => OrderSide::Sell,
            other => {
                return Err(BotError::DataIntegrity(format!("unknown order side {}", other)));
            }
        };
        Ok(OpenOrder {
            order_id: self.order_id.into_string(),
            symbol: symbol.to_string(),
            side,
            price: self.price,
            quantity: self.quantity_curr,
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    token_code: String,
    token_contract: String,
    amount: Decimal,
}

fn depth_to_book(depth: RawDepth, limit: usize) -> OrderBook {
    let mut bids: Vec<BookLevel> = depth
        .bids
        .into_iter()
        .map(|l| BookLevel {
            price: l.level,
            quantity: l.bid,
        })
        .collect();
    let mut asks: Vec<BookLevel> = depth
        .asks
        .into_iter()
        .map(|l| BookLevel {
            price: l.level,
            quantity: l.ask,
        })
        .collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    asks.sort_by(|a, b| a.price.cmp(&b.price));
    bids.truncate(limit);
    asks.truncate(limit);
    OrderBook { bids, asks }
}

/// `MarketDataProvider` backed by the DEX REST API
pub struct DexApiProvider {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl DexApiProvider {
    pub fn new(settings: &ApiSettings) -> BotResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::new(settings.max_retries, settings.retry_base_delay_ms),
        })
    }

    async fn get_once<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> BotResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Http(format!("{} returned {}: {}", path, status, body)));
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    /// GET with retry; exhaustion is reported as a market data error
    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> BotResult<T> {
        debug!("GET {} {:?}", path, query);
        self.retry
            .run(path, || self.get_once(path, query))
            .await
            .map_err(|e| BotError::MarketData(e.to_string()))
    }
}

#[async_trait]
impl MarketDataProvider for DexApiProvider {
    async fn fetch_markets(&self) -> BotResult<Vec<Market>> {
        let raw: Vec<RawMarket> = self.get("/dex/v1/markets/all", &[]).await?;
        Ok(raw.into_iter().map(Market::from).collect())
    }

    async fn fetch_latest_price(&self, symbol: &str) -> BotResult<Decimal> {
        let stats: Vec<RawDailyStat> = self.get("/dex/v1/trades/daily", &[]).await?;
        stats
            .into_iter()
            .find(|s| s.symbol == symbol)
            .map(|s| s.close)
            .ok_or_else(|| BotError::MarketNotFound(symbol.to_string()))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> BotResult<OrderBook> {
        let raw: RawDepth = self
            .get(
                "/dex/v1/orders/depth",
                &[("symbol", symbol.to_string()), ("limit", depth.to_string())],
            )
            .await?;
        Ok(depth_to_book(raw, depth))
    }

    async fn fetch_pair_open_orders(&self, account: &str, symbol: &str) -> BotResult<Vec<OpenOrder>> {
        let raw: Vec<RawOpenOrder> = self
            .get(
                "/dex/v1/orders/open",
                &[
                    ("account", account.to_string()),
                    ("symbol", symbol.to_string()),
                    ("limit", OPEN_ORDERS_LIMIT.to_string()),
                ],
            )
            .await?;
        raw.into_iter().map(|o| o.into_open_order(symbol)).collect()
    }

    async fn fetch_token_balance(&self, account: &str, contract: &str, code: &str) -> BotResult<Decimal> {
        let balances: Vec<RawBalance> = self
            .get("/dex/v1/account/balances", &[("account", account.to_string())])
            .await?;
        Ok(balances
            .into_iter()
            .find(|b| b.token_code == code && b.token_contract == contract)
            .map(|b| b.amount)
            .unwrap_or(Decimal::ZERO))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_markets() {
        let json = r#"{"data":[{"market_id":1,"symbol":"XPR_XUSDC","maker_fee":"0.001","taker_fee":0.002,
            "bid_token":{"code":"XPR","precision":4,"contract":"eosio.token","multiplier":10000},
            "ask_token":{"code":"XUSDC","precision":6,"contract":"xtokens","multiplier":1000000}}]}"#;

        let envelope: Envelope<Vec<RawMarket>> = serde_json::from_str(json).unwrap();
        let market: Market = envelope.data.into_iter().next().unwrap().into();

        assert_eq!(market.symbol, "XPR_XUSDC");
        assert_eq!(market.maker_fee, dec!(0.001));
        assert_eq!(market.bid_token.multiplier, dec!(10000));
        assert_eq!(market.ask_token.precision, 6);
    }

    #[test]
    fn test_parse_open_orders_with_mixed_ids() {
        let json = r#"{"data":[
            {"order_id":"1001","order_side":1,"price":"0.005141","quantity_curr":"27.0"},
            {"order_id":1002,"order_side":2,"price":"0.005159","quantity_curr":"5250"}]}"#;

        let envelope: Envelope<Vec<RawOpenOrder>> = serde_json::from_str(json).unwrap();
        let orders: Vec<OpenOrder> = envelope
            .data
            .into_iter()
            .map(|o| o.into_open_order("XPR_XUSDC").unwrap())
            .collect();

        assert_eq!(orders[0].order_id, "1001");
        assert_eq!(orders[0].side, OrderSide::Buy);
        assert_eq!(orders[1].order_id, "1002");
        assert_eq!(orders[1].side, OrderSide::Sell);
        assert_eq!(orders[1].price, dec!(0.005159));
    }

    #[test]
    fn test_unknown_side_is_integrity_error() {
        let raw = RawOpenOrder {
            order_id: RawId::Number(1),
            order_side: 7,
            price: dec!(1),
            quantity_curr: dec!(1),
        };
        assert!(raw.into_open_order("XPR_XUSDC").unwrap_err().is_skip_condition());
    }

    #[test]
    fn test_depth_sorted_and_truncated() {
        let json = r#"{"bids":[{"level":"0.0050","bid":"10"},{"level":"0.0051","bid":"5"}],
            "asks":[{"level":"0.0053","ask":"1"},{"level":"0.0052","ask":"2"},{"level":"0.0054","ask":"3"}]}"#;
        let raw: RawDepth = serde_json::from_str(json).unwrap();
        let book = depth_to_book(raw, 2);

        assert_eq!(book.best_bid(), Some(dec!(0.0051)));
        assert_eq!(book.best_ask(), Some(dec!(0.0052)));
        assert_eq!(book.asks.len(), 2);
    }
}
