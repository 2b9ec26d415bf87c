//! Live order gateway backed by an external signing/broadcasting service
//!
//! Orders are staged locally into the exchange's action format and posted as
//! one transaction. The service signs, broadcasts, and appends a withdraw-all
//! to every order transaction.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::gateway::OrderGateway;
use super::registry::MarketRegistry;
use super::retry::RetryPolicy;
use super::types::{OrderSide, TradeOrder};
use crate::config::GatewaySettings;
use crate::errors::{BotError, BotResult};

/// One limit order in the exchange's action format
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedOrder {
    pub market_id: u64,
    /// 1 = BUY, 2 = SELL
    pub order_side: u8,
    pub price: Decimal,
    pub quantity: Decimal,
    /// Contract of the token the quantity is denominated in
    pub token_contract: String,
    pub token_code: String,
}

#[derive(Debug, Serialize)]
struct OrdersRequest<'a> {
    account: &'a str,
    orders: &'a [StagedOrder],
    withdraw_all: bool,
}

#[derive(Debug, Serialize)]
struct CancelRequest<'a> {
    account: &'a str,
    order_id: &'a str,
}

#[derive(Debug, Serialize)]
struct AccountRequest<'a> {
    account: &'a str,
}

#[derive(Debug, Deserialize)]
struct SignerResponse {
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// `OrderGateway` that posts signed actions through a remote signer
pub struct RemoteSignerGateway {
    http: Client,
    signer_url: String,
    account: String,
    markets: MarketRegistry,
    retry: RetryPolicy,
}

impl RemoteSignerGateway {
    pub fn new(settings: &GatewaySettings, account: &str, markets: MarketRegistry) -> BotResult<Self> {
        let signer_url = settings
            .signer_url
            .as_deref()
            .ok_or_else(|| BotError::Config("gateway.signer_url is required in live mode".into()))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            signer_url: signer_url.trim_end_matches('/').to_string(),
            account: account.to_string(),
            markets,
            retry: RetryPolicy::new(settings.max_retries, settings.retry_base_delay_ms),
        })
    }

    /// Stage a limit order: resolve the market id and the token the quantity is paid in
    pub fn prepare_limit_order(&self, order: &TradeOrder) -> BotResult<StagedOrder> {
        let market = self.markets.require(&order.symbol)?;
        let (order_side, token) = match order.side {
            OrderSide::Buy => (1, &market.ask_token),
            OrderSide::Sell => (2, &market.bid_token),
        };

        Ok(StagedOrder {
            market_id: market.market_id,
            order_side,
            price: market.round_price(order.price),
            quantity: token.round(order.quantity),
            token_contract: token.contract.clone(),
            token_code: token.code.clone(),
        })
    }

    async fn post_once<B: Serialize + Sync>(&self, path: &str, body: &B) -> BotResult<Option<String>> {
        let url = format!("{}{}", self.signer_url, path);
        let response = self.http.post(&url).json(body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BotError::Gateway(format!("{} returned {}: {}", path, status, body)));
        }

        let parsed: SignerResponse = response.json().await?;
        if let Some(error) = parsed.error {
            return Err(BotError::Gateway(error));
        }
        Ok(parsed.transaction_id)
    }

    async fn post<B: Serialize + Sync>(&self, path: &str, body: &B) -> BotResult<()> {
        let tx = self.retry.run(path, || self.post_once(path, body)).await?;
        debug!("{} accepted (tx {})", path, tx.as_deref().unwrap_or("-"));
        Ok(())
    }
}

#[async_trait]
impl OrderGateway for RemoteSignerGateway {
    async fn submit_orders(&self, orders: &[TradeOrder]) -> BotResult<()> {
        if orders.is_empty() {
            return Ok(());
        }
        let staged = orders
            .iter()
            .map(|o| self.prepare_limit_order(o))
            .collect::<BotResult<Vec<_>>>()?;

        self.post(
            "/orders",
            &OrdersRequest {
                account: &self.account,
                orders: &staged,
                withdraw_all: true,
            },
        )
        .await?;
        info!("Submitted {} orders", staged.len());
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> BotResult<()> {
        self.post(
            "/cancel",
            &CancelRequest {
                account: &self.account,
                order_id,
            },
        )
        .await
    }

    async fn cancel_all_orders(&self) -> BotResult<()> {
        self.post("/cancel-all", &AccountRequest { account: &self.account }).await
    }

    async fn withdraw_all(&self) -> BotResult<()> {
        self.post("/withdraw-all", &AccountRequest { account: &self.account }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::xpr_market;
    use rust_decimal_macros::dec;

    fn gateway() -> RemoteSignerGateway {
        let settings = GatewaySettings {
            signer_url: Some("http://localhost:8090/".into()),
            ..GatewaySettings::default()
        };
        RemoteSignerGateway::new(&settings, "trader", MarketRegistry::new(vec![xpr_market()])).unwrap()
    }

    #[test]
    fn test_prepare_sell_uses_bid_token() {
        let staged = gateway()
            .prepare_limit_order(&TradeOrder::sell("XPR_XUSDC", dec!(0.0051594), dec!(5250.00004)))
            .unwrap();

        assert_eq!(staged.order_side, 2);
        assert_eq!(staged.price, dec!(0.005159));
        assert_eq!(staged.quantity, dec!(5250.0000));
        assert_eq!(staged.token_code, "XPR");
    }

    #[test]
    fn test_prepare_buy_uses_ask_token() {
        let staged = gateway()
            .prepare_limit_order(&TradeOrder::buy("XPR_XUSDC", dec!(0.005141), dec!(27.0)))
            .unwrap();

        assert_eq!(staged.order_side, 1);
        assert_eq!(staged.token_contract, "xtokens");
    }

    #[test]
    fn test_prepare_unknown_market() {
        let err = gateway()
            .prepare_limit_order(&TradeOrder::buy("XETH_XUSDC", dec!(1), dec!(1)))
            .unwrap_err();
        assert!(matches!(err, BotError::MarketNotFound(_)));
    }

    #[test]
    fn test_live_gateway_requires_signer_url() {
        let result = RemoteSignerGateway::new(&GatewaySettings::default(), "trader", MarketRegistry::default());
        assert!(matches!(result, Err(BotError::Config(_))));
    }
}
