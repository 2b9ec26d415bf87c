//! Order submission abstraction - enables mocking for tests

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use super::types::TradeOrder;
use crate::config::ExecutionSettings;
use crate::errors::{BotError, BotResult};

/// Signing and broadcasting side of the exchange
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Stage every order and flush them as one transaction, paired with a
    /// withdraw-all of settled balances
    async fn submit_orders(&self, orders: &[TradeOrder]) -> BotResult<()>;

    /// Cancel one resting order by its exchange id
    async fn cancel_order(&self, order_id: &str) -> BotResult<()>;

    /// Cancel every resting order of the account
    async fn cancel_all_orders(&self) -> BotResult<()>;

    /// Move settled and released funds back to the account
    async fn withdraw_all(&self) -> BotResult<()>;
}

/// A batched submission that stopped partway
#[derive(Debug)]
pub struct PartialSubmission {
    /// Leading orders that reached the book before the failing batch
    pub accepted: usize,
    pub error: BotError,
}

impl From<PartialSubmission> for BotError {
    fn from(partial: PartialSubmission) -> Self {
        partial.error
    }
}

/// Submit `orders` in chunks of `execution.batch_size`, pausing after every
/// chunk including the final partial one.
///
/// Stops at the first failing chunk; the error carries how many leading orders
/// were already accepted.
pub async fn submit_in_batches(
    gateway: &dyn OrderGateway,
    orders: &[TradeOrder],
    execution: &ExecutionSettings,
) -> Result<(), PartialSubmission> {
    let pause = Duration::from_millis(execution.batch_pause_ms);
    let mut accepted = 0;

    for (index, chunk) in orders.chunks(execution.batch_size.max(1)).enumerate() {
        debug!("Submitting batch {} ({} orders)", index + 1, chunk.len());
        if let Err(error) = gateway.submit_orders(chunk).await {
            return Err(PartialSubmission { accepted, error });
        }
        accepted += chunk.len();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::paper::PaperExchange;
    use crate::strategy::test_support::xpr_market;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_submit_in_batches_chunks_by_ten() {
        let exchange = PaperExchange::new().with_markets(vec![xpr_market()]);
        exchange.set_balance("XPR", dec!(1000000)).await;

        let orders: Vec<TradeOrder> = (1..=23)
            .map(|i| TradeOrder::sell("XPR_XUSDC", dec!(0.01) + Decimal::new(i, 4), dec!(10)))
            .collect();
        let execution = ExecutionSettings {
            batch_size: 10,
            batch_pause_ms: 0,
            ..ExecutionSettings::default()
        };

        submit_in_batches(&exchange, &orders, &execution).await.unwrap();

        let sizes: Vec<usize> = exchange.submitted_batches().await.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
    }

    #[tokio::test]
    async fn test_failed_batch_reports_accepted_prefix() {
        let exchange = PaperExchange::new().with_markets(vec![xpr_market()]);
        exchange.set_balance("XPR", dec!(1000000)).await;
        exchange.fail_after_batches(2).await;

        let orders: Vec<TradeOrder> = (1..=23)
            .map(|i| TradeOrder::sell("XPR_XUSDC", dec!(0.01) + Decimal::new(i, 4), dec!(10)))
            .collect();
        let execution = ExecutionSettings {
            batch_size: 10,
            batch_pause_ms: 0,
            ..ExecutionSettings::default()
        };

        let partial = submit_in_batches(&exchange, &orders, &execution).await.unwrap_err();

        assert_eq!(partial.accepted, 20);
        assert!(matches!(partial.error, BotError::Gateway(_)));
        assert_eq!(exchange.open_orders().await.len(), 20);
    }
}
