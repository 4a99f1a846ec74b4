//! Connector lifecycle per configured account.
//!
//! Wraps the shared [`ConnectorPool`] with the knowledge of how to build a
//! connector for each account: one rate limiter per account, credentials
//! from the environment, and paper venues optionally priced from a live
//! account's ticker.

use std::collections::HashMap;
use std::sync::Arc;

use gridbot_core::Price;
use gridbot_exchange::{
    AccountKey, BinanceConnector, ConnectorPool, Credentials, ExchangeConnector, ExchangeResult,
    PaperExchange, RateLimiter, RetryPolicy,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{AccountConfig, VenueKind};
use crate::error::{AppError, AppResult};

pub struct AccountConnectors {
    accounts: HashMap<String, AccountConfig>,
    limiters: HashMap<String, Arc<RateLimiter>>,
    retry: RetryPolicy,
    pool: ConnectorPool,
    /// Serializes acquire and release so a price source is taken and
    /// returned together with the paper account that uses it.
    lifecycle: Mutex<()>,
}

impl AccountConnectors {
    pub fn new(accounts: &[AccountConfig], retry: RetryPolicy) -> Self {
        let limiters = accounts
            .iter()
            .map(|a| {
                let limiter = RateLimiter::new(a.rate_limit.max_requests, a.rate_limit.window());
                (a.name.clone(), Arc::new(limiter))
            })
            .collect();
        Self {
            accounts: accounts
                .iter()
                .map(|a| (a.name.clone(), a.clone()))
                .collect(),
            limiters,
            retry,
            pool: ConnectorPool::new(),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn account(&self, name: &str) -> AppResult<&AccountConfig> {
        self.accounts
            .get(name)
            .ok_or_else(|| AppError::Config(format!("unknown account '{name}'")))
    }

    /// Take a reference to the account's connector, building it on first use.
    pub async fn acquire(&self, name: &str) -> AppResult<Arc<dyn ExchangeConnector>> {
        let _guard = self.lifecycle.lock().await;
        let account = self.account(name)?;
        let key = AccountKey::new(name);

        // A paper account holds one reference on its price source for as
        // long as it is pooled.
        let source = match &account.paper.price_source {
            Some(source) if self.pool.ref_count(&key) == 0 => {
                let source_account = self.account(source)?;
                let connector = self
                    .pool
                    .acquire(&AccountKey::new(source), || self.build(source_account, None))?;
                Some(connector)
            }
            _ => None,
        };

        let acquired = self.pool.acquire(&key, || self.build(account, source.clone()));
        match acquired {
            Ok(connector) => Ok(connector),
            Err(e) => {
                if let (Some(_), Some(name)) = (&source, &account.paper.price_source) {
                    self.pool.release(&AccountKey::new(name.as_str())).await;
                }
                Err(e.into())
            }
        }
    }

    /// Drop one reference. The last release shuts the connector down and
    /// returns its price source.
    pub async fn release(&self, name: &str) {
        let _guard = self.lifecycle.lock().await;
        let key = AccountKey::new(name);
        if self.pool.ref_count(&key) == 0 {
            return;
        }
        self.pool.release(&key).await;
        if self.pool.ref_count(&key) > 0 {
            return;
        }
        let source = self
            .accounts
            .get(name)
            .and_then(|a| a.paper.price_source.clone());
        if let Some(source) = source {
            debug!(account = name, source = %source, "Releasing price source");
            self.pool.release(&AccountKey::new(source)).await;
        }
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.pool.ref_count(&AccountKey::new(name))
    }

    pub async fn shutdown_all(&self) {
        let _guard = self.lifecycle.lock().await;
        self.pool.shutdown_all().await;
    }

    fn build(
        &self,
        account: &AccountConfig,
        price_source: Option<Arc<dyn ExchangeConnector>>,
    ) -> ExchangeResult<Arc<dyn ExchangeConnector>> {
        match account.venue {
            VenueKind::Binance => {
                let credentials =
                    Credentials::from_env(&account.api_key_env, &account.api_secret_env)?;
                let limiter = self.limiters.get(&account.name).cloned().unwrap_or_else(|| {
                    Arc::new(RateLimiter::new(
                        account.rate_limit.max_requests,
                        account.rate_limit.window(),
                    ))
                });
                let connector = BinanceConnector::new(
                    account.binance_config(),
                    credentials,
                    limiter,
                    self.retry.clone(),
                )?;
                info!(
                    account = %account.name,
                    testnet = account.testnet,
                    "Binance connector built"
                );
                Ok(Arc::new(connector))
            }
            VenueKind::Paper => {
                let mut paper = PaperExchange::new();
                if let Some(fee_rate) = account.paper.fee_rate {
                    paper = paper.with_fee_rate(fee_rate);
                }
                if let Some(source) = price_source {
                    paper = paper.with_price_source(source);
                }
                for (asset, amount) in &account.paper.balances {
                    paper.deposit(&asset.to_uppercase(), *amount);
                }
                for (symbol, price) in &account.paper.prices {
                    paper.set_price(&symbol.to_uppercase(), Price::new(*price));
                }
                info!(
                    account = %account.name,
                    price_source = account.paper.price_source.as_deref().unwrap_or("static"),
                    "Paper venue built"
                );
                Ok(Arc::new(paper))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use rust_decimal_macros::dec;

    const ACCOUNTS: &str = r#"
[[accounts]]
name = "live"
venue = "binance"
testnet = true
api_key_env = "GRIDBOT_TEST_ACCOUNTS_KEY"
api_secret_env = "GRIDBOT_TEST_ACCOUNTS_SECRET"

[[accounts]]
name = "sim"
venue = "paper"

[accounts.paper.balances]
usdt = "5000"

[accounts.paper.prices]
"BTC/USDT" = "30000"

[[accounts]]
name = "shadow"
venue = "paper"

[accounts.paper]
price_source = "live"
"#;

    fn connectors() -> AccountConnectors {
        let config = AppConfig::from_toml_str(ACCOUNTS).unwrap();
        AccountConnectors::new(&config.accounts, RetryPolicy::immediate(1))
    }

    #[tokio::test]
    async fn test_bots_on_one_account_share_a_connector() {
        let connectors = connectors();
        let a = connectors.acquire("sim").await.unwrap();
        let b = connectors.acquire("sim").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(connectors.ref_count("sim"), 2);

        connectors.release("sim").await;
        connectors.release("sim").await;
        assert_eq!(connectors.ref_count("sim"), 0);
        // Extra release is harmless
        connectors.release("sim").await;
    }

    #[tokio::test]
    async fn test_paper_account_seeded_from_config() {
        let connectors = connectors();
        let venue = connectors.acquire("sim").await.unwrap();

        let ticker = venue.get_ticker("BTC/USDT").await.unwrap();
        assert_eq!(ticker.last, Price::new(dec!(30000)));
        let usdt = venue.get_balance("USDT").await.unwrap();
        assert_eq!(usdt.free, dec!(5000));
    }

    #[tokio::test]
    async fn test_price_source_follows_paper_account() {
        std::env::set_var("GRIDBOT_TEST_ACCOUNTS_KEY", "key");
        std::env::set_var("GRIDBOT_TEST_ACCOUNTS_SECRET", "secret");
        let connectors = connectors();

        connectors.acquire("shadow").await.unwrap();
        connectors.acquire("shadow").await.unwrap();
        assert_eq!(connectors.ref_count("live"), 1);

        connectors.release("shadow").await;
        assert_eq!(connectors.ref_count("live"), 1);
        connectors.release("shadow").await;
        assert_eq!(connectors.ref_count("live"), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_acquire() {
        let config = AppConfig::from_toml_str(
            r#"
[[accounts]]
name = "live"
venue = "binance"
api_key_env = "GRIDBOT_TEST_UNSET_KEY"
api_secret_env = "GRIDBOT_TEST_UNSET_SECRET"
"#,
        )
        .unwrap();
        let connectors = AccountConnectors::new(&config.accounts, RetryPolicy::immediate(1));

        let err = connectors.acquire("live").await.err().unwrap();
        assert!(matches!(err, AppError::Exchange(_)), "{err}");
        assert_eq!(connectors.ref_count("live"), 0);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let connectors = connectors();
        let err = connectors.acquire("nope").await.err().unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }
}
