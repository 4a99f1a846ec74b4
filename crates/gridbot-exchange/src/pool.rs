//! Shared connectors per exchange account.
//!
//! Bots trading on the same account share one connector, so they share its
//! rate limiter and user stream. The connector is shut down when the last
//! bot releases it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::connector::ExchangeConnector;
use crate::error::ExchangeResult;

/// Identifies an exchange account, e.g. `binance:main`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountKey(pub String);

impl AccountKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl fmt::Display for AccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct PoolEntry {
    connector: Arc<dyn ExchangeConnector>,
    refs: usize,
}

/// Reference-counted connector registry.
#[derive(Default)]
pub struct ConnectorPool {
    entries: Mutex<HashMap<AccountKey, PoolEntry>>,
}

impl ConnectorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the account's connector, building it with `factory` on first use.
    pub fn acquire<F>(&self, key: &AccountKey, factory: F) -> ExchangeResult<Arc<dyn ExchangeConnector>>
    where
        F: FnOnce() -> ExchangeResult<Arc<dyn ExchangeConnector>>,
    {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.refs += 1;
            return Ok(Arc::clone(&entry.connector));
        }

        let connector = factory()?;
        info!(account = %key, venue = connector.name(), "Connector created");
        entries.insert(
            key.clone(),
            PoolEntry {
                connector: Arc::clone(&connector),
                refs: 1,
            },
        );
        Ok(connector)
    }

    /// Drop one reference. The last release shuts the connector down.
    pub async fn release(&self, key: &AccountKey) {
        let retired = {
            let mut entries = self.entries.lock();
            match entries.get_mut(key) {
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    None
                }
                Some(_) => entries.remove(key).map(|e| e.connector),
                None => None,
            }
        };

        if let Some(connector) = retired {
            info!(account = %key, "Last bot released connector, shutting down");
            connector.shutdown().await;
        }
    }

    pub fn ref_count(&self, key: &AccountKey) -> usize {
        self.entries.lock().get(key).map_or(0, |e| e.refs)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Shut down every pooled connector regardless of references.
    pub async fn shutdown_all(&self) {
        let connectors: Vec<_> = self
            .entries
            .lock()
            .drain()
            .map(|(_, e)| e.connector)
            .collect();
        for connector in connectors {
            connector.shutdown().await;
        }
    }
}
