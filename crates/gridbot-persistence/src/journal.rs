//! Append-only JSON Lines journal.
//!
//! Every mutation is written as one JSON object per line and synced before
//! the in-memory index is updated:
//! - A torn final line only loses the write that was in flight
//! - Corrupt lines are skipped on replay with a warning
//! - Opening an existing journal appends, never truncates

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gridbot_core::{BotId, BoxFuture, Order, Trade};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PersistenceResult;
use crate::memory::Tables;
use crate::model::{Bot, BotStateUpdate, OrderLookup};
use crate::store::Persistence;

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
enum JournalRecord {
    BotCreated {
        bot: Bot,
    },
    BotState {
        id: BotId,
        update: BotStateUpdate,
        at: DateTime<Utc>,
    },
    OrderCreated {
        order: Order,
    },
    OrderUpdated {
        order: Order,
    },
    TradeInserted {
        trade: Trade,
    },
}

/// File-backed store: a journal on disk, tables in memory.
pub struct JournalStore {
    path: PathBuf,
    tables: RwLock<Tables>,
    writer: Mutex<BufWriter<File>>,
}

impl JournalStore {
    /// Open (or create) the journal at `path` and replay it.
    pub fn open(path: impl AsRef<Path>) -> PersistenceResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tables = Tables::default();
        let (applied, skipped) = if path.exists() {
            replay(&path, &mut tables)?
        } else {
            (0, 0)
        };
        info!(
            path = %path.display(),
            applied,
            skipped,
            "Opened journal (append mode)"
        );

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if !ends_with_newline(&path)? {
            // Terminate a torn final line so the next record starts clean
            writeln!(file)?;
        }
        Ok(Self {
            path,
            tables: RwLock::new(tables),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, record: &JournalRecord) -> PersistenceResult<()> {
        let json = serde_json::to_string(record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{json}")?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        debug!(bytes = json.len(), "Journal record appended");
        Ok(())
    }
}

fn ends_with_newline(path: &Path) -> PersistenceResult<bool> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Apply every parseable line. Returns `(applied, skipped)`.
fn replay(path: &Path, tables: &mut Tables) -> PersistenceResult<(usize, usize)> {
    let reader = BufReader::new(File::open(path)?);
    let mut applied = 0;
    let mut skipped = 0;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping corrupt journal line");
                skipped += 1;
                continue;
            }
        };
        let result = match record {
            JournalRecord::BotCreated { bot } => tables.create_bot(bot),
            JournalRecord::BotState { id, update, at } => tables.save_bot_state(id, update, at),
            JournalRecord::OrderCreated { order } => tables.create_order(order),
            JournalRecord::OrderUpdated { order } => tables.update_order(order),
            JournalRecord::TradeInserted { trade } => {
                tables.insert_trade(trade);
                Ok(())
            }
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => {
                warn!(line = index + 1, error = %e, "Skipping inapplicable journal line");
                skipped += 1;
            }
        }
    }
    Ok((applied, skipped))
}

impl Persistence for JournalStore {
    fn create_bot(&self, bot: Bot) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            let mut tables = self.tables.write();
            tables.check_new_bot(&bot)?;
            self.append(&JournalRecord::BotCreated { bot: bot.clone() })?;
            tables.create_bot(bot)
        })
    }

    fn load_bot(&self, id: BotId) -> BoxFuture<'_, PersistenceResult<Bot>> {
        Box::pin(async move { self.tables.read().load_bot(id) })
    }

    fn list_running_bots(&self) -> BoxFuture<'_, PersistenceResult<Vec<Bot>>> {
        Box::pin(async move { Ok(self.tables.read().running_bots()) })
    }

    fn save_bot_state(
        &self,
        id: BotId,
        update: BotStateUpdate,
    ) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            let mut tables = self.tables.write();
            tables.load_bot(id)?;
            let at = Utc::now();
            self.append(&JournalRecord::BotState {
                id,
                update: update.clone(),
                at,
            })?;
            tables.save_bot_state(id, update, at)
        })
    }

    fn create_order(&self, order: Order) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            let mut tables = self.tables.write();
            tables.check_new_order(&order)?;
            self.append(&JournalRecord::OrderCreated {
                order: order.clone(),
            })?;
            tables.create_order(order)
        })
    }

    fn update_order_status(&self, order: Order) -> BoxFuture<'_, PersistenceResult<()>> {
        Box::pin(async move {
            let mut tables = self.tables.write();
            tables.check_existing_order(&order)?;
            self.append(&JournalRecord::OrderUpdated {
                order: order.clone(),
            })?;
            tables.update_order(order)
        })
    }

    fn find_order(
        &self,
        bot_id: BotId,
        lookup: OrderLookup,
    ) -> BoxFuture<'_, PersistenceResult<Option<Order>>> {
        Box::pin(async move { Ok(self.tables.read().find_order(bot_id, &lookup)) })
    }

    fn list_active_orders(&self, bot_id: BotId) -> BoxFuture<'_, PersistenceResult<Vec<Order>>> {
        Box::pin(async move { Ok(self.tables.read().active_orders(bot_id)) })
    }

    fn insert_trade(&self, trade: Trade) -> BoxFuture<'_, PersistenceResult<bool>> {
        Box::pin(async move {
            let mut tables = self.tables.write();
            if tables.has_trade(&trade) {
                return Ok(false);
            }
            self.append(&JournalRecord::TradeInserted {
                trade: trade.clone(),
            })?;
            Ok(tables.insert_trade(trade))
        })
    }

    fn list_recent_trades(
        &self,
        bot_id: BotId,
        since: DateTime<Utc>,
    ) -> BoxFuture<'_, PersistenceResult<Vec<Trade>>> {
        Box::pin(async move { Ok(self.tables.read().recent_trades(bot_id, since)) })
    }
}

impl Drop for JournalStore {
    fn drop(&mut self) {
        if let Err(e) = self.writer.get_mut().flush() {
            warn!(?e, "Failed to flush journal on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridbot_core::{BotStatus, DesiredOrder, OrderSide, OrderStatus, Price, Size};
    use gridbot_strategy::{DcaConfig, DcaInterval, DcaType, IntervalPreset, StrategyConfig};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    fn dca_bot() -> Bot {
        Bot::new(
            "dca-1",
            "bob",
            "main",
            "ETH/USDT",
            StrategyConfig::Dca(DcaConfig {
                dca_type: DcaType::TimeBased,
                base_amount: dec!(100),
                interval: Some(DcaInterval::Preset(IntervalPreset::Daily)),
                drop_threshold: None,
                safety_orders: Vec::new(),
                total_budget: dec!(500),
                take_profit_percent: None,
            }),
        )
    }

    fn trade(bot_id: BotId, venue_trade_id: &str) -> Trade {
        Trade {
            id: Default::default(),
            bot_id,
            order_id: None,
            venue_order_id: None,
            venue_trade_id: venue_trade_id.to_string(),
            symbol: "ETH/USDT".to_string(),
            side: OrderSide::Buy,
            price: Price::new(dec!(2000)),
            quantity: Size::new(dec!(0.05)),
            fee: dec!(0.1),
            realized_pnl: Decimal::ZERO,
            executed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reopen_replays_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let bot = dca_bot();
        let bot_id = bot.id;
        let desired = DesiredOrder::limit(
            OrderSide::Buy,
            Price::new(dec!(2000)),
            Size::new(dec!(0.05)),
            0,
        );
        let mut order = Order::from_desired(bot_id, "ETH/USDT", &desired, Utc::now());

        {
            let store = JournalStore::open(&path).unwrap();
            store.create_bot(bot).await.unwrap();
            store
                .save_bot_state(
                    bot_id,
                    BotStateUpdate {
                        status: BotStatus::Running,
                        realized_pnl: dec!(3.25),
                        strategy_state: Some("{\"version\":1}".to_string()),
                        reason: None,
                    },
                )
                .await
                .unwrap();
            store.create_order(order.clone()).await.unwrap();
            order.transition(OrderStatus::Submitting, Utc::now()).unwrap();
            order.venue_order_id = Some("777".to_string());
            order.transition(OrderStatus::Open, Utc::now()).unwrap();
            store.update_order_status(order.clone()).await.unwrap();
            assert!(store.insert_trade(trade(bot_id, "t1")).await.unwrap());
        }

        let store = JournalStore::open(&path).unwrap();
        let loaded = store.load_bot(bot_id).await.unwrap();
        assert_eq!(loaded.status, BotStatus::Running);
        assert_eq!(loaded.realized_pnl, dec!(3.25));
        assert_eq!(loaded.strategy_state.as_deref(), Some("{\"version\":1}"));

        let found = store
            .find_order(bot_id, OrderLookup::Venue("777".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, OrderStatus::Open);

        // Dedup index survives the restart
        assert!(!store.insert_trade(trade(bot_id, "t1")).await.unwrap());
        assert_eq!(
            store
                .list_recent_trades(bot_id, DateTime::<Utc>::MIN_UTC)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_duplicate_trade_not_journaled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let store = JournalStore::open(&path).unwrap();
        let bot_id = BotId::new();

        store.insert_trade(trade(bot_id, "t1")).await.unwrap();
        store.insert_trade(trade(bot_id, "t1")).await.unwrap();

        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_line_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("journal.jsonl");
        let bot = dca_bot();
        let bot_id = bot.id;
        {
            let store = JournalStore::open(&path).unwrap();
            store.create_bot(bot).await.unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"record\":\"bot_state\",\"id\":").unwrap();
        }

        let store = JournalStore::open(&path).unwrap();
        assert_eq!(store.load_bot(bot_id).await.unwrap().name, "dca-1");

        // Still appendable after a torn line
        assert!(store.insert_trade(trade(bot_id, "t9")).await.unwrap());
        drop(store);
        let store = JournalStore::open(&path).unwrap();
        assert!(!store.insert_trade(trade(bot_id, "t9")).await.unwrap());
    }

    #[tokio::test]
    async fn test_update_unknown_order_rejected_without_write() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal.jsonl");
        let store = JournalStore::open(&path).unwrap();
        let desired = DesiredOrder::limit(
            OrderSide::Sell,
            Price::new(dec!(2100)),
            Size::new(dec!(0.05)),
            1,
        );
        let order = Order::from_desired(BotId::new(), "ETH/USDT", &desired, Utc::now());

        assert!(store.update_order_status(order).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");
    }
}
