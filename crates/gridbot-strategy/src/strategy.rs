//! Closed strategy dispatch and the versioned state blob.

use gridbot_core::{ActiveOrder, DesiredOrder, MarketSnapshot, Price, StrategyKind, SymbolRules};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::StrategyConfig;
use crate::dca::{DcaState, DcaStrategy};
use crate::error::{StrategyError, StrategyResult};
use crate::fill::StrategyFill;
use crate::grid::{GridState, GridStrategy};

/// Current state blob format.
pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StrategyState {
    Grid(GridState),
    Dca(DcaState),
}

/// Persisted envelope around strategy state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBlob {
    pub version: u32,
    pub state: StrategyState,
}

impl StateBlob {
    /// Parse a stored blob, migrating older formats to the current one.
    pub fn decode(raw: &str) -> StrategyResult<Self> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        match version {
            STATE_VERSION => Ok(serde_json::from_value(value)?),
            other => Err(StrategyError::UnsupportedStateVersion(other)),
        }
    }

    pub fn encode(&self) -> StrategyResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A bot's strategy. Pure: never performs I/O.
#[derive(Debug, Clone)]
pub enum Strategy {
    Grid(GridStrategy),
    Dca(DcaStrategy),
}

impl Strategy {
    /// Build and validate from configuration against the venue's symbol rules.
    pub fn from_config(config: &StrategyConfig, rules: &SymbolRules) -> StrategyResult<Self> {
        match config {
            StrategyConfig::Grid(c) => Ok(Self::Grid(GridStrategy::new(c.clone(), rules)?)),
            StrategyConfig::Dca(c) => Ok(Self::Dca(DcaStrategy::new(c.clone(), rules)?)),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Grid(_) => StrategyKind::Grid,
            Self::Dca(_) => StrategyKind::Dca,
        }
    }

    pub fn calculate_orders(&mut self, snapshot: &MarketSnapshot) -> Vec<DesiredOrder> {
        match self {
            Self::Grid(s) => s.calculate_orders(snapshot),
            Self::Dca(s) => s.calculate_orders(snapshot),
        }
    }

    pub fn on_order_filled(&mut self, fill: &StrategyFill) {
        match self {
            Self::Grid(s) => s.on_order_filled(fill),
            Self::Dca(s) => s.on_order_filled(fill),
        }
    }

    pub fn should_stop(&self) -> bool {
        match self {
            Self::Grid(s) => s.should_stop(),
            Self::Dca(s) => s.should_stop(),
        }
    }

    /// Resting orders must be cancelled before the strategy can proceed.
    pub fn wants_flat_book(&self) -> bool {
        match self {
            Self::Grid(s) => s.is_unwinding(),
            Self::Dca(_) => false,
        }
    }

    pub fn unrealized_pnl(&self, mark: Price) -> Decimal {
        match self {
            Self::Grid(s) => s.unrealized_pnl(mark),
            Self::Dca(s) => s.unrealized_pnl(mark),
        }
    }

    /// Attach active orders reported after a restart without re-seeding.
    pub fn rehydrate(&mut self, active: &[ActiveOrder]) {
        if let Self::Grid(s) = self {
            s.rehydrate(active);
        }
    }

    pub fn snapshot_state(&self) -> StateBlob {
        let state = match self {
            Self::Grid(s) => StrategyState::Grid(s.state().clone()),
            Self::Dca(s) => StrategyState::Dca(s.state().clone()),
        };
        StateBlob {
            version: STATE_VERSION,
            state,
        }
    }

    pub fn serialize_state(&self) -> StrategyResult<String> {
        self.snapshot_state().encode()
    }

    pub fn restore_state(&mut self, raw: &str) -> StrategyResult<()> {
        let blob = StateBlob::decode(raw)?;
        match (self, blob.state) {
            (Self::Grid(s), StrategyState::Grid(state)) => s.restore(state),
            (Self::Dca(s), StrategyState::Dca(state)) => {
                s.restore(state);
                Ok(())
            }
            (me, _) => Err(StrategyError::StateMismatch(format!(
                "stored state does not belong to a {} strategy",
                me.kind()
            ))),
        }
    }
}
