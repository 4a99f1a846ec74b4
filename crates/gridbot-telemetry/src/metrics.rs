//! Prometheus metrics for the gridbot engine.
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which is a startup bug; it can only happen during
//! static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, register_int_gauge,
    CounterVec, Encoder, GaugeVec, HistogramVec, IntGauge, TextEncoder,
};

use crate::error::TelemetryResult;

/// Orders accepted by the venue.
/// Labels: bot_id, side
pub static ORDERS_SUBMITTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gridbot_orders_submitted_total",
        "Total orders accepted by the venue",
        &["bot_id", "side"]
    )
    .unwrap()
});

/// Orders that ended in `rejected` or `error`, or whose outcome is unknown.
/// Labels: bot_id, kind (rejected/error/timeout/insufficient_balance)
pub static ORDER_ERRORS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gridbot_order_errors_total",
        "Total order submission failures",
        &["bot_id", "kind"]
    )
    .unwrap()
});

/// Applied fills.
/// Labels: bot_id, side, source (stream/reconcile)
pub static FILLS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gridbot_fills_total",
        "Total fills applied",
        &["bot_id", "side", "source"]
    )
    .unwrap()
});

/// Cumulative realized P&L in quote currency.
pub static REALIZED_PNL: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "gridbot_realized_pnl",
        "Cumulative realized P&L in quote currency",
        &["bot_id"]
    )
    .unwrap()
});

/// Circuit breaker trips.
/// Labels: bot_id, kind (order_rate/loss/price_deviation)
pub static BREAKER_TRIPS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gridbot_breaker_trips_total",
        "Total circuit breaker trips",
        &["bot_id", "kind"]
    )
    .unwrap()
});

/// Writes performed by reconciliation.
/// Labels: kind (trade/order/conflict)
pub static RECONCILE_WRITES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gridbot_reconcile_writes_total",
        "Total repairs written by reconciliation",
        &["kind"]
    )
    .unwrap()
});

/// Tick duration in milliseconds.
pub static TICK_DURATION_MS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "gridbot_tick_duration_ms",
        "Bot tick duration in milliseconds",
        &["bot_id"],
        vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0]
    )
    .unwrap()
});

/// Ticks skipped because the previous one was still running.
pub static TICKS_SKIPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "gridbot_ticks_skipped_total",
        "Ticks skipped due to overlap",
        &["bot_id"]
    )
    .unwrap()
});

/// Bots currently registered as running.
pub static BOTS_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("gridbot_bots_running", "Bots currently running").unwrap()
});

/// Static helper API over the registered metrics.
pub struct Metrics;

impl Metrics {
    pub fn order_submitted(bot_id: &str, side: &str) {
        ORDERS_SUBMITTED_TOTAL.with_label_values(&[bot_id, side]).inc();
    }

    pub fn order_error(bot_id: &str, kind: &str) {
        ORDER_ERRORS_TOTAL.with_label_values(&[bot_id, kind]).inc();
    }

    pub fn fill_applied(bot_id: &str, side: &str, source: &str) {
        FILLS_TOTAL.with_label_values(&[bot_id, side, source]).inc();
    }

    pub fn realized_pnl(bot_id: &str, pnl: f64) {
        REALIZED_PNL.with_label_values(&[bot_id]).set(pnl);
    }

    pub fn breaker_tripped(bot_id: &str, kind: &str) {
        BREAKER_TRIPS_TOTAL.with_label_values(&[bot_id, kind]).inc();
    }

    pub fn reconcile_write(kind: &str) {
        RECONCILE_WRITES_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn tick_duration(bot_id: &str, duration_ms: f64) {
        TICK_DURATION_MS
            .with_label_values(&[bot_id])
            .observe(duration_ms);
    }

    pub fn tick_skipped(bot_id: &str) {
        TICKS_SKIPPED_TOTAL.with_label_values(&[bot_id]).inc();
    }

    pub fn bots_running(count: i64) {
        BOTS_RUNNING.set(count);
    }

    /// Render the default registry in the text exposition format.
    pub fn gather_text() -> TelemetryResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
