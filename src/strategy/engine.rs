//! Volume Engine
//!
//! Streaming signal/execution engine. Accumulates per-side USD notional
//! between flush boundaries, compares short- vs long-horizon volume via
//! z-scores, gates on the price oscillator, and routes at most one order
//! per flush through the trade source it was given.
//!
//! Flush boundaries are driven by event time (the time carried on each
//! trade), so the same code path is exact under replay and live.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::models::{Millis, Side, Trade};
use crate::source::{SourceError, TradeHandler, TradeSource};

use super::oscillator::PriceOscillator;
use super::rolling::RollingStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePhase {
    /// Long buffers still filling; no orders are placed.
    Warmup,
    /// Fully warmed up and trading.
    Active,
}

/// Run-level counters and the equity curve, shared with the run driver.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub phase: EnginePhase,
    pub flush_count: u64,
    pub buy_orders: u64,
    pub sell_orders: u64,
    pub rejected_orders: u64,
    /// `(flush boundary, current_total_usd)` sampled at every active flush.
    pub equity_curve: Vec<(Millis, f64)>,
    pub final_equity: f64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self {
            phase: EnginePhase::Warmup,
            flush_count: 0,
            buy_orders: 0,
            sell_orders: 0,
            rejected_orders: 0,
            equity_curve: Vec::new(),
            final_equity: 0.0,
        }
    }
}

impl EngineMetrics {
    /// Percent return from the first to the last equity sample.
    pub fn return_pct(&self) -> Option<f64> {
        let first = self.equity_curve.first()?.1;
        let last = self.equity_curve.last()?.1;
        if first == 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }

    /// Largest peak-to-trough equity drop, as a fraction of the peak.
    pub fn max_drawdown(&self) -> f64 {
        let mut peak = f64::NEG_INFINITY;
        let mut max_drawdown: f64 = 0.0;
        for &(_, equity) in &self.equity_curve {
            if equity > peak {
                peak = equity;
            } else if peak > 0.0 {
                max_drawdown = max_drawdown.max((peak - equity) / peak);
            }
        }
        max_drawdown
    }
}

pub struct VolumeEngine {
    config: EngineConfig,
    source: Arc<dyn TradeSource>,
    phase: EnginePhase,
    buy_usd_accum: f64,
    sell_usd_accum: f64,
    last_flush: Option<Millis>,
    short_buy: RollingStats,
    long_buy: RollingStats,
    short_sell: RollingStats,
    long_sell: RollingStats,
    oscillator: PriceOscillator,
    metrics: Arc<RwLock<EngineMetrics>>,
}

impl VolumeEngine {
    pub fn new(config: EngineConfig, source: Arc<dyn TradeSource>) -> Self {
        let short_capacity = config.short_capacity();
        let long_capacity = config.long_capacity();
        let oscillator_window = config.oscillator_window;
        Self {
            config,
            source,
            phase: EnginePhase::Warmup,
            buy_usd_accum: 0.0,
            sell_usd_accum: 0.0,
            last_flush: None,
            short_buy: RollingStats::new(short_capacity),
            long_buy: RollingStats::new(long_capacity),
            short_sell: RollingStats::new(short_capacity),
            long_sell: RollingStats::new(long_capacity),
            oscillator: PriceOscillator::new(oscillator_window),
            metrics: Arc::new(RwLock::new(EngineMetrics::default())),
        }
    }

    /// Shared metrics handle; the driver keeps it past the engine handoff.
    pub fn metrics(&self) -> Arc<RwLock<EngineMetrics>> {
        self.metrics.clone()
    }

    async fn on_trade(&mut self, trade: &Trade) -> Result<(), SourceError> {
        let last_flush = match self.last_flush {
            Some(t) => t,
            None => {
                self.last_flush = Some(trade.time);
                trade.time
            }
        };

        // Commit every boundary the tape has crossed since the last flush.
        // Quiet intervals record a zero on both sides.
        let interval = self.config.flush_interval;
        let mut boundary = last_flush + interval;
        while trade.time >= boundary {
            self.flush(boundary).await?;
            boundary += interval;
        }

        match trade.side {
            Side::Buy => self.buy_usd_accum += trade.notional(),
            Side::Sell => self.sell_usd_accum += trade.notional(),
        }
        if let Some(mid) = self.source.market_price().await {
            self.oscillator.push(mid);
        }
        Ok(())
    }

    async fn flush(&mut self, boundary: Millis) -> Result<(), SourceError> {
        let buy_usd = self.buy_usd_accum;
        let sell_usd = self.sell_usd_accum;
        self.buy_usd_accum = 0.0;
        self.sell_usd_accum = 0.0;
        self.last_flush = Some(boundary);

        self.short_buy.push(buy_usd);
        self.long_buy.push(buy_usd);
        self.short_sell.push(sell_usd);
        self.long_sell.push(sell_usd);

        self.metrics.write().flush_count += 1;

        if self.phase == EnginePhase::Warmup
            && self.long_buy.is_full()
            && self.long_sell.is_full()
        {
            self.phase = EnginePhase::Active;
            self.metrics.write().phase = EnginePhase::Active;
            info!(
                intervals = self.long_buy.len(),
                "Warmup complete, engine active"
            );
        }

        if self.phase == EnginePhase::Active {
            self.evaluate().await?;
            let equity = self.source.current_total_usd().await;
            let mut metrics = self.metrics.write();
            metrics.equity_curve.push((boundary, equity));
            metrics.final_equity = equity;
        }
        Ok(())
    }

    async fn evaluate(&mut self) -> Result<(), SourceError> {
        let z_buy = z_score(&self.short_buy, &self.long_buy);
        let z_sell = z_score(&self.short_sell, &self.long_sell);
        let osc = self.oscillator.value();
        debug!(z_buy, z_sell, osc, "Flush evaluated");

        // Sell takes priority; at most one action per flush.
        if z_sell > self.config.sell_threshold
            && self.short_sell.mean() > self.short_buy.mean()
            && osc < 50.0
        {
            let position = self.source.position_size().await;
            if position > 0.0 {
                return self.submit_sell(position, z_sell).await;
            }
        }

        if z_buy > self.config.buy_threshold && osc > 50.0 {
            let cash = self.source.withdrawable().await;
            if cash > 0.0 {
                if let Some(price) = self.source.last_buy_price().await {
                    let fraction = (z_buy / self.config.z_max).min(1.0);
                    let size = cash * self.config.cash_fraction * fraction / price;
                    return self.submit_buy(size, z_buy).await;
                }
            }
        }
        Ok(())
    }

    async fn submit_buy(&mut self, size: f64, z_buy: f64) -> Result<(), SourceError> {
        match self
            .source
            .create_buy_order(size, self.config.slippage_tolerance)
            .await
        {
            Ok(outcome) => {
                info!(
                    size,
                    z_buy,
                    filled = outcome.filled_size(),
                    "Buy order placed"
                );
                if !outcome.errors.is_empty() {
                    warn!(errors = ?outcome.errors, "Buy order reported errors");
                }
                self.metrics.write().buy_orders += 1;
                Ok(())
            }
            Err(SourceError::OrderRejected(reason)) => {
                warn!(%reason, "Buy order rejected");
                self.metrics.write().rejected_orders += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn submit_sell(&mut self, position: f64, z_sell: f64) -> Result<(), SourceError> {
        match self
            .source
            .create_sell_order(position, self.config.slippage_tolerance)
            .await
        {
            Ok(outcome) => {
                info!(
                    size = position,
                    z_sell,
                    filled = outcome.filled_size(),
                    "Position liquidated"
                );
                if !outcome.errors.is_empty() {
                    warn!(errors = ?outcome.errors, "Sell order reported errors");
                }
                self.metrics.write().sell_orders += 1;
                Ok(())
            }
            Err(SourceError::OrderRejected(reason)) => {
                warn!(%reason, "Sell order rejected");
                self.metrics.write().rejected_orders += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Short-horizon deviation from the long-horizon mean, in units of the
/// long-horizon standard deviation. 0 when the long window is flat.
fn z_score(short: &RollingStats, long: &RollingStats) -> f64 {
    let variance = long.variance();
    if variance <= f64::EPSILON {
        return 0.0;
    }
    (short.mean() - long.mean()) / variance.sqrt()
}

#[async_trait]
impl TradeHandler for VolumeEngine {
    async fn on_trades(&mut self, batch: &[Trade]) -> Result<(), SourceError> {
        for trade in batch {
            self.on_trade(trade).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderOutcome, RejectReason};
    use crate::source::PaperLedger;
    use parking_lot::Mutex;

    /// Paper-ledger-backed stand-in with scripted reference prices.
    struct ScriptedSource {
        ledger: Mutex<PaperLedger>,
        last_buy: Mutex<Option<f64>>,
        last_sell: Mutex<Option<f64>>,
        last_trade: Mutex<Option<f64>>,
        reject_orders: bool,
    }

    impl ScriptedSource {
        fn new(starting_cash: f64) -> Self {
            Self {
                ledger: Mutex::new(PaperLedger::new(starting_cash)),
                last_buy: Mutex::new(None),
                last_sell: Mutex::new(None),
                last_trade: Mutex::new(None),
                reject_orders: false,
            }
        }

        fn with_prices(self, buy: f64, sell: f64) -> Self {
            *self.last_buy.lock() = Some(buy);
            *self.last_sell.lock() = Some(sell);
            *self.last_trade.lock() = Some(sell);
            self
        }

        fn cash(&self) -> f64 {
            self.ledger.lock().cash()
        }

        fn position(&self) -> f64 {
            self.ledger.lock().position()
        }
    }

    #[async_trait]
    impl TradeSource for ScriptedSource {
        fn time(&self) -> Millis {
            0
        }

        async fn add_trade_handler(&self, _handler: Box<dyn TradeHandler>) {}

        async fn stream_trades(&self) -> Result<(), SourceError> {
            Ok(())
        }

        fn stop(&self) {}

        async fn market_price(&self) -> Option<f64> {
            match (*self.last_buy.lock(), *self.last_sell.lock()) {
                (Some(buy), Some(sell)) => Some((buy + sell) / 2.0),
                _ => None,
            }
        }

        async fn create_buy_order(
            &self,
            size: f64,
            _slippage_tolerance: f64,
        ) -> Result<OrderOutcome, SourceError> {
            if self.reject_orders {
                return Err(SourceError::OrderRejected(RejectReason::Venue(
                    "scripted rejection".to_string(),
                )));
            }
            let price = self.last_buy.lock().unwrap_or(1.0);
            let fill = self
                .ledger
                .lock()
                .apply_buy(size, price)
                .map_err(SourceError::OrderRejected)?;
            Ok(OrderOutcome {
                fills: vec![fill],
                errors: Vec::new(),
            })
        }

        async fn create_sell_order(
            &self,
            size: f64,
            _slippage_tolerance: f64,
        ) -> Result<OrderOutcome, SourceError> {
            if self.reject_orders {
                return Err(SourceError::OrderRejected(RejectReason::Venue(
                    "scripted rejection".to_string(),
                )));
            }
            let price = self.last_sell.lock().unwrap_or(1.0);
            let fill = self
                .ledger
                .lock()
                .apply_sell(size, price)
                .map_err(SourceError::OrderRejected)?;
            Ok(OrderOutcome {
                fills: vec![fill],
                errors: Vec::new(),
            })
        }

        async fn position_size(&self) -> f64 {
            self.ledger.lock().position()
        }

        async fn withdrawable(&self) -> f64 {
            self.ledger.lock().cash()
        }

        async fn last_buy_price(&self) -> Option<f64> {
            *self.last_buy.lock()
        }

        async fn last_sell_price(&self) -> Option<f64> {
            *self.last_sell.lock()
        }

        async fn current_total_usd(&self) -> f64 {
            let ledger = self.ledger.lock();
            match *self.last_trade.lock() {
                Some(price) => ledger.equity(price),
                None => ledger.cash(),
            }
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            buy_threshold: 2.5,
            sell_threshold: 1.75,
            z_max: 20.0,
            flush_interval: 1_000,
            short_horizon: 1_000,
            long_horizon: 4_000,
            oscillator_window: 4,
            cash_fraction: 1.0,
            slippage_tolerance: 0.01,
        }
    }

    fn rising_oscillator(window: usize) -> PriceOscillator {
        let mut oscillator = PriceOscillator::new(window);
        for step in 0..window {
            oscillator.push(10.0 + step as f64);
        }
        oscillator
    }

    fn falling_oscillator(window: usize) -> PriceOscillator {
        let mut oscillator = PriceOscillator::new(window);
        for step in 0..window {
            oscillator.push(10.0 - step as f64);
        }
        oscillator
    }

    fn stats_with(capacity: usize, values: &[f64]) -> RollingStats {
        let mut stats = RollingStats::new(capacity);
        for value in values {
            stats.push(*value);
        }
        stats
    }

    #[tokio::test]
    async fn test_warmup_issues_no_orders() {
        let source = Arc::new(ScriptedSource::new(1_000.0).with_prices(2.0, 2.0));
        let mut engine = VolumeEngine::new(test_config(), source.clone());
        let metrics = engine.metrics();

        // Heavy one-sided volume across 3 boundaries; long capacity is 4,
        // so the engine must still be warming up.
        let batch: Vec<Trade> = (0..4)
            .map(|step| Trade {
                time: step * 1_000,
                price: 2.0,
                size: 500.0,
                side: Side::Buy,
            })
            .collect();
        engine.on_trades(&batch).await.unwrap();

        let metrics = metrics.read();
        assert_eq!(metrics.phase, EnginePhase::Warmup);
        assert_eq!(metrics.buy_orders, 0);
        assert_eq!(metrics.sell_orders, 0);
        assert_eq!(source.cash(), 1_000.0);
    }

    #[tokio::test]
    async fn test_buy_sizing_scales_with_z() {
        let source = Arc::new(ScriptedSource::new(1_000.0).with_prices(2.0, 2.0));
        let mut engine = VolumeEngine::new(test_config(), source.clone());
        engine.phase = EnginePhase::Active;

        // Long buy window mean 40, variance 400; short mean 120 => z = 4.
        engine.short_buy = stats_with(1, &[120.0]);
        engine.long_buy = stats_with(2, &[20.0, 60.0]);
        engine.short_sell = stats_with(1, &[0.0]);
        engine.long_sell = stats_with(2, &[0.0, 0.0]);
        engine.oscillator = rising_oscillator(4);

        engine.evaluate().await.unwrap();

        // fraction = min(4 / 20, 1) = 0.2; size = 1000 * 0.2 / 2.0 = 100.
        assert_eq!(source.position(), 100.0);
        assert_eq!(source.cash(), 800.0);
        assert_eq!(engine.metrics().read().buy_orders, 1);
    }

    #[tokio::test]
    async fn test_sell_liquidates_full_position() {
        let source = Arc::new(ScriptedSource::new(50.0).with_prices(1.0, 3.0));
        source.ledger.lock().apply_buy(50.0, 1.0).unwrap();
        assert_eq!(source.position(), 50.0);
        assert_eq!(source.cash(), 0.0);

        let mut engine = VolumeEngine::new(test_config(), source.clone());
        engine.phase = EnginePhase::Active;
        engine.short_sell = stats_with(1, &[120.0]);
        engine.long_sell = stats_with(2, &[20.0, 60.0]);
        engine.short_buy = stats_with(1, &[10.0]);
        engine.long_buy = stats_with(2, &[0.0, 0.0]);
        engine.oscillator = falling_oscillator(4);

        engine.evaluate().await.unwrap();

        assert_eq!(source.position(), 0.0);
        assert_eq!(source.cash(), 150.0);
        assert_eq!(engine.metrics().read().sell_orders, 1);
    }

    #[tokio::test]
    async fn test_rejected_order_is_recoverable() {
        let mut source = ScriptedSource::new(1_000.0).with_prices(2.0, 2.0);
        source.reject_orders = true;
        let source = Arc::new(source);

        let mut engine = VolumeEngine::new(test_config(), source.clone());
        engine.phase = EnginePhase::Active;
        engine.short_buy = stats_with(1, &[120.0]);
        engine.long_buy = stats_with(2, &[20.0, 60.0]);
        engine.short_sell = stats_with(1, &[0.0]);
        engine.long_sell = stats_with(2, &[0.0, 0.0]);
        engine.oscillator = rising_oscillator(4);

        // The rejection is absorbed, not propagated.
        engine.evaluate().await.unwrap();
        let metrics = engine.metrics();
        let metrics = metrics.read();
        assert_eq!(metrics.rejected_orders, 1);
        assert_eq!(metrics.buy_orders, 0);
    }

    #[tokio::test]
    async fn test_quiet_intervals_flush_zero() {
        let source = Arc::new(ScriptedSource::new(1_000.0).with_prices(2.0, 2.0));
        let mut engine = VolumeEngine::new(test_config(), source);

        let batch = [
            Trade {
                time: 0,
                price: 2.0,
                size: 10.0,
                side: Side::Buy,
            },
            Trade {
                time: 5_000,
                price: 2.0,
                size: 1.0,
                side: Side::Sell,
            },
        ];
        engine.on_trades(&batch).await.unwrap();

        // Boundaries 1000..=5000 all committed; intervals 2..5 were quiet.
        assert_eq!(engine.metrics().read().flush_count, 5);
        assert_eq!(engine.long_buy.len(), 4); // capacity-bounded
        assert_eq!(engine.long_buy.latest(), Some(0.0));
        // The t=5000 trade lands in the interval that opened at 5000.
        assert_eq!(engine.sell_usd_accum, 2.0);
        assert_eq!(engine.last_flush, Some(5_000));
    }

    #[tokio::test]
    async fn test_warmup_transitions_once_long_buffers_fill() {
        let source = Arc::new(ScriptedSource::new(1_000.0).with_prices(2.0, 2.0));
        let mut engine = VolumeEngine::new(test_config(), source);

        let batch: Vec<Trade> = (0..6)
            .map(|step| Trade {
                time: step * 1_000,
                price: 2.0,
                size: 1.0,
                side: if step % 2 == 0 { Side::Buy } else { Side::Sell },
            })
            .collect();
        engine.on_trades(&batch).await.unwrap();

        assert_eq!(engine.phase, EnginePhase::Active);
        assert_eq!(engine.metrics().read().phase, EnginePhase::Active);
        // Equity sampled at each active flush.
        assert!(!engine.metrics().read().equity_curve.is_empty());
    }

    #[test]
    fn test_z_score_flat_long_window_is_zero() {
        let short = stats_with(1, &[100.0]);
        let long = stats_with(3, &[5.0, 5.0, 5.0]);
        assert_eq!(z_score(&short, &long), 0.0);
    }

    #[test]
    fn test_metrics_return_and_drawdown() {
        let metrics = EngineMetrics {
            equity_curve: vec![(0, 100.0), (1, 120.0), (2, 90.0), (3, 110.0)],
            ..EngineMetrics::default()
        };
        assert!((metrics.return_pct().unwrap() - 10.0).abs() < 1e-9);
        assert!((metrics.max_drawdown() - 0.25).abs() < 1e-9);

        let empty = EngineMetrics::default();
        assert_eq!(empty.return_pct(), None);
        assert_eq!(empty.max_drawdown(), 0.0);
    }
}
