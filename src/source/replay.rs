//! Replay Source
//!
//! Deterministic backtest source over the trade store. Pages through
//! history on a strict `(trade_time, trade_id)` cursor and delivers every
//! row to every handler synchronously before advancing, so a replay of the
//! same window over an unmodified store is bit-for-bit repeatable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::models::{Millis, OrderOutcome, Side, Trade};
use crate::store::{TradeRow, TradeStore};

use super::ledger::PaperLedger;
use super::{SourceError, TradeHandler, TradeSource};

pub const DEFAULT_PAGE_SIZE: usize = 100_000;

/// Mutable market view of the replay: cursor position and last observed
/// prices. Small critical sections only; never held across an await.
struct MarketState {
    cursor_time: Millis,
    cursor_id: i64,
    last_buy_price: Option<f64>,
    last_sell_price: Option<f64>,
    last_trade_price: Option<f64>,
}

pub struct ReplaySource {
    store: Arc<TradeStore>,
    instrument_id: i64,
    symbol: String,
    end: Millis,
    page_size: usize,
    market: parking_lot::Mutex<MarketState>,
    ledger: parking_lot::Mutex<PaperLedger>,
    // tokio Mutex: held across handler awaits for the whole stream.
    handlers: tokio::sync::Mutex<Vec<Box<dyn TradeHandler>>>,
    stopped: AtomicBool,
}

impl ReplaySource {
    pub fn new(
        store: Arc<TradeStore>,
        symbol: &str,
        start: Millis,
        end: Millis,
        starting_cash: f64,
        page_size: usize,
    ) -> anyhow::Result<Self> {
        let instrument_id = store.instrument_id(symbol)?;
        Ok(Self {
            store,
            instrument_id,
            symbol: symbol.to_string(),
            end,
            page_size: page_size.max(1),
            market: parking_lot::Mutex::new(MarketState {
                // Strict > comparison means i64::MIN admits every id at `start`.
                cursor_time: start,
                cursor_id: i64::MIN,
                last_buy_price: None,
                last_sell_price: None,
                last_trade_price: None,
            }),
            ledger: parking_lot::Mutex::new(PaperLedger::new(starting_cash)),
            handlers: tokio::sync::Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    fn next_page(&self) -> Result<Vec<TradeRow>, SourceError> {
        let (cursor_time, cursor_id) = {
            let market = self.market.lock();
            (market.cursor_time, market.cursor_id)
        };
        let page = self
            .store
            .fetch_after(
                self.instrument_id,
                (cursor_time, cursor_id),
                self.end,
                self.page_size,
            )
            .map_err(|e| SourceError::Unavailable {
                context: format!("trade fetch failed for {}: {}", self.symbol, e),
            })?;
        if page.is_empty() {
            return Err(SourceError::Exhausted);
        }
        Ok(page)
    }

    /// Advance the cursor and last-price view past `row`, returning the
    /// trade to emit.
    fn observe(&self, row: &TradeRow) -> Trade {
        let mut market = self.market.lock();
        market.cursor_time = row.time;
        market.cursor_id = row.trade_id;
        market.last_trade_price = Some(row.price);
        match row.side {
            Side::Buy => market.last_buy_price = Some(row.price),
            Side::Sell => market.last_sell_price = Some(row.price),
        }
        row.to_trade()
    }

    /// Reference price for paper execution on `side`: the last print of
    /// that side, else the last trade of either side.
    fn reference_price(&self, side: Side) -> Result<f64, SourceError> {
        let market = self.market.lock();
        let price = match side {
            Side::Buy => market.last_buy_price.or(market.last_trade_price),
            Side::Sell => market.last_sell_price.or(market.last_trade_price),
        };
        price.ok_or_else(|| SourceError::Unavailable {
            context: format!("no reference price observed yet for {}", self.symbol),
        })
    }
}

#[async_trait]
impl TradeSource for ReplaySource {
    fn time(&self) -> Millis {
        self.market.lock().cursor_time
    }

    async fn add_trade_handler(&self, handler: Box<dyn TradeHandler>) {
        self.handlers.lock().await.push(handler);
    }

    async fn stream_trades(&self) -> Result<(), SourceError> {
        let mut handlers = self.handlers.lock().await;
        let mut emitted: u64 = 0;

        let result = loop {
            if self.stopped.load(Ordering::SeqCst) {
                break Ok(());
            }
            let page = match self.next_page() {
                Ok(page) => page,
                Err(SourceError::Exhausted) => break Ok(()),
                Err(e) => break Err(e),
            };
            debug!(rows = page.len(), "Replay page loaded");

            for row in &page {
                if self.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let trade = self.observe(row);
                let batch = [trade];
                for handler in handlers.iter_mut() {
                    handler.on_trades(&batch).await?;
                }
                emitted += 1;
            }
        };

        info!(
            symbol = %self.symbol,
            trades = emitted,
            "Replay stream ended"
        );
        result
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn market_price(&self) -> Option<f64> {
        let market = self.market.lock();
        match (market.last_buy_price, market.last_sell_price) {
            (Some(buy), Some(sell)) => Some((buy + sell) / 2.0),
            _ => None,
        }
    }

    async fn create_buy_order(
        &self,
        size: f64,
        _slippage_tolerance: f64,
    ) -> Result<OrderOutcome, SourceError> {
        let price = self.reference_price(Side::Buy)?;
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
        let price = self.reference_price(Side::Sell)?;
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
        self.market.lock().last_buy_price
    }

    async fn last_sell_price(&self) -> Option<f64> {
        self.market.lock().last_sell_price
    }

    async fn current_total_usd(&self) -> f64 {
        let mark = self.market.lock().last_trade_price;
        let ledger = self.ledger.lock();
        match mark {
            Some(price) => ledger.equity(price),
            None => ledger.cash(),
        }
    }
}
