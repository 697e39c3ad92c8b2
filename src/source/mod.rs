//! Trade sources
//!
//! Capability traits shared by the live feed and the replay engine. The
//! strategy engine talks only to these traits; every live/paper divergence
//! (order routing, account state, clocks) lives inside the source
//! implementations, never in the engine.

pub mod ledger;
pub mod live;
pub mod replay;
pub mod venue;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Millis, OrderOutcome, RejectReason, Trade};

pub use ledger::PaperLedger;
pub use live::LiveSource;
pub use replay::ReplaySource;
pub use venue::{AccountState, VenueClient};

/// Errors surfaced at the source boundary.
///
/// Only `OrderRejected` is recoverable from the engine's point of view;
/// everything else is decided by the run driver.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Replay ran out of rows before the end bound. Terminal but clean;
    /// `stream_trades` converts it into a normal `Ok(())` end of stream.
    #[error("source exhausted")]
    Exhausted,

    /// The backing store or feed connection is gone. Fatal for the run.
    #[error("source unavailable: {context}")]
    Unavailable { context: String },

    /// An order was turned away. Recoverable: the engine logs it and
    /// continues with the next interval.
    #[error("order rejected: {0}")]
    OrderRejected(RejectReason),

    /// A feed message was missing required fields. The message is dropped
    /// and counted; fatal only past the drop-rate sanity bound.
    #[error("malformed message: {context}")]
    Malformed { context: String },
}

/// Receives every emitted trade batch, in order, awaited to completion
/// before the source advances. Handlers registered on the same source all
/// see every batch, in registration order.
#[async_trait]
pub trait TradeHandler: Send {
    async fn on_trades(&mut self, batch: &[Trade]) -> Result<(), SourceError>;
}

/// A stream of trades plus the account it trades against.
#[async_trait]
pub trait TradeSource: Send + Sync {
    /// Authoritative source time: wall clock for the live source, cursor
    /// position for replay.
    fn time(&self) -> Millis;

    /// Register a handler. Handlers added after `stream_trades` started are
    /// picked up from the next batch onwards.
    async fn add_trade_handler(&self, handler: Box<dyn TradeHandler>);

    /// Drive emission until exhaustion (replay) or `stop()` (live). Events
    /// are never emitted out of order; a handler error aborts the stream.
    async fn stream_trades(&self) -> Result<(), SourceError>;

    /// Request the stream to end. Idempotent; batches already dequeued are
    /// still delivered exactly once.
    fn stop(&self);

    /// Best current price estimate. `None` (not an error) until enough
    /// market data has been observed.
    async fn market_price(&self) -> Option<f64>;

    async fn create_buy_order(
        &self,
        size: f64,
        slippage_tolerance: f64,
    ) -> Result<OrderOutcome, SourceError>;

    async fn create_sell_order(
        &self,
        size: f64,
        slippage_tolerance: f64,
    ) -> Result<OrderOutcome, SourceError>;

    async fn position_size(&self) -> f64;

    async fn withdrawable(&self) -> f64;

    async fn last_buy_price(&self) -> Option<f64>;

    async fn last_sell_price(&self) -> Option<f64>;

    /// Cash plus position marked at the last trade price.
    async fn current_total_usd(&self) -> f64;
}
