//! Live Source
//!
//! Real-time trade feed over websocket plus venue-backed order routing.
//! A reader task owns the socket (with auto-reconnect and exponential
//! backoff) and funnels parsed batches through a bounded channel into a
//! single dispatch loop, so handlers always run on one writer no matter
//! how the feed reconnects.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::time::{sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::{Millis, OrderOutcome, Side, Trade};

use super::venue::VenueClient;
use super::{SourceError, TradeHandler, TradeSource};

const BATCH_QUEUE_DEPTH: usize = 1024;
const MID_CACHE_MS: i64 = 1_000;
/// Minimum dropped rows before the drop-rate bound can trip.
const MALFORMED_FATAL_MIN: u64 = 25;

#[derive(Debug, Serialize)]
struct SubscribeRequest<'a> {
    method: &'a str,
    channel: &'a str,
    instrument: &'a str,
}

#[derive(Debug, Deserialize)]
struct WsEnvelope {
    channel: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    time: Millis,
    price: f64,
    size: f64,
    side: String,
}

/// A classified feed message.
#[derive(Debug)]
enum FeedMessage {
    /// Subscription confirmation; never a trade.
    Subscribed,
    /// Some other control channel.
    Control(String),
    /// Data message: parsed rows plus the count of rows dropped as malformed.
    Trades { trades: Vec<Trade>, dropped: u64 },
    /// Not parseable at all.
    Malformed,
}

fn parse_feed_message(text: &str) -> FeedMessage {
    let envelope: WsEnvelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(_) => return FeedMessage::Malformed,
    };
    match envelope.channel.as_str() {
        "subscribed" => FeedMessage::Subscribed,
        "trades" => {
            let rows = match envelope.data {
                Some(serde_json::Value::Array(rows)) => rows,
                _ => {
                    return FeedMessage::Trades {
                        trades: Vec::new(),
                        dropped: 1,
                    }
                }
            };
            let mut trades = Vec::with_capacity(rows.len());
            let mut dropped = 0;
            for row in rows {
                match serde_json::from_value::<WireTrade>(row) {
                    Ok(wire) => match Side::from_wire(&wire.side) {
                        Some(side) => trades.push(Trade {
                            time: wire.time,
                            price: wire.price,
                            size: wire.size,
                            side,
                        }),
                        None => dropped += 1,
                    },
                    Err(_) => dropped += 1,
                }
            }
            FeedMessage::Trades { trades, dropped }
        }
        other => FeedMessage::Control(other.to_string()),
    }
}

/// Last prices observed on the tape, shared between the dispatch loop and
/// the accessors. Short critical sections only.
#[derive(Debug, Default)]
struct TapeState {
    last_buy_price: Option<f64>,
    last_sell_price: Option<f64>,
    last_trade_price: Option<f64>,
}

#[derive(Debug, Default)]
struct MidCache {
    fetched_at: Millis,
    mid: Option<f64>,
}

/// Owns the websocket for the lifetime of the stream.
struct FeedReader {
    ws_url: String,
    instrument: String,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    valid_rows: Arc<AtomicU64>,
    dropped_rows: Arc<AtomicU64>,
}

impl FeedReader {
    async fn run(self, tx: mpsc::Sender<Result<Vec<Trade>, SourceError>>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(60);

        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            match self.connect_and_stream(&tx).await {
                Ok(()) => {
                    if self.stopped.load(Ordering::SeqCst) {
                        return;
                    }
                    info!("Feed connection closed gracefully, reconnecting");
                    reconnect_delay = Duration::from_secs(1);
                    continue;
                }
                Err(e @ SourceError::Malformed { .. }) => {
                    // Drop-rate sanity bound tripped: surface and stop.
                    let _ = tx.send(Err(e)).await;
                    return;
                }
                Err(e) => {
                    error!("Feed error: {}", e);
                    warn!("Reconnecting in {:?}", reconnect_delay);
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                _ = sleep(reconnect_delay) => {}
            }
            reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
        }
    }

    async fn connect_and_stream(
        &self,
        tx: &mpsc::Sender<Result<Vec<Trade>, SourceError>>,
    ) -> Result<(), SourceError> {
        info!(url = %self.ws_url, "Connecting to trade feed");
        let (ws_stream, _) =
            connect_async(&self.ws_url)
                .await
                .map_err(|e| SourceError::Unavailable {
                    context: format!("feed connect failed: {}", e),
                })?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = SubscribeRequest {
            method: "subscribe",
            channel: "trades",
            instrument: &self.instrument,
        };
        let payload =
            serde_json::to_string(&subscribe).map_err(|e| SourceError::Malformed {
                context: format!("subscribe serialize failed: {}", e),
            })?;
        write
            .send(Message::Text(payload))
            .await
            .map_err(|e| SourceError::Unavailable {
                context: format!("subscribe send failed: {}", e),
            })?;
        info!(instrument = %self.instrument, "Subscribed to trade feed");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return Ok(()),
                message = read.next() => {
                    let Some(message) = message else {
                        return Err(SourceError::Unavailable {
                            context: "feed stream ended".to_string(),
                        });
                    };
                    match message {
                        Ok(Message::Text(text)) => {
                            self.handle_text(&text, tx).await?;
                        }
                        Ok(Message::Ping(ping)) => {
                            write.send(Message::Pong(ping)).await.map_err(|e| {
                                SourceError::Unavailable {
                                    context: format!("pong send failed: {}", e),
                                }
                            })?;
                        }
                        Ok(Message::Close(frame)) => {
                            info!("Feed closed by server: {:?}", frame);
                            return Ok(());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            return Err(SourceError::Unavailable {
                                context: format!("feed read error: {}", e),
                            });
                        }
                    }
                }
            }
        }
    }

    async fn handle_text(
        &self,
        text: &str,
        tx: &mpsc::Sender<Result<Vec<Trade>, SourceError>>,
    ) -> Result<(), SourceError> {
        match parse_feed_message(text) {
            FeedMessage::Subscribed => {
                debug!("Subscription confirmed");
            }
            FeedMessage::Control(channel) => {
                debug!(channel = %channel, "Control message");
            }
            FeedMessage::Trades { trades, dropped } => {
                self.valid_rows
                    .fetch_add(trades.len() as u64, Ordering::Relaxed);
                if dropped > 0 {
                    let total_dropped =
                        self.dropped_rows.fetch_add(dropped, Ordering::Relaxed) + dropped;
                    warn!(
                        dropped,
                        total_dropped,
                        "Malformed trade rows dropped"
                    );
                    self.check_drop_rate(total_dropped)?;
                }
                if !trades.is_empty() && tx.send(Ok(trades)).await.is_err() {
                    // Dispatch side is gone; nothing left to feed.
                    self.stopped.store(true, Ordering::SeqCst);
                    return Err(SourceError::Unavailable {
                        context: "dispatch queue closed".to_string(),
                    });
                }
            }
            FeedMessage::Malformed => {
                let total_dropped = self.dropped_rows.fetch_add(1, Ordering::Relaxed) + 1;
                let preview: String = text.chars().take(200).collect();
                warn!(message = %preview, "Unparseable feed message dropped");
                self.check_drop_rate(total_dropped)?;
            }
        }
        Ok(())
    }

    /// Fatal once drops exceed 10% of all rows, after a minimum count so a
    /// noisy first message cannot kill the stream.
    fn check_drop_rate(&self, total_dropped: u64) -> Result<(), SourceError> {
        let valid = self.valid_rows.load(Ordering::Relaxed);
        if total_dropped >= MALFORMED_FATAL_MIN && total_dropped * 10 > valid + total_dropped {
            return Err(SourceError::Malformed {
                context: format!(
                    "drop rate over sanity bound: {} dropped vs {} valid",
                    total_dropped, valid
                ),
            });
        }
        Ok(())
    }
}

pub struct LiveSource {
    ws_url: String,
    instrument: String,
    venue: VenueClient,
    tape: parking_lot::Mutex<TapeState>,
    mid_cache: parking_lot::Mutex<MidCache>,
    handlers: tokio::sync::Mutex<Vec<Box<dyn TradeHandler>>>,
    stopped: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    valid_rows: Arc<AtomicU64>,
    dropped_rows: Arc<AtomicU64>,
}

impl LiveSource {
    pub fn new(ws_url: &str, instrument: &str, venue: VenueClient) -> Self {
        Self {
            ws_url: ws_url.to_string(),
            instrument: instrument.to_string(),
            venue,
            tape: parking_lot::Mutex::new(TapeState::default()),
            mid_cache: parking_lot::Mutex::new(MidCache::default()),
            handlers: tokio::sync::Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            valid_rows: Arc::new(AtomicU64::new(0)),
            dropped_rows: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Rows dropped as malformed so far.
    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows.load(Ordering::Relaxed)
    }

    fn observe_batch(&self, batch: &[Trade]) {
        let mut tape = self.tape.lock();
        for trade in batch {
            tape.last_trade_price = Some(trade.price);
            match trade.side {
                Side::Buy => tape.last_buy_price = Some(trade.price),
                Side::Sell => tape.last_sell_price = Some(trade.price),
            }
        }
    }

    async fn venue_mid(&self) -> Option<f64> {
        let now = Utc::now().timestamp_millis();
        {
            let cache = self.mid_cache.lock();
            if cache.fetched_at > 0 && now - cache.fetched_at < MID_CACHE_MS {
                return cache.mid;
            }
        }
        match self.venue.mid(&self.instrument).await {
            Ok(mid) => {
                let mut cache = self.mid_cache.lock();
                cache.fetched_at = now;
                cache.mid = mid;
                mid
            }
            Err(e) => {
                warn!("Mid fetch failed: {}", e);
                self.mid_cache.lock().mid
            }
        }
    }

    async fn account_snapshot(&self) -> Option<super::venue::AccountState> {
        match self.venue.account(&self.instrument).await {
            Ok(account) => Some(account),
            Err(e) => {
                warn!("Account fetch failed: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl TradeSource for LiveSource {
    fn time(&self) -> Millis {
        Utc::now().timestamp_millis()
    }

    async fn add_trade_handler(&self, handler: Box<dyn TradeHandler>) {
        self.handlers.lock().await.push(handler);
    }

    async fn stream_trades(&self) -> Result<(), SourceError> {
        let (tx, mut rx) = mpsc::channel(BATCH_QUEUE_DEPTH);
        let reader = FeedReader {
            ws_url: self.ws_url.clone(),
            instrument: self.instrument.clone(),
            stopped: self.stopped.clone(),
            shutdown: self.shutdown.clone(),
            valid_rows: self.valid_rows.clone(),
            dropped_rows: self.dropped_rows.clone(),
        };
        tokio::spawn(reader.run(tx));

        // Single consumer: every handler sees every batch, in order. When
        // the reader drops the sender (stop or fatal), already-queued
        // batches drain before the loop ends.
        let mut handlers = self.handlers.lock().await;
        while let Some(item) = rx.recv().await {
            let batch = item?;
            self.observe_batch(&batch);
            for handler in handlers.iter_mut() {
                handler.on_trades(&batch).await?;
            }
        }
        info!("Live dispatch drained");
        Ok(())
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    async fn market_price(&self) -> Option<f64> {
        if let Some(mid) = self.venue_mid().await {
            return Some(mid);
        }
        // Fall back to the tape when the venue has no mid yet.
        let tape = self.tape.lock();
        match (tape.last_buy_price, tape.last_sell_price) {
            (Some(buy), Some(sell)) => Some((buy + sell) / 2.0),
            _ => None,
        }
    }

    async fn create_buy_order(
        &self,
        size: f64,
        slippage_tolerance: f64,
    ) -> Result<OrderOutcome, SourceError> {
        let hint = self.market_price().await;
        self.venue
            .submit(&self.instrument, true, size, hint, slippage_tolerance)
            .await
    }

    async fn create_sell_order(
        &self,
        size: f64,
        slippage_tolerance: f64,
    ) -> Result<OrderOutcome, SourceError> {
        let hint = self.market_price().await;
        self.venue
            .submit(&self.instrument, false, size, hint, slippage_tolerance)
            .await
    }

    async fn position_size(&self) -> f64 {
        self.account_snapshot()
            .await
            .map(|a| a.position)
            .unwrap_or(0.0)
    }

    async fn withdrawable(&self) -> f64 {
        self.account_snapshot()
            .await
            .map(|a| a.withdrawable)
            .unwrap_or(0.0)
    }

    async fn last_buy_price(&self) -> Option<f64> {
        self.tape.lock().last_buy_price
    }

    async fn last_sell_price(&self) -> Option<f64> {
        self.tape.lock().last_sell_price
    }

    async fn current_total_usd(&self) -> f64 {
        let account = match self.account_snapshot().await {
            Some(account) => account,
            None => return 0.0,
        };
        let mark = {
            let tape = self.tape.lock();
            tape.last_trade_price
        };
        match mark {
            Some(price) => account.cash + account.position * price,
            None => account.cash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_message_serialization() {
        let subscribe = SubscribeRequest {
            method: "subscribe",
            channel: "trades",
            instrument: "BTC",
        };
        let json = serde_json::to_string(&subscribe).unwrap();
        assert_eq!(
            json,
            r#"{"method":"subscribe","channel":"trades","instrument":"BTC"}"#
        );
    }

    #[test]
    fn test_confirmation_is_filtered() {
        let parsed = parse_feed_message(r#"{"channel":"subscribed","instrument":"BTC"}"#);
        assert!(matches!(parsed, FeedMessage::Subscribed));
    }

    #[test]
    fn test_data_message_parses_trades() {
        let text = r#"{
            "channel": "trades",
            "data": [
                {"time": 1700000000000, "price": 10.0, "size": 1.5, "side": "buy"},
                {"time": 1700000000100, "price": 10.1, "size": 0.5, "side": "sell"}
            ]
        }"#;
        match parse_feed_message(text) {
            FeedMessage::Trades { trades, dropped } => {
                assert_eq!(dropped, 0);
                assert_eq!(trades.len(), 2);
                assert_eq!(trades[0].side, Side::Buy);
                assert_eq!(trades[1].time, 1_700_000_000_100);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_rows_dropped_and_counted() {
        let text = r#"{
            "channel": "trades",
            "data": [
                {"time": 1700000000000, "price": 10.0, "size": 1.5, "side": "buy"},
                {"time": 1700000000100, "price": 10.1, "size": 0.5},
                {"time": 1700000000200, "price": 10.2, "size": 0.5, "side": "hold"}
            ]
        }"#;
        match parse_feed_message(text) {
            FeedMessage::Trades { trades, dropped } => {
                assert_eq!(trades.len(), 1);
                assert_eq!(dropped, 2);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_channel_is_control() {
        let parsed = parse_feed_message(r#"{"channel":"heartbeat"}"#);
        assert!(matches!(parsed, FeedMessage::Control(ref c) if c == "heartbeat"));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(parse_feed_message("not json"), FeedMessage::Malformed));
        // trades envelope with non-array payload counts one drop
        match parse_feed_message(r#"{"channel":"trades","data":{"oops":1}}"#) {
            FeedMessage::Trades { trades, dropped } => {
                assert!(trades.is_empty());
                assert_eq!(dropped, 1);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_drop_rate_bound() {
        let reader = FeedReader {
            ws_url: String::new(),
            instrument: "BTC".to_string(),
            stopped: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            valid_rows: Arc::new(AtomicU64::new(1_000)),
            dropped_rows: Arc::new(AtomicU64::new(0)),
        };
        // Under the minimum count: fine even at a high rate.
        assert!(reader.check_drop_rate(24).is_ok());
        // Past the minimum but only ~2.4% of rows: fine.
        assert!(reader.check_drop_rate(25).is_ok());
        // 200 dropped vs 1000 valid is over 10%: fatal.
        let err = reader.check_drop_rate(200).unwrap_err();
        assert!(matches!(err, SourceError::Malformed { .. }));
    }
}
