//! Venue REST Client
//!
//! Order submission and account state over the venue's HTTP API.
//! Constructed explicitly and passed to the live source; no globals.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::models::{OrderFill, OrderOutcome, RejectReason};

use super::SourceError;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    instrument: &'a str,
    side: &'a str,
    size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    price_hint: Option<f64>,
    slippage_tolerance: f64,
}

#[derive(Debug, Deserialize)]
struct WireFill {
    size: f64,
    avg_price: f64,
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    status: String,
    #[serde(default)]
    fills: Vec<WireFill>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InfoRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    instrument: &'a str,
}

/// Venue-side view of the trading account.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccountState {
    pub cash: f64,
    pub position: f64,
    pub withdrawable: f64,
    pub last_buy_price: Option<f64>,
    pub last_sell_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MidResponse {
    mid: Option<f64>,
}

pub struct VenueClient {
    http: reqwest::Client,
    base_url: String,
}

impl VenueClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build venue HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Submit an order. A non-ok venue status is a rejection; partial fills
    /// and per-order errors inside an ok response are both passed through.
    pub async fn submit(
        &self,
        instrument: &str,
        is_buy: bool,
        size: f64,
        price_hint: Option<f64>,
        slippage_tolerance: f64,
    ) -> Result<OrderOutcome, SourceError> {
        let request = OrderRequest {
            instrument,
            side: if is_buy { "buy" } else { "sell" },
            size,
            price_hint,
            slippage_tolerance,
        };

        let response: OrderResponse = self
            .post("orders", &request)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Malformed {
                context: format!("order response decode failed: {}", e),
            })?;

        if response.status != "ok" {
            let detail = if response.errors.is_empty() {
                response.status.clone()
            } else {
                response.errors.join("; ")
            };
            return Err(SourceError::OrderRejected(RejectReason::Venue(detail)));
        }

        debug!(
            fills = response.fills.len(),
            errors = response.errors.len(),
            "Order response received"
        );

        Ok(OrderOutcome {
            fills: response
                .fills
                .into_iter()
                .map(|f| OrderFill {
                    size: f.size,
                    avg_price: f.avg_price,
                    order_id: f.order_id,
                })
                .collect(),
            errors: response.errors,
        })
    }

    /// Current mid price, if the venue has one.
    pub async fn mid(&self, instrument: &str) -> Result<Option<f64>, SourceError> {
        let request = InfoRequest {
            kind: "mid",
            instrument,
        };
        let response: MidResponse = self
            .post("info", &request)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Malformed {
                context: format!("mid response decode failed: {}", e),
            })?;
        Ok(response.mid)
    }

    /// Account snapshot for the instrument.
    pub async fn account(&self, instrument: &str) -> Result<AccountState, SourceError> {
        let request = InfoRequest {
            kind: "account",
            instrument,
        };
        self.post("info", &request)
            .await?
            .json()
            .await
            .map_err(|e| SourceError::Malformed {
                context: format!("account response decode failed: {}", e),
            })
    }

    async fn post<T: Serialize>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<reqwest::Response, SourceError> {
        let url = format!("{}/{}", self.base_url, endpoint);
        self.http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| SourceError::Unavailable {
                context: format!("venue request to {} failed: {}", endpoint, e),
            })
    }
}
