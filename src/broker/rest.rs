//! REST Brokerage Adapter
//!
//! HTTP client for a hosted brokerage gateway with token-pair session
//! authentication: a login call returns a client session token (`CST`) and
//! an account security token (`X-SECURITY-TOKEN`) in response headers, and
//! both ride along on every subsequent request. Sessions are short-lived,
//! so the pair is refreshed proactively before expiry.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{OrderResult, OrderSide};
use crate::bars::Bar;

/// Default API base URL for the demo environment
pub const DEFAULT_BASE_URL: &str = "https://demo-api-capital.backend-capital.com";

/// Sessions expire after ~10 minutes of inactivity; refresh well before
const TOKEN_LIFETIME: Duration = Duration::from_secs(8 * 60);

/// Credentials and endpoint for the REST session
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub identifier: String,
    pub password: String,
    pub api_key: String,
    pub base_url: String,
}

impl RestConfig {
    /// Read credentials from environment variables
    ///
    /// Expects:
    /// - `RANGEFADE_REST_IDENTIFIER` - account login
    /// - `RANGEFADE_REST_PASSWORD` - account password
    /// - `RANGEFADE_REST_API_KEY` - API key issued for this account
    /// - `RANGEFADE_REST_BASE_URL` (optional) - defaults to the demo gateway
    pub fn from_env() -> Result<Self> {
        let identifier = std::env::var("RANGEFADE_REST_IDENTIFIER")
            .context("RANGEFADE_REST_IDENTIFIER environment variable not set")?;
        let password = std::env::var("RANGEFADE_REST_PASSWORD")
            .context("RANGEFADE_REST_PASSWORD environment variable not set")?;
        let api_key = std::env::var("RANGEFADE_REST_API_KEY")
            .context("RANGEFADE_REST_API_KEY environment variable not set")?;
        let base_url = std::env::var("RANGEFADE_REST_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());

        Ok(Self {
            identifier,
            password,
            api_key,
            base_url,
        })
    }
}

/// REST client with automatic session-token management
pub struct RestBroker {
    client: Client,
    config: RestConfig,
    cst: Option<String>,
    security_token: Option<String>,
    tokens_acquired_at: Option<Instant>,
}

// ============================================================================
// Wire models
// ============================================================================

#[derive(Debug, Serialize)]
struct SessionRequest {
    identifier: String,
    password: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceQuote {
    bid: f64,
    ask: f64,
}

impl PriceQuote {
    fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriceCandle {
    #[serde(rename = "snapshotTimeUTC")]
    snapshot_time_utc: String,
    open_price: PriceQuote,
    high_price: PriceQuote,
    low_price: PriceQuote,
    close_price: PriceQuote,
    last_traded_volume: u64,
}

#[derive(Debug, Deserialize)]
struct PricesResponse {
    prices: Vec<PriceCandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketSummary {
    epic: String,
    instrument_name: String,
}

#[derive(Debug, Deserialize)]
struct MarketSearchResponse {
    markets: Vec<MarketSummary>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePositionRequest {
    epic: String,
    direction: String,
    size: f64,
    stop_level: f64,
    profit_level: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatePositionResponse {
    deal_reference: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DealConfirmation {
    deal_status: String,
    #[serde(default)]
    deal_id: Option<String>,
    #[serde(default)]
    reject_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenPositionMarket {
    epic: String,
}

#[derive(Debug, Deserialize)]
struct OpenPosition {
    market: OpenPositionMarket,
}

#[derive(Debug, Deserialize)]
struct OpenPositionsResponse {
    positions: Vec<OpenPosition>,
}

// ============================================================================
// Client
// ============================================================================

impl RestBroker {
    pub fn new(config: RestConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create HTTP client"),
            config,
            cst: None,
            security_token: None,
            tokens_acquired_at: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Ok(Self::new(RestConfig::from_env()?))
    }

    /// Check if the token pair needs refresh
    fn tokens_need_refresh(&self) -> bool {
        match self.tokens_acquired_at {
            Some(acquired_at) => acquired_at.elapsed() > TOKEN_LIFETIME,
            None => true,
        }
    }

    /// Ensure a valid session, logging in again if necessary
    async fn ensure_authenticated(&mut self) -> Result<()> {
        if self.cst.is_none() || self.tokens_need_refresh() {
            self.authenticate().await?;
        }
        Ok(())
    }

    /// Open a session and capture the token pair from response headers
    pub async fn authenticate(&mut self) -> Result<()> {
        info!("Opening REST brokerage session...");

        let request = SessionRequest {
            identifier: self.config.identifier.clone(),
            password: self.config.password.clone(),
        };

        let response = self
            .client
            .post(format!("{}/api/v1/session", self.config.base_url))
            .header("X-CAP-API-KEY", &self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send session request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Session login failed ({}): {}", status, body));
        }

        let header_token = |name: &str| -> Result<String> {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .ok_or_else(|| anyhow!("session response missing {} header", name))
        };

        self.cst = Some(header_token("CST")?);
        self.security_token = Some(header_token("X-SECURITY-TOKEN")?);
        self.tokens_acquired_at = Some(Instant::now());

        info!("REST session established");
        Ok(())
    }

    fn session_tokens(&self) -> Result<(&str, &str)> {
        let cst = self
            .cst
            .as_deref()
            .ok_or_else(|| anyhow!("Not authenticated - call authenticate() first"))?;
        let sec = self
            .security_token
            .as_deref()
            .ok_or_else(|| anyhow!("Not authenticated - call authenticate() first"))?;
        Ok((cst, sec))
    }

    /// Make an authenticated GET request
    async fn get<R: serde::de::DeserializeOwned>(&self, endpoint: &str) -> Result<R> {
        let (cst, sec) = self.session_tokens()?;

        let response = self
            .client
            .get(format!("{}{}", self.config.base_url, endpoint))
            .header("CST", cst)
            .header("X-SECURITY-TOKEN", sec)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Request to {} failed ({}): {}", endpoint, status, body));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", endpoint))
    }

    /// Make an authenticated POST request
    async fn post<T: serde::Serialize, R: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: &T,
    ) -> Result<R> {
        let (cst, sec) = self.session_tokens()?;

        let response = self
            .client
            .post(format!("{}{}", self.config.base_url, endpoint))
            .header("CST", cst)
            .header("X-SECURITY-TOKEN", sec)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Request to {} failed ({}): {}", endpoint, status, body));
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {}", endpoint))
    }

    /// Fetch the most recent `lookback` 5-minute candles as mid-price bars
    pub async fn fetch_bars(&mut self, instrument: &str, lookback: usize) -> Result<Vec<Bar>> {
        self.ensure_authenticated().await?;

        let endpoint = format!(
            "/api/v1/prices/{}?resolution=MINUTE_5&max={}",
            instrument, lookback
        );
        let response: PricesResponse = self.get(&endpoint).await?;

        let mut bars = Vec::with_capacity(response.prices.len());
        for candle in &response.prices {
            let naive =
                NaiveDateTime::parse_from_str(&candle.snapshot_time_utc, "%Y-%m-%dT%H:%M:%S")
                    .with_context(|| {
                        format!("unparseable candle time '{}'", candle.snapshot_time_utc)
                    })?;
            bars.push(Bar {
                instrument: instrument.to_string(),
                timestamp: DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc),
                open: candle.open_price.mid(),
                high: candle.high_price.mid(),
                low: candle.low_price.mid(),
                close: candle.close_price.mid(),
                volume: candle.last_traded_volume,
            });
        }

        debug!("Fetched {} candles for {}", bars.len(), instrument);
        Ok(bars)
    }

    /// Find the epic whose name matches the symbol
    pub async fn resolve_instrument(&mut self, symbol: &str) -> Result<Option<String>> {
        self.ensure_authenticated().await?;

        let endpoint = format!("/api/v1/markets?searchTerm={}", symbol);
        let response: MarketSearchResponse = self.get(&endpoint).await?;

        for market in &response.markets {
            if market.epic == symbol || market.instrument_name == symbol {
                debug!("Resolved {} -> {}", symbol, market.epic);
                return Ok(Some(market.epic.clone()));
            }
        }

        warn!(
            "Market '{}' not found. Candidates: {:?}",
            symbol,
            response.markets.iter().map(|m| &m.epic).collect::<Vec<_>>()
        );
        Ok(None)
    }

    /// Place a market order with attached stop and profit levels, then poll
    /// the deal confirmation for acceptance
    pub async fn place_market_order(
        &mut self,
        instrument_id: &str,
        side: OrderSide,
        size: f64,
        sl: f64,
        tp: f64,
        comment: &str,
    ) -> Result<OrderResult> {
        self.ensure_authenticated().await?;

        let request = CreatePositionRequest {
            epic: instrument_id.to_string(),
            direction: side.to_string(),
            size,
            stop_level: sl,
            profit_level: tp,
        };

        info!(
            "Placing {} {} {} @ MKT | SL: {:.2} | TP: {:.2} | tag: {}",
            side, size, instrument_id, sl, tp, comment
        );

        let created: CreatePositionResponse = self.post("/api/v1/positions", &request).await?;

        let confirm: DealConfirmation = self
            .get(&format!("/api/v1/confirms/{}", created.deal_reference))
            .await?;

        if confirm.deal_status == "ACCEPTED" {
            Ok(OrderResult {
                success: true,
                code: confirm.deal_status,
                order_id: confirm.deal_id,
                message: format!("deal {} accepted ({})", created.deal_reference, comment),
            })
        } else {
            Ok(OrderResult {
                success: false,
                code: confirm.reject_reason.unwrap_or(confirm.deal_status),
                order_id: confirm.deal_id,
                message: format!("deal {} rejected", created.deal_reference),
            })
        }
    }

    /// Epics with a currently open position
    pub async fn open_position_symbols(&mut self) -> Result<HashSet<String>> {
        self.ensure_authenticated().await?;

        let response: OpenPositionsResponse = self.get("/api/v1/positions").await?;
        let symbols: HashSet<String> = response
            .positions
            .into_iter()
            .map(|p| p.market.epic)
            .collect();

        debug!("{} open positions on the REST account", symbols.len());
        Ok(symbols)
    }
}
