// =============================================================================
// Bithumb REST API Client — HMAC-SHA512 signed requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Signed requests put
// the API key in the `Api-Key` header and a base64 HMAC-SHA512 signature of
// `endpoint \0 query \0 nonce` in `Api-Sign`.
//
// Two HTTP clients are held: public endpoints tolerate a 30 s read, private
// (signed) endpoints get 15 s so order placement fails fast. Both connect
// within 5 s.
// =============================================================================

use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha512;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use async_trait::async_trait;

use crate::market_data::Candle;
use crate::types::{Interval, Side};

use super::{ExchangeAdapter, ExchangeError, Fill, Ticker};

type HmacSha512 = Hmac<Sha512>;

const PUBLIC_READ_TIMEOUT: Duration = Duration::from_secs(30);
const PRIVATE_READ_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bithumb status code for success.
const STATUS_OK: &str = "0000";

/// Bithumb REST client for the KRW spot markets.
#[derive(Clone)]
pub struct BithumbClient {
    api_key: String,
    secret: String,
    base_url: String,
    /// Taker fee rate applied when estimating the fee on a market fill.
    fee_rate: Decimal,
    public_client: reqwest::Client,
    private_client: reqwest::Client,
}

impl BithumbClient {
    /// Create a new client. Keys may be empty for public-only (dry-run) use;
    /// signed calls will then fail with `Auth`.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, fee_rate: Decimal) -> Self {
        let public_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(PUBLIC_READ_TIMEOUT)
            .build()
            .expect("failed to build public reqwest client");

        let private_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(PRIVATE_READ_TIMEOUT)
            .build()
            .expect("failed to build private reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: "https://api.bithumb.com".to_string(),
            fee_rate,
            public_client,
            private_client,
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Base64 HMAC-SHA512 over `endpoint \0 query \0 nonce`.
    fn sign(&self, endpoint: &str, query: &str, nonce: &str) -> String {
        let payload = format!("{endpoint}\0{query}\0{nonce}");
        let mut mac = HmacSha512::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        let hex_digest = hex::encode(mac.finalize().into_bytes());
        base64::engine::general_purpose::STANDARD.encode(hex_digest.as_bytes())
    }

    /// Millisecond nonce for signed requests.
    fn nonce() -> String {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().to_string())
            .unwrap_or_else(|_| "0".to_string())
    }

    /// "BTC/KRW" -> "BTC_KRW" (public path segment form).
    fn path_pair(pair: &str) -> String {
        pair.replace('/', "_")
    }

    /// ("BTC", "KRW") from "BTC/KRW".
    fn split_pair(pair: &str) -> Result<(&str, &str), ExchangeError> {
        let mut parts = pair.split('/');
        match (parts.next(), parts.next()) {
            (Some(base), Some(quote)) if !base.is_empty() && !quote.is_empty() => {
                Ok((base, quote))
            }
            _ => Err(ExchangeError::InvalidParam(format!("malformed pair: {pair}"))),
        }
    }

    // -------------------------------------------------------------------------
    // Error mapping
    // -------------------------------------------------------------------------

    /// Map a transport-level reqwest failure into the adapter taxonomy.
    fn map_transport(err: reqwest::Error) -> ExchangeError {
        if err.is_timeout() || err.is_connect() {
            ExchangeError::Transient(format!("transport: {err}"))
        } else {
            ExchangeError::Permanent(format!("transport: {err}"))
        }
    }

    /// Map an HTTP status + Bithumb status code into the taxonomy.
    fn map_response(
        http: reqwest::StatusCode,
        retry_after: Option<Duration>,
        body: &serde_json::Value,
    ) -> Option<ExchangeError> {
        if http.as_u16() == 429 {
            return Some(ExchangeError::RateLimited { retry_after });
        }
        if http.is_server_error() {
            return Some(ExchangeError::Transient(format!("HTTP {http}")));
        }

        let status = body.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if status == STATUS_OK {
            return None;
        }
        let message = body
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("no message")
            .to_string();

        // Bithumb API status codes: 51xx request issues, 5300 bad API key /
        // signature, 5302 rate limit, 5500 invalid parameter.
        Some(match status {
            "5300" | "5301" => ExchangeError::Auth(format!("{status}: {message}")),
            "5302" => ExchangeError::RateLimited { retry_after: None },
            "5100" | "5500" => ExchangeError::InvalidParam(format!("{status}: {message}")),
            "5400" => ExchangeError::Transient(format!("{status}: {message}")),
            _ => ExchangeError::Permanent(format!("{status}: {message}")),
        })
    }

    fn retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Parse a JSON value that may be a string or a number into `f64`.
    fn json_f64(value: &serde_json::Value) -> Result<f64, ExchangeError> {
        if let Some(s) = value.as_str() {
            s.parse::<f64>()
                .map_err(|_| ExchangeError::Permanent(format!("unparseable number: '{s}'")))
        } else if let Some(n) = value.as_f64() {
            Ok(n)
        } else {
            Err(ExchangeError::Permanent(format!(
                "expected string or number, got: {value}"
            )))
        }
    }

    fn json_decimal(value: &serde_json::Value) -> Result<Decimal, ExchangeError> {
        if let Some(s) = value.as_str() {
            Decimal::from_str(s)
                .map_err(|_| ExchangeError::Permanent(format!("unparseable decimal: '{s}'")))
        } else if let Some(n) = value.as_f64() {
            Decimal::try_from(n)
                .map_err(|_| ExchangeError::Permanent(format!("unrepresentable decimal: {n}")))
        } else {
            Err(ExchangeError::Permanent(format!(
                "expected string or number, got: {value}"
            )))
        }
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn get_public(&self, path: &str) -> Result<serde_json::Value, ExchangeError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .public_client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let http = resp.status();
        let retry_after = Self::retry_after_header(resp.headers());
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("body decode: {e}")))?;

        if let Some(err) = Self::map_response(http, retry_after, &body) {
            return Err(err);
        }
        Ok(body)
    }

    async fn post_signed(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
    ) -> Result<serde_json::Value, ExchangeError> {
        if !self.has_credentials() {
            return Err(ExchangeError::Auth("API credentials not configured".into()));
        }

        let mut form: Vec<(String, String)> = vec![("endpoint".to_string(), endpoint.to_string())];
        form.extend(params.iter().map(|(k, v)| (k.to_string(), v.to_string())));

        let query = form
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");

        let nonce = Self::nonce();
        let signature = self.sign(endpoint, &query, &nonce);

        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .private_client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("Api-Sign", signature)
            .header("Api-Nonce", nonce)
            .form(&form)
            .send()
            .await
            .map_err(Self::map_transport)?;

        let http = resp.status();
        let retry_after = Self::retry_after_header(resp.headers());
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Transient(format!("body decode: {e}")))?;

        if let Some(err) = Self::map_response(http, retry_after, &body) {
            return Err(err);
        }
        Ok(body)
    }
}

#[async_trait]
impl ExchangeAdapter for BithumbClient {
    /// GET /public/candlestick/{PAIR}/{interval}.
    ///
    /// Response rows are `[timestamp_ms, open, close, high, low, volume]`
    /// with prices as strings, oldest first.
    #[instrument(skip(self), name = "bithumb::get_ohlcv")]
    async fn get_ohlcv(
        &self,
        pair: &str,
        interval: Interval,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let path = format!(
            "/public/candlestick/{}/{}",
            Self::path_pair(pair),
            interval.as_str()
        );
        let body = self.get_public(&path).await?;

        let rows = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::Permanent("candlestick data missing".into()))?;

        let mut candles = Vec::with_capacity(rows.len().min(limit as usize));
        for row in rows {
            let cols = row
                .as_array()
                .ok_or_else(|| ExchangeError::Permanent("candlestick row not an array".into()))?;
            if cols.len() < 6 {
                warn!(len = cols.len(), "skipping malformed candlestick row");
                continue;
            }
            let open_time = cols[0].as_i64().unwrap_or(0);
            let open = Self::json_f64(&cols[1])?;
            let close = Self::json_f64(&cols[2])?;
            let high = Self::json_f64(&cols[3])?;
            let low = Self::json_f64(&cols[4])?;
            let volume = Self::json_f64(&cols[5])?;
            candles.push(Candle::new(open_time, open, high, low, close, volume));
        }

        // Keep only the trailing `limit` bars.
        if candles.len() > limit as usize {
            candles.drain(..candles.len() - limit as usize);
        }

        debug!(pair, %interval, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    /// GET /public/ticker/{PAIR}.
    #[instrument(skip(self), name = "bithumb::get_ticker")]
    async fn get_ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        let path = format!("/public/ticker/{}", Self::path_pair(pair));
        let body = self.get_public(&path).await?;

        let last_price = body
            .get("data")
            .and_then(|d| d.get("closing_price"))
            .map(Self::json_decimal)
            .transpose()?
            .ok_or_else(|| ExchangeError::Permanent("ticker closing_price missing".into()))?;

        Ok(Ticker {
            pair: pair.to_string(),
            last_price,
            at: Utc::now(),
        })
    }

    /// POST /trade/market_buy or /trade/market_sell (signed).
    ///
    /// Bithumb's market endpoints return only an order id; the fill price is
    /// estimated from the latest ticker and the fee from the configured taker
    /// rate.
    #[instrument(skip(self), name = "bithumb::place_market_order")]
    async fn place_market_order(
        &self,
        pair: &str,
        side: Side,
        qty: Decimal,
    ) -> Result<Fill, ExchangeError> {
        if qty <= Decimal::ZERO {
            return Err(ExchangeError::InvalidParam(format!(
                "non-positive order qty: {qty}"
            )));
        }
        let (base, quote) = Self::split_pair(pair)?;

        let endpoint = match side {
            Side::Buy => "/trade/market_buy",
            Side::Sell => "/trade/market_sell",
        };
        let units = qty.normalize().to_string();
        let body = self
            .post_signed(
                endpoint,
                &[
                    ("order_currency", base),
                    ("payment_currency", quote),
                    ("units", units.as_str()),
                ],
            )
            .await?;

        let order_id = body
            .get("order_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let ticker = self.get_ticker(pair).await?;
        let fee = (qty * ticker.last_price * self.fee_rate).round_dp(2);

        debug!(pair, %side, %qty, order_id = %order_id, "market order placed");

        Ok(Fill {
            order_id,
            qty,
            avg_price: ticker.last_price,
            fee,
        })
    }

    /// GET-style balance lookup via POST /info/balance (signed).
    #[instrument(skip(self), name = "bithumb::get_balance")]
    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let body = self
            .post_signed("/info/balance", &[("currency", currency)])
            .await?;

        let key = format!("available_{}", currency.to_lowercase());
        let amount = body
            .get("data")
            .and_then(|d| d.get(&key))
            .map(Self::json_decimal)
            .transpose()?
            .unwrap_or(Decimal::ZERO);

        debug!(currency, %amount, "balance retrieved");
        Ok(amount)
    }
}

impl std::fmt::Debug for BithumbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BithumbClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
