// ============================================================================
// Oracle Feed - settlement prices for commodity markets
// ============================================================================
//
// The prediction service publishes one observed price per commodity. The
// engine only consumes it in `resolve()`; it never derives prices itself.
//
//   OracleFeed trait → StaticOracleFeed (mock mode, tests)
//                    → HttpOracleFeed (price service, cached)
// ============================================================================

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::models::OraclePrice;

/// How long a fetched price is served from memory
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);

#[async_trait]
pub trait OracleFeed: Send + Sync {
    /// Latest observed price for `commodity`, in cents
    async fn latest_price(&self, commodity: &str) -> Result<OraclePrice>;

    fn source_name(&self) -> &str;
}

/// Dollar quote ("3.125") to whole cents, half away from zero
pub fn dollars_to_cents(price: Decimal) -> Result<u64> {
    if price <= Decimal::ZERO {
        return Err(EngineError::Oracle(format!("non-positive price {}", price)));
    }
    (price * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_u64()
        .ok_or_else(|| EngineError::Oracle(format!("price {} out of range", price)))
}

// ============================================================================
// STATIC FEED
// ============================================================================

/// Prices set by hand. Used in mock mode and by tests.
pub struct StaticOracleFeed {
    prices: RwLock<HashMap<String, u64>>,
    clock: Arc<dyn Clock>,
}

impl StaticOracleFeed {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn set_price(&self, commodity: &str, cents: u64) {
        if let Ok(mut prices) = self.prices.write() {
            prices.insert(commodity.to_uppercase(), cents);
        }
    }
}

#[async_trait]
impl OracleFeed for StaticOracleFeed {
    async fn latest_price(&self, commodity: &str) -> Result<OraclePrice> {
        let cents = self
            .prices
            .read()
            .ok()
            .and_then(|p| p.get(&commodity.to_uppercase()).copied())
            .ok_or_else(|| EngineError::Oracle(format!("no price for {}", commodity)))?;
        Ok(OraclePrice {
            commodity: commodity.to_uppercase(),
            actual_price: cents,
            resolved_at: self.clock.now(),
        })
    }

    fn source_name(&self) -> &str {
        "static"
    }
}

// ============================================================================
// HTTP FEED
// ============================================================================

#[derive(Debug, Deserialize)]
struct PriceResponse {
    /// USD per unit
    price: serde_json::Number,
    #[serde(default)]
    timestamp: Option<i64>,
}

/// Price service client: `GET {base}/prices/{COMMODITY}` → `{"price": 3.12, "timestamp": ...}`
pub struct HttpOracleFeed {
    base_url: String,
    client: Client,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    cache: RwLock<HashMap<String, (Instant, OraclePrice)>>,
}

impl HttpOracleFeed {
    pub fn new(base_url: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            clock,
            ttl: DEFAULT_CACHE_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn cached(&self, commodity: &str) -> Option<OraclePrice> {
        let cache = self.cache.read().ok()?;
        let (fetched_at, price) = cache.get(commodity)?;
        (fetched_at.elapsed() < self.ttl).then(|| price.clone())
    }
}

#[async_trait]
impl OracleFeed for HttpOracleFeed {
    async fn latest_price(&self, commodity: &str) -> Result<OraclePrice> {
        let commodity = commodity.to_uppercase();
        if let Some(price) = self.cached(&commodity) {
            return Ok(price);
        }

        let url = format!("{}/prices/{}", self.base_url, commodity);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::Oracle(format!("request failed: {}", e)))?;
        if !response.status().is_success() {
            warn!(commodity = %commodity, status = %response.status(), "price service error");
            return Err(EngineError::Oracle(format!(
                "price service returned {} for {}",
                response.status(),
                commodity
            )));
        }
        let body: PriceResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Oracle(format!("malformed price response: {}", e)))?;

        let dollars = Decimal::from_str(&body.price.to_string())
            .or_else(|_| Decimal::from_scientific(&body.price.to_string()))
            .map_err(|e| EngineError::Oracle(format!("unreadable price {}: {}", body.price, e)))?;
        let price = OraclePrice {
            commodity: commodity.clone(),
            actual_price: dollars_to_cents(dollars)?,
            resolved_at: body.timestamp.unwrap_or_else(|| self.clock.now()),
        };
        debug!(commodity = %commodity, cents = price.actual_price, "fetched oracle price");

        if let Ok(mut cache) = self.cache.write() {
            cache.insert(commodity, (Instant::now(), price.clone()));
        }
        Ok(price)
    }

    fn source_name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dollars_round_to_cents() {
        assert_eq!(dollars_to_cents(dec!(3.125)).unwrap(), 313);
        assert_eq!(dollars_to_cents(dec!(2.50)).unwrap(), 250);
        assert_eq!(dollars_to_cents(dec!(0.004)).unwrap(), 0);
        assert!(dollars_to_cents(dec!(0)).is_err());
        assert!(dollars_to_cents(dec!(-1.5)).is_err());
    }

    #[tokio::test]
    async fn test_static_feed() {
        let clock = Arc::new(ManualClock::new(1_000));
        let feed = StaticOracleFeed::new(clock.clone());
        assert!(feed.latest_price("COCOA").await.is_err());

        feed.set_price("cocoa", 310_00);
        clock.advance(60);
        let price = feed.latest_price("Cocoa").await.unwrap();
        assert_eq!(price.commodity, "COCOA");
        assert_eq!(price.actual_price, 310_00);
        assert_eq!(price.resolved_at, 1_060);
    }

    #[test]
    fn test_unreachable_price_service() {
        let feed = HttpOracleFeed::new("http://127.0.0.1:9/", Arc::new(ManualClock::new(0)));
        assert_eq!(feed.source_name(), "http");
        let err = tokio_test::block_on(feed.latest_price("tea")).unwrap_err();
        assert_eq!(err.kind(), "oracle_error");
    }
}
