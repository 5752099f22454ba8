//! Deterministic provider for offline runs (`--offline`) and tests.
//! Values are set by the caller; flipping `set_online(false)` makes every
//! call fail with `Unavailable`.

use std::{
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{derived_reference_price, ChainDataProvider};
use crate::errors::{EngineError, EngineResult};
use crate::models::{PriceSource, ReferencePrice};

pub struct ScriptedProvider {
    online: AtomicBool,
    oracle_online: AtomicBool,
    gas_gwei: Mutex<f64>,
    price_usd: Mutex<f64>,
    balance_eth: Mutex<f64>,
    block: AtomicU64,
    delay: Mutex<Duration>,
    calls: AtomicU64,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new(25.0, 3_000.0)
    }
}

impl ScriptedProvider {
    pub fn new(gas_gwei: f64, price_usd: f64) -> Self {
        Self {
            online: AtomicBool::new(true),
            oracle_online: AtomicBool::new(true),
            gas_gwei: Mutex::new(gas_gwei),
            price_usd: Mutex::new(price_usd),
            balance_eth: Mutex::new(0.0),
            block: AtomicU64::new(19_000_000),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Oracle outage only; gas and block reads keep working
    pub fn set_oracle_online(&self, online: bool) {
        self.oracle_online.store(online, Ordering::SeqCst);
    }

    pub fn set_gas(&self, gwei: f64) {
        *self.gas_gwei.lock() = gwei;
    }

    pub fn set_price(&self, usd: f64) {
        *self.price_usd.lock() = usd;
    }

    pub fn set_balance(&self, eth: f64) {
        *self.balance_eth.lock() = eth;
    }

    /// Artificial latency applied to every call
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> EngineResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::unavailable("scripted provider offline"))
        }
    }
}

#[async_trait]
impl ChainDataProvider for ScriptedProvider {
    async fn gas_price_gwei(&self) -> EngineResult<f64> {
        self.enter().await?;
        Ok(*self.gas_gwei.lock())
    }

    async fn reference_price(&self) -> EngineResult<ReferencePrice> {
        self.enter().await?;
        if self.oracle_online.load(Ordering::SeqCst) {
            Ok(ReferencePrice {
                price_usd: *self.price_usd.lock(),
                source: PriceSource::Oracle,
            })
        } else {
            Ok(derived_reference_price(*self.gas_gwei.lock()))
        }
    }

    async fn block_height(&self) -> EngineResult<u64> {
        self.enter().await?;
        Ok(self.block.fetch_add(1, Ordering::SeqCst))
    }

    async fn balance_eth(&self, _address: &str) -> EngineResult<f64> {
        self.enter().await?;
        Ok(*self.balance_eth.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offline_fails_every_call() {
        let p = ScriptedProvider::new(40.0, 3_100.0);
        assert_eq!(p.gas_price_gwei().await.unwrap(), 40.0);

        p.set_online(false);
        assert!(p.gas_price_gwei().await.unwrap_err().is_unavailable());
        assert!(p.reference_price().await.is_err());
        assert!(p.block_height().await.is_err());
        assert_eq!(p.calls(), 4);
    }

    #[tokio::test]
    async fn test_setters_change_served_values() {
        let p = ScriptedProvider::default();
        p.set_gas(55.0);
        p.set_price(2_750.0);
        p.set_balance(0.25);
        assert_eq!(p.gas_price_gwei().await.unwrap(), 55.0);
        assert_eq!(p.reference_price().await.unwrap().price_usd, 2_750.0);
        assert_eq!(p.balance_eth("0x00").await.unwrap(), 0.25);

        // Derived price follows the updated gas reading
        p.set_oracle_online(false);
        assert_eq!(p.reference_price().await.unwrap().price_usd, 3_050.0);
    }

    #[tokio::test]
    async fn test_oracle_outage_falls_back_to_derived() {
        let p = ScriptedProvider::new(40.0, 3_100.0);
        p.set_oracle_online(false);
        let price = p.reference_price().await.unwrap();
        assert_eq!(price.source, PriceSource::Derived);
        assert_eq!(price.price_usd, 2_900.0);
    }
}
