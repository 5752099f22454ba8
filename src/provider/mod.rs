//! Blockchain data provider boundary
//!
//! The engine only ever reads from the chain: gas price, a reference price
//! from a Chainlink aggregator, block height, and an account balance once
//! live. `RpcProvider` talks JSON-RPC to an ordered list of endpoints;
//! `ScriptedProvider` serves fixed values for offline runs and tests.

pub mod rpc;
pub mod scripted;

pub use rpc::*;
pub use scripted::*;

use async_trait::async_trait;

use crate::errors::EngineResult;
use crate::models::{PriceSource, ReferencePrice};

/// Base of the gas-correlated fallback price (USD)
pub const DERIVED_PRICE_BASE_USD: f64 = 2_500.0;
/// USD added per gwei of gas in the fallback estimate
pub const DERIVED_PRICE_PER_GWEI: f64 = 10.0;

#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    /// Current gas price in gwei
    async fn gas_price_gwei(&self) -> EngineResult<f64>;

    /// Oracle price, or a gas-derived estimate if every oracle call failed
    async fn reference_price(&self) -> EngineResult<ReferencePrice>;

    async fn block_height(&self) -> EngineResult<u64>;

    /// Native balance of `address` in ETH
    async fn balance_eth(&self, address: &str) -> EngineResult<f64>;
}

/// Estimate used when the oracle is unreachable. Correlated with gas so that
/// callers always get a usable, non-constant number.
pub fn derived_reference_price(gas_price_gwei: f64) -> ReferencePrice {
    ReferencePrice {
        price_usd: DERIVED_PRICE_BASE_USD + DERIVED_PRICE_PER_GWEI * gas_price_gwei.max(0.0),
        source: PriceSource::Derived,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_price_tracks_gas() {
        let low = derived_reference_price(10.0);
        let high = derived_reference_price(40.0);
        assert_eq!(low.source, PriceSource::Derived);
        assert_eq!(low.price_usd, 2_600.0);
        assert_eq!(high.price_usd, 2_900.0);
        assert_eq!(derived_reference_price(-5.0).price_usd, DERIVED_PRICE_BASE_USD);
    }
}
