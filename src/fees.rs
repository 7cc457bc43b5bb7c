// src/fees.rs
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::types::{Address, U256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::PaymasterError;
use crate::types::{PriceReading, PriceState, SettlementContext, TokenAdjustment};

/// Markup denominator: a markup of 110 means a 10% safety margin.
pub const PRICE_DENOMINATOR: u32 = 100;
/// Deviation-threshold denominator; thresholds are expressed in ppm.
pub const THRESHOLD_DENOMINATOR: u64 = 1_000_000;
/// Fixed gas the settlement call itself consumes, charged on top of the
/// reported actual gas cost.
pub const REFUND_POSTOP_COST: u64 = 40_000;

const NATIVE_DECIMALS: u32 = 18;

/// One price feed, read as a `(price, updatedAt)` pair. The engine never
/// produces prices, it only consumes reads.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn latest_round(&self) -> Result<PriceReading, PaymasterError>;
}

/// Owner-mutable pricing knobs.
#[derive(Debug, Clone, Copy)]
struct FeeKnobs {
    price_markup: u32,
    update_threshold_ppm: u64,
}

/// Oracle-driven token fee computation for the metered variant.
///
/// Both feeds must quote against the same reference currency with the same
/// decimals, so the quote decimals cancel out of the token-per-native price.
pub struct FeeEngine {
    token: Address,
    token_decimals: u8,
    token_feed: Arc<dyn PriceFeed>,
    native_feed: Arc<dyn PriceFeed>,
    knobs: std::sync::Mutex<FeeKnobs>,
    // Shared across all in-flight operations; the explicit lock stands in
    // for the serialization the original host ledger provided.
    price: Mutex<Option<PriceState>>,
}

impl std::fmt::Debug for FeeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeeEngine")
            .field("token", &self.token)
            .field("token_decimals", &self.token_decimals)
            .finish_non_exhaustive()
    }
}

impl FeeEngine {
    pub fn new(
        token: Address,
        token_decimals: u8,
        price_markup: u32,
        update_threshold_ppm: u64,
        token_feed: Arc<dyn PriceFeed>,
        native_feed: Arc<dyn PriceFeed>,
    ) -> Result<Self, PaymasterError> {
        if price_markup < PRICE_DENOMINATOR {
            return Err(PaymasterError::MarkupTooLow(price_markup));
        }
        Ok(Self {
            token,
            token_decimals,
            token_feed,
            native_feed,
            knobs: std::sync::Mutex::new(FeeKnobs {
                price_markup,
                update_threshold_ppm,
            }),
            price: Mutex::new(None),
        })
    }

    pub fn token(&self) -> Address {
        self.token
    }

    pub fn price_markup(&self) -> u32 {
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).price_markup
    }

    pub fn set_price_markup(&self, price_markup: u32) -> Result<(), PaymasterError> {
        if price_markup < PRICE_DENOMINATOR {
            return Err(PaymasterError::MarkupTooLow(price_markup));
        }
        self.knobs.lock().unwrap_or_else(|e| e.into_inner()).price_markup = price_markup;
        Ok(())
    }

    pub fn set_update_threshold(&self, update_threshold_ppm: u64) {
        self.knobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_threshold_ppm = update_threshold_ppm;
    }

    pub async fn cached_price(&self) -> Option<PriceState> {
        *self.price.lock().await
    }

    /// Reads both feeds and applies the cache-update rule: the cached price
    /// is rewritten only on first observation or when the fresh price
    /// deviates from it by at least the configured threshold. Feed reads
    /// older than `max_price_age` are rejected outright; the staleness
    /// bound is the caller's policy, not this engine's.
    pub async fn refresh_price(
        &self,
        max_price_age: Duration,
    ) -> Result<PriceState, PaymasterError> {
        let token_round = self.token_feed.latest_round().await?;
        let native_round = self.native_feed.latest_round().await?;
        let now = unix_now()?;
        for round in [&token_round, &native_round] {
            if round.price.is_zero() {
                return Err(PaymasterError::InvalidOraclePrice);
            }
            if now.saturating_sub(round.updated_at) > max_price_age.as_secs() {
                return Err(PaymasterError::StalePriceFeed {
                    updated_at: round.updated_at,
                    max_age_secs: max_price_age.as_secs(),
                });
            }
        }

        // token base units per 1e18 wei; quote decimals cancel
        let fresh = native_round
            .price
            .checked_mul(U256::exp10(self.token_decimals as usize))
            .ok_or(PaymasterError::FeeOverflow)?
            .checked_div(token_round.price)
            .ok_or(PaymasterError::InvalidOraclePrice)?;

        let threshold = self
            .knobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_threshold_ppm;
        let mut cell = self.price.lock().await;
        let next = match *cell {
            None => {
                info!(price = %fresh, "initial token price observed");
                PriceState {
                    cached_price: fresh,
                    last_updated_at: now,
                }
            }
            Some(state) => {
                let deviation = deviation_ppm(fresh, state.cached_price)?;
                if deviation >= threshold {
                    info!(
                        old = %state.cached_price,
                        new = %fresh,
                        deviation_ppm = deviation,
                        "token price cache updated"
                    );
                    PriceState {
                        cached_price: fresh,
                        last_updated_at: now,
                    }
                } else {
                    debug!(deviation_ppm = deviation, "token price within threshold, cache kept");
                    state
                }
            }
        };
        *cell = Some(next);
        Ok(next)
    }

    /// Converts an estimated native gas cost into the token amount to
    /// reserve, markup included.
    pub async fn estimate_cost(
        &self,
        gas_cost_estimate: U256,
        max_price_age: Duration,
    ) -> Result<U256, PaymasterError> {
        let state = self.refresh_price(max_price_age).await?;
        self.token_amount(gas_cost_estimate, state.cached_price)
    }

    /// Post-execution reconciliation. Charges for the actual gas cost plus
    /// the fixed settlement overhead at the cached price and reports the
    /// signed difference against what validation reserved. Never refuses a
    /// mismatch: by now the operation may be irreversibly committed.
    pub async fn settle(
        &self,
        context: &SettlementContext,
        actual_gas_cost: U256,
    ) -> Result<(U256, TokenAdjustment), PaymasterError> {
        let state = self
            .cached_price()
            .await
            .ok_or(PaymasterError::PriceNotInitialized)?;
        let settlement_gas = U256::from(REFUND_POSTOP_COST)
            .checked_mul(context.max_fee_per_gas)
            .ok_or(PaymasterError::FeeOverflow)?;
        let total_cost = actual_gas_cost
            .checked_add(settlement_gas)
            .ok_or(PaymasterError::FeeOverflow)?;
        let owed = self.token_amount(total_cost, state.cached_price)?;

        let adjustment = if context.token_reserved > owed {
            TokenAdjustment::Refund(context.token_reserved - owed)
        } else if owed > context.token_reserved {
            TokenAdjustment::Surcharge(owed - context.token_reserved)
        } else {
            TokenAdjustment::Exact
        };
        Ok((owed, adjustment))
    }

    fn token_amount(&self, gas_cost: U256, price: U256) -> Result<U256, PaymasterError> {
        let markup = self
            .knobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .price_markup;
        let denominator = U256::exp10(NATIVE_DECIMALS as usize)
            .checked_mul(U256::from(PRICE_DENOMINATOR))
            .ok_or(PaymasterError::FeeOverflow)?;
        gas_cost
            .checked_mul(price)
            .and_then(|v| v.checked_mul(U256::from(markup)))
            .ok_or(PaymasterError::FeeOverflow)?
            .checked_div(denominator)
            .ok_or(PaymasterError::FeeOverflow)
    }
}

fn deviation_ppm(fresh: U256, cached: U256) -> Result<u64, PaymasterError> {
    let diff = if fresh > cached {
        fresh - cached
    } else {
        cached - fresh
    };
    let ppm = diff
        .checked_mul(U256::from(THRESHOLD_DENOMINATOR))
        .ok_or(PaymasterError::FeeOverflow)?
        .checked_div(cached)
        .ok_or(PaymasterError::InvalidOraclePrice)?;
    Ok(ppm.low_u64().min(THRESHOLD_DENOMINATOR))
}

pub(crate) fn unix_now() -> Result<u64, PaymasterError> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| PaymasterError::InvalidParameters(e.to_string()))?
        .as_secs())
}
