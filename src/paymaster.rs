// src/paymaster.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::PaymasterError;
use crate::fees::FeeEngine;
use crate::hash::sponsorship_digest;
use crate::types::{
    PostOpMode, PriceState, SettlementContext, SettlementRecord, SponsorInfo, TokenAdjustment,
    UserOperation, ValidationResponse,
};
use crate::validation;
use crate::verify::recover_and_check;

/// ERC-20 token the metered variant charges in. Balances may change between
/// any two calls; nothing here assumes otherwise.
#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn balance_of(&self, account: Address) -> Result<U256, PaymasterError>;
    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256, PaymasterError>;
    async fn transfer_from(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), PaymasterError>;
    async fn transfer(&self, to: Address, amount: U256) -> Result<(), PaymasterError>;
}

/// The dispatcher's deposit/stake ledger that funds sponsorship. External:
/// anyone can move it between our calls, so it is re-read every time.
#[async_trait]
pub trait StakeLedger: Send + Sync {
    async fn balance_of(&self, account: Address) -> Result<U256, PaymasterError>;
    async fn deposit_to(&self, account: Address, amount: U256) -> Result<(), PaymasterError>;
    async fn add_stake(&self, unstake_delay_sec: u32, amount: U256) -> Result<(), PaymasterError>;
    async fn withdraw_to(&self, to: Address, amount: U256) -> Result<(), PaymasterError>;
}

/// Immutable engine configuration; only the fee knobs and ownership itself
/// change after construction.
#[derive(Debug, Clone)]
pub struct PaymasterConfig {
    /// Identity this instance validates as; echoed in every blob.
    pub address: Address,
    pub chain_id: u64,
    /// The one off-chain key authorized to approve sponsorship.
    pub trusted_signer: Address,
    pub owner: Address,
    /// Staleness policy handed to the fee engine on every read.
    pub max_price_age: Duration,
}

struct Metered {
    fee: FeeEngine,
    token: Arc<dyn TokenLedger>,
}

/// The validation/settlement state machine.
///
/// Each operation passes through `validate_paymaster_user_op` at most once
/// and `post_op` at most once; the dispatcher enforces the at-most-once
/// contract. A validated operation that never reaches settlement simply
/// leaves no trace here, which is correct since nothing was spent.
pub struct Paymaster {
    config: PaymasterConfig,
    owner: std::sync::Mutex<Address>,
    metered: Option<Metered>,
    stake: Arc<dyn StakeLedger>,
}

impl Paymaster {
    /// Verifying-only variant: signature policy without fee metering.
    pub fn new_verifying(config: PaymasterConfig, stake: Arc<dyn StakeLedger>) -> Self {
        let owner = config.owner;
        info!(paymaster = %config.address, signer = %config.trusted_signer, "verifying paymaster ready");
        Self {
            config,
            owner: std::sync::Mutex::new(owner),
            metered: None,
            stake,
        }
    }

    /// Metered variant: signature policy plus oracle-priced token charging.
    pub fn new_metered(
        config: PaymasterConfig,
        fee: FeeEngine,
        token: Arc<dyn TokenLedger>,
        stake: Arc<dyn StakeLedger>,
    ) -> Self {
        let owner = config.owner;
        info!(
            paymaster = %config.address,
            signer = %config.trusted_signer,
            token = %fee.token(),
            "metered paymaster ready"
        );
        Self {
            config,
            owner: std::sync::Mutex::new(owner),
            metered: Some(Metered { fee, token }),
            stake,
        }
    }

    pub fn address(&self) -> Address {
        self.config.address
    }

    pub fn owner(&self) -> Address {
        *self.owner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn token(&self) -> Option<Address> {
        self.metered.as_ref().map(|m| m.fee.token())
    }

    /// `Unvalidated -> Validated`.
    ///
    /// `max_cost` is the native cost bound supplied by the dispatcher.
    /// Policy failure (wrong signer) is reported in the packed word, never
    /// raised; format errors and uncoverable estimates abort the call.
    pub async fn validate_paymaster_user_op(
        &self,
        op: &UserOperation,
        max_cost: U256,
    ) -> Result<ValidationResponse, PaymasterError> {
        let payload = codec::decode(&op.paymaster_and_data)?;
        if payload.engine != self.config.address {
            return Err(PaymasterError::EngineMismatch {
                expected: self.config.address,
                found: payload.engine,
            });
        }

        // Sponsorship cannot begin without provable coverage at the
        // dispatcher's ledger.
        let deposit = self.stake.balance_of(self.config.address).await?;
        if deposit < max_cost {
            return Err(PaymasterError::InsufficientDeposit {
                needed: max_cost,
                available: deposit,
            });
        }

        let digest = sponsorship_digest(
            op,
            self.config.chain_id,
            self.config.address,
            self.token(),
            payload.valid_until,
            payload.valid_after,
        );
        let sig_ok = recover_and_check(digest, &payload.signature, self.config.trusted_signer)?;
        if !sig_ok {
            debug!(sender = %op.sender, "authorization signed by untrusted key, soft-failing");
        }

        let token_reserved = match &self.metered {
            Some(metered) => {
                let estimate = metered
                    .fee
                    .estimate_cost(max_cost, self.config.max_price_age)
                    .await?;
                let balance = metered.token.balance_of(op.sender).await?;
                let allowance = metered.token.allowance(op.sender, self.config.address).await?;
                let available = balance.min(allowance);
                if available < estimate {
                    return Err(PaymasterError::InsufficientTokenFunds {
                        sender: op.sender,
                        needed: estimate,
                        available,
                    });
                }
                // Pre-charge only when sponsorship will actually proceed; a
                // soft-failed operation is never executed, so no funds move.
                if sig_ok {
                    metered
                        .token
                        .transfer_from(op.sender, self.config.address, estimate)
                        .await?;
                    estimate
                } else {
                    U256::zero()
                }
            }
            None => U256::zero(),
        };

        let validation_data = validation::pack(!sig_ok, payload.valid_until, payload.valid_after);
        Ok(ValidationResponse {
            context: SettlementContext {
                sender: op.sender,
                token_reserved,
                max_cost,
                max_fee_per_gas: op.max_fee_per_gas,
            },
            validation_data,
        })
    }

    /// `Validated -> Settled`.
    ///
    /// Reconciles the pre-charge against the actual gas cost. Never refuses
    /// an amount mismatch; by now the sponsored operation may be
    /// irreversibly committed. When the settlement call itself already
    /// reverted once (`PostOpReverted`) the reserve is kept as-is.
    pub async fn post_op(
        &self,
        mode: PostOpMode,
        context: SettlementContext,
        actual_gas_cost: U256,
    ) -> Result<SettlementRecord, PaymasterError> {
        let record = match (&self.metered, mode) {
            (Some(_), PostOpMode::PostOpReverted) | (None, _) => SettlementRecord {
                sender: context.sender,
                token_charged: context.token_reserved,
                gas_cost: actual_gas_cost,
                adjustment: TokenAdjustment::Exact,
            },
            (Some(metered), _) => {
                let (owed, adjustment) = metered.fee.settle(&context, actual_gas_cost).await?;
                let charged = match adjustment {
                    TokenAdjustment::Refund(refund) => {
                        metered.token.transfer(context.sender, refund).await?;
                        owed
                    }
                    TokenAdjustment::Surcharge(surcharge) => {
                        // Best effort: the sender may have drained balance or
                        // allowance since validation. Keep the reserve then.
                        match metered
                            .token
                            .transfer_from(context.sender, self.config.address, surcharge)
                            .await
                        {
                            Ok(()) => owed,
                            Err(e) => {
                                warn!(sender = %context.sender, error = %e, "top-up failed, keeping reserve");
                                context.token_reserved
                            }
                        }
                    }
                    TokenAdjustment::Exact => owed,
                };
                SettlementRecord {
                    sender: context.sender,
                    token_charged: charged,
                    gas_cost: actual_gas_cost,
                    adjustment,
                }
            }
        };
        info!(
            sender = %record.sender,
            token_charged = %record.token_charged,
            gas_cost = %record.gas_cost,
            "sponsored operation settled"
        );
        Ok(record)
    }

    /// Permissionless trigger for a price refresh outside the validate
    /// path. Same threshold rule as the in-path refresh.
    pub async fn refresh_price(&self) -> Result<PriceState, PaymasterError> {
        let metered = self.metered.as_ref().ok_or(PaymasterError::NotMetered)?;
        metered.fee.refresh_price(self.config.max_price_age).await
    }

    pub fn sponsor_info(&self) -> SponsorInfo {
        SponsorInfo {
            paymaster: self.config.address,
            trusted_signer: self.config.trusted_signer,
            metered: self.metered.is_some(),
            token: self.token(),
            cached_price: None,
        }
    }

    pub async fn cached_price(&self) -> Option<PriceState> {
        match &self.metered {
            Some(metered) => metered.fee.cached_price().await,
            None => None,
        }
    }

    /// Current balance at the dispatcher's deposit ledger.
    pub async fn deposit(&self) -> Result<U256, PaymasterError> {
        self.stake.balance_of(self.config.address).await
    }

    // Owner-only configuration surface. Single-step, immediate effect.

    fn ensure_owner(&self, caller: Address) -> Result<(), PaymasterError> {
        if caller != self.owner() {
            return Err(PaymasterError::NotOwner(caller));
        }
        Ok(())
    }

    pub fn transfer_ownership(
        &self,
        caller: Address,
        new_owner: Address,
    ) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        *self.owner.lock().unwrap_or_else(|e| e.into_inner()) = new_owner;
        info!(from = %caller, to = %new_owner, "ownership transferred");
        Ok(())
    }

    pub fn set_price_markup(&self, caller: Address, markup: u32) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        let metered = self.metered.as_ref().ok_or(PaymasterError::NotMetered)?;
        metered.fee.set_price_markup(markup)?;
        info!(markup, "price markup updated");
        Ok(())
    }

    pub fn set_update_threshold(
        &self,
        caller: Address,
        threshold_ppm: u64,
    ) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        let metered = self.metered.as_ref().ok_or(PaymasterError::NotMetered)?;
        metered.fee.set_update_threshold(threshold_ppm);
        info!(threshold_ppm, "price update threshold updated");
        Ok(())
    }

    pub async fn add_stake(
        &self,
        caller: Address,
        unstake_delay_sec: u32,
        amount: U256,
    ) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        self.stake.add_stake(unstake_delay_sec, amount).await
    }

    pub async fn deposit_to_ledger(
        &self,
        caller: Address,
        amount: U256,
    ) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        self.stake.deposit_to(self.config.address, amount).await
    }

    pub async fn withdraw_deposit(
        &self,
        caller: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        self.stake.withdraw_to(to, amount).await?;
        info!(to = %to, amount = %amount, "deposit withdrawn");
        Ok(())
    }

    /// Withdraws accumulated token revenue to `to`.
    pub async fn withdraw_token(
        &self,
        caller: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), PaymasterError> {
        self.ensure_owner(caller)?;
        let metered = self.metered.as_ref().ok_or(PaymasterError::NotMetered)?;
        metered.token.transfer(to, amount).await?;
        info!(to = %to, amount = %amount, "token revenue withdrawn");
        Ok(())
    }
}
