// src/chain.rs
use std::sync::Arc;

use async_trait::async_trait;
use ethers::prelude::*;

use crate::error::PaymasterError;
use crate::fees::PriceFeed;
use crate::paymaster::{StakeLedger, TokenLedger};
use crate::types::PriceReading;

abigen!(
    IERC20,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function transfer(address to, uint256 amount) external returns (bool)
        function transferFrom(address from, address to, uint256 amount) external returns (bool)
    ]"#
);

abigen!(
    AggregatorV3,
    r#"[
        function latestRoundData() external view returns (uint80 roundId, int256 answer, uint256 startedAt, uint256 updatedAt, uint80 answeredInRound)
    ]"#
);

abigen!(
    IEntryPoint,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function depositTo(address account) external payable
        function addStake(uint32 unstakeDelaySec) external payable
        function withdrawTo(address withdrawAddress, uint256 withdrawAmount) external
    ]"#
);

pub type ChainClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// Builds the signing client settlement transfers go through.
pub fn connect(
    eth_rpc_url: &str,
    private_key: &str,
    chain_id: u64,
) -> anyhow::Result<Arc<ChainClient>> {
    let wallet = private_key.parse::<LocalWallet>()?.with_chain_id(chain_id);
    let provider = Provider::<Http>::try_from(eth_rpc_url)?;
    Ok(Arc::new(SignerMiddleware::new(provider, wallet)))
}

fn ledger_err<E: std::fmt::Display>(e: E) -> PaymasterError {
    PaymasterError::Ledger(e.to_string())
}

/// Chainlink-style aggregator read as a `(price, updatedAt)` pair.
pub struct ChainPriceFeed {
    aggregator: AggregatorV3<ChainClient>,
}

impl ChainPriceFeed {
    pub fn new(address: Address, client: Arc<ChainClient>) -> Self {
        Self {
            aggregator: AggregatorV3::new(address, client),
        }
    }
}

#[async_trait]
impl PriceFeed for ChainPriceFeed {
    async fn latest_round(&self) -> Result<PriceReading, PaymasterError> {
        let (_, answer, _, updated_at, _) = self
            .aggregator
            .latest_round_data()
            .call()
            .await
            .map_err(ledger_err)?;
        if answer <= I256::zero() {
            return Err(PaymasterError::InvalidOraclePrice);
        }
        Ok(PriceReading {
            price: answer.into_raw(),
            updated_at: updated_at.as_u64(),
        })
    }
}

/// Live ERC-20 ledger for the fee token.
pub struct ChainTokenLedger {
    token: IERC20<ChainClient>,
}

impl ChainTokenLedger {
    pub fn new(address: Address, client: Arc<ChainClient>) -> Self {
        Self {
            token: IERC20::new(address, client),
        }
    }
}

#[async_trait]
impl TokenLedger for ChainTokenLedger {
    async fn balance_of(&self, account: Address) -> Result<U256, PaymasterError> {
        self.token.balance_of(account).call().await.map_err(ledger_err)
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256, PaymasterError> {
        self.token
            .allowance(owner, spender)
            .call()
            .await
            .map_err(ledger_err)
    }

    async fn transfer_from(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), PaymasterError> {
        let receipt = self
            .token
            .transfer_from(from, to, amount)
            .send()
            .await
            .map_err(ledger_err)?
            .await
            .map_err(ledger_err)?;
        confirmed(receipt)
    }

    async fn transfer(&self, to: Address, amount: U256) -> Result<(), PaymasterError> {
        let receipt = self
            .token
            .transfer(to, amount)
            .send()
            .await
            .map_err(ledger_err)?
            .await
            .map_err(ledger_err)?;
        confirmed(receipt)
    }
}

/// EntryPoint deposit/stake ledger.
pub struct ChainStakeLedger {
    entry_point: IEntryPoint<ChainClient>,
}

impl ChainStakeLedger {
    pub fn new(address: Address, client: Arc<ChainClient>) -> Self {
        Self {
            entry_point: IEntryPoint::new(address, client),
        }
    }
}

#[async_trait]
impl StakeLedger for ChainStakeLedger {
    async fn balance_of(&self, account: Address) -> Result<U256, PaymasterError> {
        self.entry_point
            .balance_of(account)
            .call()
            .await
            .map_err(ledger_err)
    }

    async fn deposit_to(&self, account: Address, amount: U256) -> Result<(), PaymasterError> {
        let receipt = self
            .entry_point
            .deposit_to(account)
            .value(amount)
            .send()
            .await
            .map_err(ledger_err)?
            .await
            .map_err(ledger_err)?;
        confirmed(receipt)
    }

    async fn add_stake(&self, unstake_delay_sec: u32, amount: U256) -> Result<(), PaymasterError> {
        let receipt = self
            .entry_point
            .add_stake(unstake_delay_sec)
            .value(amount)
            .send()
            .await
            .map_err(ledger_err)?
            .await
            .map_err(ledger_err)?;
        confirmed(receipt)
    }

    async fn withdraw_to(&self, to: Address, amount: U256) -> Result<(), PaymasterError> {
        let receipt = self
            .entry_point
            .withdraw_to(to, amount)
            .send()
            .await
            .map_err(ledger_err)?
            .await
            .map_err(ledger_err)?;
        confirmed(receipt)
    }
}

fn confirmed(receipt: Option<TransactionReceipt>) -> Result<(), PaymasterError> {
    match receipt {
        Some(r) if r.status == Some(U64::from(1u64)) => Ok(()),
        Some(r) => Err(PaymasterError::Ledger(format!(
            "transaction {:?} reverted",
            r.transaction_hash
        ))),
        None => Err(PaymasterError::Ledger("transaction dropped".to_string())),
    }
}
