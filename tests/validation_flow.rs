// tests/validation_flow.rs
//
// End-to-end validate/settle flow against in-memory ledgers and feeds:
// a trusted off-chain signer authorizes an operation for a bounded window,
// validation reports the outcome in the packed word, and settlement
// reconciles the pre-charged token amount against the actual gas cost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, U256};

use erc20_paymaster::codec;
use erc20_paymaster::error::PaymasterError;
use erc20_paymaster::fees::{FeeEngine, PriceFeed};
use erc20_paymaster::hash::{signed_message_hash, sponsorship_digest};
use erc20_paymaster::paymaster::{Paymaster, PaymasterConfig, StakeLedger, TokenLedger};
use erc20_paymaster::types::{
    AuthorizationPayload, PayloadFormat, PostOpMode, PriceReading, TokenAdjustment, UserOperation,
};
use erc20_paymaster::validation;

const CHAIN_ID: u64 = 11155111;
const VALID_UNTIL: u64 = 0xdead_beef;
const VALID_AFTER: u64 = 0x1234;
const MAX_PRICE_AGE: Duration = Duration::from_secs(120);

fn paymaster_address() -> Address {
    Address::repeat_byte(0x42)
}

fn token_address() -> Address {
    Address::repeat_byte(0x99)
}

fn sender_address() -> Address {
    "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse().unwrap()
}

fn trusted_wallet() -> LocalWallet {
    // anvil test key #1
    "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d"
        .parse()
        .unwrap()
}

struct MockFeed {
    price: U256,
}

#[async_trait]
impl PriceFeed for MockFeed {
    async fn latest_round(&self) -> Result<PriceReading, PaymasterError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        Ok(PriceReading {
            price: self.price,
            updated_at: now,
        })
    }
}

struct MockToken {
    /// Account the paymaster's own outbound transfers debit.
    this: Address,
    balances: Mutex<HashMap<Address, U256>>,
    allowances: Mutex<HashMap<(Address, Address), U256>>,
}

impl MockToken {
    fn new(this: Address) -> Arc<Self> {
        Arc::new(Self {
            this,
            balances: Mutex::new(HashMap::new()),
            allowances: Mutex::new(HashMap::new()),
        })
    }

    fn fund(&self, account: Address, amount: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert(account, U256::from(amount));
    }

    fn approve(&self, owner: Address, spender: Address, amount: U256) {
        self.allowances
            .lock()
            .unwrap()
            .insert((owner, spender), amount);
    }

    fn balance(&self, account: Address) -> U256 {
        self.balances
            .lock()
            .unwrap()
            .get(&account)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl TokenLedger for MockToken {
    async fn balance_of(&self, account: Address) -> Result<U256, PaymasterError> {
        Ok(self.balance(account))
    }

    async fn allowance(&self, owner: Address, spender: Address) -> Result<U256, PaymasterError> {
        Ok(self
            .allowances
            .lock()
            .unwrap()
            .get(&(owner, spender))
            .copied()
            .unwrap_or_default())
    }

    async fn transfer_from(
        &self,
        from: Address,
        to: Address,
        amount: U256,
    ) -> Result<(), PaymasterError> {
        {
            let mut allowances = self.allowances.lock().unwrap();
            let allowance = allowances.entry((from, to)).or_default();
            *allowance = allowance
                .checked_sub(amount)
                .ok_or_else(|| PaymasterError::Ledger("allowance exceeded".to_string()))?;
        }
        let mut balances = self.balances.lock().unwrap();
        let from_balance = balances.entry(from).or_default();
        *from_balance = from_balance
            .checked_sub(amount)
            .ok_or_else(|| PaymasterError::Ledger("balance exceeded".to_string()))?;
        *balances.entry(to).or_default() += amount;
        Ok(())
    }

    async fn transfer(&self, to: Address, amount: U256) -> Result<(), PaymasterError> {
        let mut balances = self.balances.lock().unwrap();
        let from_balance = balances.entry(self.this).or_default();
        *from_balance = from_balance
            .checked_sub(amount)
            .ok_or_else(|| PaymasterError::Ledger("balance exceeded".to_string()))?;
        *balances.entry(to).or_default() += amount;
        Ok(())
    }
}

struct MockStake {
    deposit: Mutex<U256>,
}

impl MockStake {
    fn with(deposit: u128) -> Arc<Self> {
        Arc::new(Self {
            deposit: Mutex::new(U256::from(deposit)),
        })
    }
}

#[async_trait]
impl StakeLedger for MockStake {
    async fn balance_of(&self, _account: Address) -> Result<U256, PaymasterError> {
        Ok(*self.deposit.lock().unwrap())
    }

    async fn deposit_to(&self, _account: Address, amount: U256) -> Result<(), PaymasterError> {
        *self.deposit.lock().unwrap() += amount;
        Ok(())
    }

    async fn add_stake(&self, _delay: u32, _amount: U256) -> Result<(), PaymasterError> {
        Ok(())
    }

    async fn withdraw_to(&self, _to: Address, amount: U256) -> Result<(), PaymasterError> {
        let mut deposit = self.deposit.lock().unwrap();
        *deposit = deposit
            .checked_sub(amount)
            .ok_or_else(|| PaymasterError::Ledger("deposit underflow".to_string()))?;
        Ok(())
    }
}

fn config() -> PaymasterConfig {
    PaymasterConfig {
        address: paymaster_address(),
        chain_id: CHAIN_ID,
        trusted_signer: trusted_wallet().address(),
        owner: Address::repeat_byte(0x07),
        max_price_age: MAX_PRICE_AGE,
    }
}

// 3000 USD/native, 1 USD/token, 6-decimal token, 10% markup, 2.5% gate
fn fee_engine() -> FeeEngine {
    FeeEngine::new(
        token_address(),
        6,
        110,
        25_000,
        Arc::new(MockFeed {
            price: U256::from(100_000_000u64),
        }),
        Arc::new(MockFeed {
            price: U256::from(300_000_000_000u64),
        }),
    )
    .unwrap()
}

fn metered_paymaster(token: Arc<MockToken>, stake: Arc<MockStake>) -> Paymaster {
    Paymaster::new_metered(config(), fee_engine(), token, stake)
}

fn sample_op(paymaster_and_data: Bytes) -> UserOperation {
    UserOperation {
        sender: sender_address(),
        nonce: U256::zero(),
        init_code: Bytes::default(),
        call_data: Bytes::from(vec![0xb6, 0x1d, 0x27, 0xf6]),
        call_gas_limit: U256::from(0x54fa),
        verification_gas_limit: U256::from(0x05fa35),
        pre_verification_gas: U256::from(0xae64),
        max_fee_per_gas: U256::from(1_000_000_000u64),
        max_priority_fee_per_gas: U256::from(100_000_000u64),
        paymaster_and_data,
        signature: Bytes::default(),
    }
}

fn payload(format: PayloadFormat, signature: Vec<u8>) -> AuthorizationPayload {
    AuthorizationPayload {
        format,
        engine: paymaster_address(),
        valid_after: VALID_AFTER,
        valid_until: VALID_UNTIL,
        auth_gas: match format {
            PayloadFormat::Legacy => None,
            PayloadFormat::Split => Some(erc20_paymaster::types::AuthGasLimits {
                verification_gas_limit: 150_000,
                post_op_gas_limit: 50_000,
            }),
        },
        signature: Bytes::from(signature),
    }
}

/// Signs the sponsorship digest for `op` the way the off-chain authority
/// does, then splices the signature into the encoded blob.
fn authorize(op: &UserOperation, format: PayloadFormat, token: Option<Address>) -> Bytes {
    let digest = sponsorship_digest(
        op,
        CHAIN_ID,
        paymaster_address(),
        token,
        VALID_UNTIL,
        VALID_AFTER,
    );
    let signature = trusted_wallet()
        .sign_hash(signed_message_hash(digest))
        .unwrap()
        .to_vec();
    codec::encode(&payload(format, signature))
}

#[tokio::test]
async fn valid_signature_passes_and_reports_window() {
    let token = MockToken::new(paymaster_address());
    token.fund(sender_address(), 10_000_000);
    token.approve(sender_address(), paymaster_address(), U256::MAX);
    let pm = metered_paymaster(token.clone(), MockStake::with(1_000_000_000_000_000_000));

    let mut op = sample_op(Bytes::default());
    op.paymaster_and_data = authorize(&op, PayloadFormat::Split, Some(token_address()));

    let max_cost = U256::exp10(15);
    let response = pm.validate_paymaster_user_op(&op, max_cost).await.unwrap();

    let data = validation::unpack(response.validation_data);
    assert!(!data.sig_failed);
    assert_eq!(data.valid_until, VALID_UNTIL);
    assert_eq!(data.valid_after, VALID_AFTER);

    // 0.001 native at 3000 token/native, +10%
    assert_eq!(response.context.token_reserved, U256::from(3_300_000u64));
    assert_eq!(token.balance(sender_address()), U256::from(6_700_000u64));
    assert_eq!(token.balance(paymaster_address()), U256::from(3_300_000u64));
}

#[tokio::test]
async fn wrong_message_signature_soft_fails_without_moving_funds() {
    let token = MockToken::new(paymaster_address());
    token.fund(sender_address(), 10_000_000);
    token.approve(sender_address(), paymaster_address(), U256::MAX);
    let pm = metered_paymaster(token.clone(), MockStake::with(1_000_000_000_000_000_000));

    // well-formed 65-byte signature, but over an unrelated message
    let stray = trusted_wallet()
        .sign_hash(signed_message_hash(ethers::utils::keccak256(b"dead").into()))
        .unwrap()
        .to_vec();
    let op = sample_op(codec::encode(&payload(PayloadFormat::Split, stray)));

    let response = pm
        .validate_paymaster_user_op(&op, U256::exp10(15))
        .await
        .unwrap();

    let data = validation::unpack(response.validation_data);
    assert!(data.sig_failed);
    assert_eq!(data.valid_until, VALID_UNTIL);
    assert_eq!(data.valid_after, VALID_AFTER);
    assert_eq!(response.context.token_reserved, U256::zero());
    assert_eq!(token.balance(sender_address()), U256::from(10_000_000u64));
}

#[tokio::test]
async fn short_signature_is_a_hard_format_error() {
    let token = MockToken::new(paymaster_address());
    let pm = metered_paymaster(token, MockStake::with(1_000_000_000_000_000_000));

    let op = sample_op(codec::encode(&payload(PayloadFormat::Legacy, vec![0u8; 64])));
    assert!(matches!(
        pm.validate_paymaster_user_op(&op, U256::exp10(15)).await,
        Err(PaymasterError::InvalidSignatureLength)
    ));
}

#[tokio::test]
async fn blob_for_another_instance_is_rejected() {
    let token = MockToken::new(paymaster_address());
    let pm = metered_paymaster(token, MockStake::with(1_000_000_000_000_000_000));

    let mut foreign = payload(PayloadFormat::Split, vec![0x11u8; 65]);
    foreign.engine = Address::repeat_byte(0x43);
    let op = sample_op(codec::encode(&foreign));

    assert!(matches!(
        pm.validate_paymaster_user_op(&op, U256::exp10(15)).await,
        Err(PaymasterError::EngineMismatch { .. })
    ));
}

#[tokio::test]
async fn uncoverable_estimate_is_a_hard_precondition() {
    let token = MockToken::new(paymaster_address());
    // far less than the 3.3 token estimate
    token.fund(sender_address(), 1_000);
    token.approve(sender_address(), paymaster_address(), U256::MAX);
    let pm = metered_paymaster(token, MockStake::with(1_000_000_000_000_000_000));

    let mut op = sample_op(Bytes::default());
    op.paymaster_and_data = authorize(&op, PayloadFormat::Split, Some(token_address()));

    assert!(matches!(
        pm.validate_paymaster_user_op(&op, U256::exp10(15)).await,
        Err(PaymasterError::InsufficientTokenFunds { .. })
    ));
}

#[tokio::test]
async fn missing_deposit_is_a_hard_precondition() {
    let token = MockToken::new(paymaster_address());
    token.fund(sender_address(), 10_000_000);
    token.approve(sender_address(), paymaster_address(), U256::MAX);
    let pm = metered_paymaster(token, MockStake::with(1));

    let mut op = sample_op(Bytes::default());
    op.paymaster_and_data = authorize(&op, PayloadFormat::Split, Some(token_address()));

    assert!(matches!(
        pm.validate_paymaster_user_op(&op, U256::exp10(15)).await,
        Err(PaymasterError::InsufficientDeposit { .. })
    ));
}

#[tokio::test]
async fn settlement_conserves_token_value() {
    let token = MockToken::new(paymaster_address());
    token.fund(sender_address(), 10_000_000);
    token.approve(sender_address(), paymaster_address(), U256::MAX);
    let pm = metered_paymaster(token.clone(), MockStake::with(1_000_000_000_000_000_000));

    let mut op = sample_op(Bytes::default());
    op.paymaster_and_data = authorize(&op, PayloadFormat::Split, Some(token_address()));

    let response = pm
        .validate_paymaster_user_op(&op, U256::exp10(15))
        .await
        .unwrap();
    let reserved = response.context.token_reserved;

    let actual_gas_cost = U256::from(400_000_000_000_000u64);
    let record = pm
        .post_op(PostOpMode::OpSucceeded, response.context, actual_gas_cost)
        .await
        .unwrap();

    let refund = match record.adjustment {
        TokenAdjustment::Refund(refund) => refund,
        other => panic!("expected refund, got {other:?}"),
    };
    // nothing created or destroyed
    assert_eq!(reserved - record.token_charged, refund);
    assert_eq!(
        token.balance(sender_address()),
        U256::from(10_000_000u64) - record.token_charged
    );
    assert_eq!(token.balance(paymaster_address()), record.token_charged);
}

#[tokio::test]
async fn replayed_settlement_keeps_the_reserve() {
    let token = MockToken::new(paymaster_address());
    token.fund(sender_address(), 10_000_000);
    token.approve(sender_address(), paymaster_address(), U256::MAX);
    let pm = metered_paymaster(token.clone(), MockStake::with(1_000_000_000_000_000_000));

    let mut op = sample_op(Bytes::default());
    op.paymaster_and_data = authorize(&op, PayloadFormat::Split, Some(token_address()));

    let response = pm
        .validate_paymaster_user_op(&op, U256::exp10(15))
        .await
        .unwrap();
    let reserved = response.context.token_reserved;

    let record = pm
        .post_op(
            PostOpMode::PostOpReverted,
            response.context,
            U256::from(400_000_000_000_000u64),
        )
        .await
        .unwrap();

    assert_eq!(record.token_charged, reserved);
    assert_eq!(record.adjustment, TokenAdjustment::Exact);
    assert_eq!(token.balance(paymaster_address()), reserved);
}

#[tokio::test]
async fn verifying_variant_sponsors_without_charging() {
    let stake = MockStake::with(1_000_000_000_000_000_000);
    let pm = Paymaster::new_verifying(config(), stake);

    let mut op = sample_op(Bytes::default());
    // legacy blob, no token bound into the digest
    op.paymaster_and_data = authorize(&op, PayloadFormat::Legacy, None);

    let response = pm
        .validate_paymaster_user_op(&op, U256::exp10(15))
        .await
        .unwrap();

    let data = validation::unpack(response.validation_data);
    assert!(!data.sig_failed);
    assert_eq!(response.context.token_reserved, U256::zero());

    let record = pm
        .post_op(
            PostOpMode::OpSucceeded,
            response.context,
            U256::from(400_000_000_000_000u64),
        )
        .await
        .unwrap();
    assert_eq!(record.token_charged, U256::zero());
}

#[tokio::test]
async fn digest_is_format_independent_for_the_same_window() {
    let op = sample_op(Bytes::default());
    let a = sponsorship_digest(
        &op,
        CHAIN_ID,
        paymaster_address(),
        Some(token_address()),
        VALID_UNTIL,
        VALID_AFTER,
    );
    // the split format's auth gas limits never enter the preimage, so one
    // signature covers both encodings of the same payload
    let legacy = codec::decode(&authorize(&op, PayloadFormat::Legacy, Some(token_address()))).unwrap();
    let split = codec::decode(&authorize(&op, PayloadFormat::Split, Some(token_address()))).unwrap();
    assert_eq!(legacy.signature, split.signature);
    let b = sponsorship_digest(
        &op,
        CHAIN_ID,
        paymaster_address(),
        Some(token_address()),
        split.valid_until,
        split.valid_after,
    );
    assert_eq!(a, b);
}
