// src/types.rs
use ethers::types::{Address, Bytes, U256};
use serde::{Deserialize, Serialize};

/// ERC-4337 user operation. Only `sender`, the gas fields and
/// `paymaster_and_data` are interpreted here; everything else is hashed for
/// signature binding but otherwise passes through untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

/// Wire layout selector for the authorization blob, taken from its leading
/// version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadFormat {
    /// Single opaque blob: address, window, signature.
    Legacy,
    /// Gas-limit-aware layout carrying the authorization-step gas limits
    /// ahead of the window+signature segment.
    Split,
}

/// Gas limits for the authorization step, present only in the split format.
/// These are supplied by the infrastructure after signing and are never part
/// of the signed preimage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGasLimits {
    pub verification_gas_limit: u128,
    pub post_op_gas_limit: u128,
}

/// Decoded form of `paymaster_and_data`. Both wire formats collapse to this
/// shape at the codec boundary; nothing downstream sees format-specific
/// bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationPayload {
    pub format: PayloadFormat,
    /// Paymaster instance the authorization is addressed to. Must match the
    /// validating instance; rejects cross-instance replay when several
    /// engines share one signer.
    pub engine: Address,
    /// Inclusive 48-bit unix lower bound, 0 = unbounded.
    pub valid_after: u64,
    /// Inclusive 48-bit unix upper bound, 0 = unbounded.
    pub valid_until: u64,
    pub auth_gas: Option<AuthGasLimits>,
    /// 65-byte ECDSA signature over the sponsorship digest.
    pub signature: Bytes,
}

/// Execution outcome reported by the dispatcher at settlement time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PostOpMode {
    OpSucceeded,
    OpReverted,
    /// Settlement itself reverted earlier and is being replayed; no further
    /// balance movement is attempted.
    PostOpReverted,
}

/// Opaque context handed back from validation and threaded into settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementContext {
    pub sender: Address,
    /// Token amount pre-charged at validation; zero for the verifying-only
    /// variant or when validation soft-failed.
    pub token_reserved: U256,
    /// Max native cost the dispatcher is willing to cover.
    pub max_cost: U256,
    pub max_fee_per_gas: U256,
}

/// Signed difference between what validation reserved and what settlement
/// found actually owed. Not an error: reconciliation is the normal path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "amount")]
pub enum TokenAdjustment {
    /// Reserved more than owed; difference returned to the sender.
    Refund(U256),
    /// Owed more than reserved; difference charged on top.
    Surcharge(U256),
    /// Reserved exactly what was owed, or nothing to reconcile.
    Exact,
}

/// Emitted once per settled operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementRecord {
    pub sender: Address,
    pub token_charged: U256,
    pub gas_cost: U256,
    pub adjustment: TokenAdjustment,
}

/// One `(price, updatedAt)` oracle read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceReading {
    pub price: U256,
    pub updated_at: u64,
}

/// Token price cache. `cached_price` is token base units per one native
/// unit (1e18 wei), only rewritten when the freshly read price moves past
/// the configured deviation threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceState {
    pub cached_price: U256,
    pub last_updated_at: u64,
}

/// Result of a validation call: the opaque context plus the packed
/// validation word the dispatcher interprets without calling back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResponse {
    pub context: SettlementContext,
    pub validation_data: U256,
}

/// Static sponsor metadata exposed over RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorInfo {
    pub paymaster: Address,
    pub trusted_signer: Address,
    pub metered: bool,
    pub token: Option<Address>,
    pub cached_price: Option<PriceState>,
}
