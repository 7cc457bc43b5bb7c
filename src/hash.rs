// src/hash.rs
use ethers::types::{Address, H256, U256};
use ethers::utils::{hash_message, keccak256};

use crate::types::UserOperation;

/// Canonical digest the off-chain authority signs.
///
/// The preimage binds, in fixed order: the operation core (`sender, nonce,
/// keccak(initCode), keccak(callData), callGasLimit, verificationGasLimit,
/// preVerificationGas, maxFeePerGas, maxPriorityFeePerGas`), then `chainId`
/// and the paymaster's own address, then (metered variant) the fee token,
/// then `validUntil, validAfter`. Each field is one 32-byte word.
///
/// `paymaster_and_data` and the operation-level signature are never part of
/// the preimage. Neither are the split-format authorization gas limits: the
/// infrastructure may set those after signing, so the digest stays identical
/// across both wire formats for the same decoded payload. The operation's
/// own `call_gas_limit` is signed in both formats.
pub fn sponsorship_digest(
    op: &UserOperation,
    chain_id: u64,
    paymaster: Address,
    token: Option<Address>,
    valid_until: u64,
    valid_after: u64,
) -> H256 {
    let mut preimage = Vec::with_capacity(32 * 14);
    push_address(&mut preimage, op.sender);
    push_u256(&mut preimage, op.nonce);
    preimage.extend_from_slice(&keccak256(&op.init_code));
    preimage.extend_from_slice(&keccak256(&op.call_data));
    push_u256(&mut preimage, op.call_gas_limit);
    push_u256(&mut preimage, op.verification_gas_limit);
    push_u256(&mut preimage, op.pre_verification_gas);
    push_u256(&mut preimage, op.max_fee_per_gas);
    push_u256(&mut preimage, op.max_priority_fee_per_gas);
    push_u256(&mut preimage, U256::from(chain_id));
    push_address(&mut preimage, paymaster);
    if let Some(token) = token {
        push_address(&mut preimage, token);
    }
    push_u256(&mut preimage, U256::from(valid_until));
    push_u256(&mut preimage, U256::from(valid_after));
    H256::from(keccak256(&preimage))
}

/// EIP-191 personal-message wrap of the digest; signatures are produced and
/// recovered over this hash, matching the off-chain signer's convention.
pub fn signed_message_hash(digest: H256) -> H256 {
    hash_message(digest.as_bytes())
}

fn push_u256(buf: &mut Vec<u8>, value: U256) {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    buf.extend_from_slice(&word);
}

fn push_address(buf: &mut Vec<u8>, address: Address) {
    buf.extend_from_slice(&[0u8; 12]);
    buf.extend_from_slice(address.as_bytes());
}
