// src/verify.rs
use ethers::types::{Address, Signature, H256};

use crate::codec::SIGNATURE_LENGTH;
use crate::error::PaymasterError;
use crate::hash::signed_message_hash;

/// Recovers the signer of `signature` over the personal-message hash of
/// `digest` and compares it against `expected`.
///
/// A wrong byte length or an unrecoverable signature (bad recovery id,
/// out-of-range scalars) is a hard format error. A well-formed signature
/// that recovers to some *other* address returns `Ok(false)`: the
/// orchestrator turns that into a non-reverting policy failure, so bulk
/// dry-run infrastructure can tell "sponsor will never approve this"
/// apart from "this operation is malformed".
pub fn recover_and_check(
    digest: H256,
    signature: &[u8],
    expected: Address,
) -> Result<bool, PaymasterError> {
    let signature = parse_signature(signature)?;
    let recovered = signature
        .recover(signed_message_hash(digest))
        .map_err(|_| PaymasterError::InvalidSignature)?;
    Ok(recovered == expected)
}

pub fn parse_signature(bytes: &[u8]) -> Result<Signature, PaymasterError> {
    if bytes.len() != SIGNATURE_LENGTH {
        return Err(PaymasterError::InvalidSignatureLength);
    }
    Signature::try_from(bytes).map_err(|_| PaymasterError::InvalidSignature)
}
