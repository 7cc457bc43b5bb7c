// src/codec.rs
use ethers::types::{Address, Bytes};

use crate::error::PaymasterError;
use crate::types::{AuthGasLimits, AuthorizationPayload, PayloadFormat};

/// Version byte for the legacy single-blob layout.
pub const VERSION_LEGACY: u8 = 0x00;
/// Version byte for the split, gas-limit-aware layout.
pub const VERSION_SPLIT: u8 = 0x01;

pub const SIGNATURE_LENGTH: usize = 65;
const ADDRESS_LENGTH: usize = 20;
const TIMESTAMP_LENGTH: usize = 6;
const GAS_LIMIT_LENGTH: usize = 16;

// version ‖ engine ‖ validAfter(6) ‖ validUntil(6)
const LEGACY_PREFIX_LENGTH: usize = 1 + ADDRESS_LENGTH + 2 * TIMESTAMP_LENGTH;
// version ‖ engine ‖ verificationGasLimit(16) ‖ postOpGasLimit(16)
const SPLIT_GAS_PREFIX_LENGTH: usize = 1 + ADDRESS_LENGTH + 2 * GAS_LIMIT_LENGTH;
// validUntil(6) ‖ validAfter(6)
const WINDOW_LENGTH: usize = 2 * TIMESTAMP_LENGTH;

/// Decodes an authorization blob into the one internal payload shape.
///
/// Format divergence is absorbed entirely here; the hash engine and the
/// verifier never see format-specific bytes.
pub fn decode(blob: &[u8]) -> Result<AuthorizationPayload, PaymasterError> {
    let version = *blob.first().ok_or_else(|| {
        PaymasterError::MalformedPaymasterData("empty paymasterAndData".to_string())
    })?;
    match version {
        VERSION_LEGACY => decode_legacy(blob),
        VERSION_SPLIT => decode_split(blob),
        other => Err(PaymasterError::MalformedPaymasterData(format!(
            "unknown format version {other:#04x}"
        ))),
    }
}

fn decode_legacy(blob: &[u8]) -> Result<AuthorizationPayload, PaymasterError> {
    if blob.len() < LEGACY_PREFIX_LENGTH {
        return Err(PaymasterError::MalformedPaymasterData(format!(
            "legacy blob truncated at {} bytes",
            blob.len()
        )));
    }
    let signature = &blob[LEGACY_PREFIX_LENGTH..];
    if signature.len() != SIGNATURE_LENGTH {
        return Err(PaymasterError::InvalidSignatureLength);
    }
    Ok(AuthorizationPayload {
        format: PayloadFormat::Legacy,
        engine: Address::from_slice(&blob[1..1 + ADDRESS_LENGTH]),
        valid_after: be48(&blob[21..27]),
        valid_until: be48(&blob[27..33]),
        auth_gas: None,
        signature: Bytes::from(signature.to_vec()),
    })
}

fn decode_split(blob: &[u8]) -> Result<AuthorizationPayload, PaymasterError> {
    if blob.len() < SPLIT_GAS_PREFIX_LENGTH + WINDOW_LENGTH {
        return Err(PaymasterError::MalformedPaymasterData(format!(
            "split blob truncated at {} bytes",
            blob.len()
        )));
    }
    // Signature tail is variable-length on the wire; anything but exactly
    // 65 bytes after the 12-byte window prefix is rejected.
    let signature = &blob[SPLIT_GAS_PREFIX_LENGTH + WINDOW_LENGTH..];
    if signature.len() != SIGNATURE_LENGTH {
        return Err(PaymasterError::InvalidSignatureLength);
    }
    let mut gas = [0u8; GAS_LIMIT_LENGTH];
    gas.copy_from_slice(&blob[21..37]);
    let verification_gas_limit = u128::from_be_bytes(gas);
    gas.copy_from_slice(&blob[37..53]);
    let post_op_gas_limit = u128::from_be_bytes(gas);
    Ok(AuthorizationPayload {
        format: PayloadFormat::Split,
        engine: Address::from_slice(&blob[1..1 + ADDRESS_LENGTH]),
        valid_until: be48(&blob[53..59]),
        valid_after: be48(&blob[59..65]),
        auth_gas: Some(AuthGasLimits {
            verification_gas_limit,
            post_op_gas_limit,
        }),
        signature: Bytes::from(signature.to_vec()),
    })
}

/// Inverse of [`decode`]. Used by tests and off-chain tooling only; the
/// validation path never re-encodes. The signature is written verbatim, so
/// tooling can deliberately produce bad tails.
pub fn encode(payload: &AuthorizationPayload) -> Bytes {
    let mut blob = Vec::with_capacity(LEGACY_PREFIX_LENGTH + payload.signature.len());
    match payload.format {
        PayloadFormat::Legacy => {
            blob.push(VERSION_LEGACY);
            blob.extend_from_slice(payload.engine.as_bytes());
            blob.extend_from_slice(&be48_bytes(payload.valid_after));
            blob.extend_from_slice(&be48_bytes(payload.valid_until));
        }
        PayloadFormat::Split => {
            let auth_gas = payload.auth_gas.unwrap_or(AuthGasLimits {
                verification_gas_limit: 0,
                post_op_gas_limit: 0,
            });
            blob.push(VERSION_SPLIT);
            blob.extend_from_slice(payload.engine.as_bytes());
            blob.extend_from_slice(&auth_gas.verification_gas_limit.to_be_bytes());
            blob.extend_from_slice(&auth_gas.post_op_gas_limit.to_be_bytes());
            blob.extend_from_slice(&be48_bytes(payload.valid_until));
            blob.extend_from_slice(&be48_bytes(payload.valid_after));
        }
    }
    blob.extend_from_slice(&payload.signature);
    Bytes::from(blob)
}

fn be48(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf[2..].copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

fn be48_bytes(value: u64) -> [u8; 6] {
    let mut out = [0u8; 6];
    out.copy_from_slice(&value.to_be_bytes()[2..]);
    out
}
