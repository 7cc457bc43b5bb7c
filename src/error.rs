// src/error.rs
use ethers::types::{Address, U256};
use thiserror::Error;

/// Engine error taxonomy.
///
/// Format errors and precondition failures abort the in-flight call. A
/// wrong-signer signature is deliberately *not* represented here: it is a
/// policy outcome carried in the packed validation word, so the dispatcher
/// can tell "sponsor declined" apart from "cannot process".
#[derive(Error, Debug)]
pub enum PaymasterError {
    // Format errors
    #[error("malformed paymasterAndData: {0}")]
    MalformedPaymasterData(String),

    #[error("invalid signature length in paymasterAndData")]
    InvalidSignatureLength,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("paymasterAndData addressed to {found}, this paymaster is {expected}")]
    EngineMismatch { expected: Address, found: Address },

    // Precondition failures
    #[error("sender {sender} cannot cover the token estimate: needs {needed}, usable {available}")]
    InsufficientTokenFunds {
        sender: Address,
        needed: U256,
        available: U256,
    },

    #[error("entrypoint deposit too low: need {needed}, have {available}")]
    InsufficientDeposit { needed: U256, available: U256 },

    #[error("price feed stale: updated at {updated_at}, older than {max_age_secs}s")]
    StalePriceFeed { updated_at: u64, max_age_secs: u64 },

    #[error("oracle returned a non-positive price")]
    InvalidOraclePrice,

    #[error("no price observed yet")]
    PriceNotInitialized,

    // Configuration
    #[error("caller {0} is not the owner")]
    NotOwner(Address),

    #[error("price markup {0} is below the denominator")]
    MarkupTooLow(u32),

    #[error("operation requires the metered variant")]
    NotMetered,

    #[error("arithmetic overflow in fee computation")]
    FeeOverflow,

    // Collaborators
    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}
