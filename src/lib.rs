// src/lib.rs
//! ERC-4337 sponsorship validation and fee-accounting engine.
//!
//! An off-chain authority pre-approves a user operation by signing a digest
//! of its safety-relevant fields within a bounded validity window. This
//! crate decodes the authorization blob, checks the signature, reports the
//! outcome in a packed validation word the dispatcher reads without calling
//! back, and (in the metered variant) converts the sponsored gas cost into
//! an oracle-priced ERC-20 charge with post-execution reconciliation.

pub mod chain;
pub mod codec;
pub mod error;
pub mod fees;
pub mod hash;
pub mod paymaster;
pub mod rpc;
pub mod types;
pub mod validation;
pub mod verify;

pub use error::PaymasterError;
pub use paymaster::{Paymaster, PaymasterConfig, StakeLedger, TokenLedger};
