//! EVM signing payloads
//!
//! Builds the digests the custodian signs and the encodings handed back to
//! callers:
//! - transactions (legacy EIP-155 and EIP-1559)
//! - EIP-7702 authorizations
//! - numeric field parsing shared by both

pub mod authorization;
pub mod quantity;
pub mod transaction;

pub use authorization::{Authorization, SignedAuthorization};
pub use quantity::{parse_biguint, Quantity};
pub use transaction::{
    Eip1559Transaction, LegacyTransaction, SignedTransaction, TransactionRequest, TxKind,
    TypedTransaction,
};
