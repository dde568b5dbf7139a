pub mod wallet;

pub use wallet::{normalize_address, verify_signature, Intent, Wallet};
