//! Brume core: cipher suite, secret chains, and block storage for an
//! anonymous block-sharing client.

pub mod chain;
pub mod config;
pub mod error;
pub mod mask;
pub mod seal;
pub mod store;
pub mod suite;

pub use chain::SecretChains;
pub use config::{ClientConfig, DEFAULT_BLOCK_SIZE, DEFAULT_MAX_ROUNDS};
pub use error::Error;
pub use seal::{multi_seal, open, open_point, seal_point, MultiSealed};
pub use store::{BlockLocation, BlockStore, ContentHash};
pub use suite::{Ristretto, Suite, DIGEST_LEN, KEY_LEN};
