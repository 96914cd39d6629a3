pub mod engine;
pub mod keys;
pub mod stream;

pub use engine::{CryptoEngine, CryptoError, CryptoResult, KdfParams};
pub use keys::{DerivedKey, MasterKey};
