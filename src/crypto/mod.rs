pub mod encryption;
pub mod keys;

pub use encryption::*;
pub use keys::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed — wrong key or corrupted data")]
    DecryptionFailed,

    #[error("Corrupted record: auth tag too short")]
    CorruptedProfile,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
