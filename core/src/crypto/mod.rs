// Cryptography module: network-wide payload confidentiality

pub mod encrypt;

pub use encrypt::{decrypt, encrypt, DecryptError, EncryptError, NetworkKey, IV_LEN, KDF_ITERATIONS};
