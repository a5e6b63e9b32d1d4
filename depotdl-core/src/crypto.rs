/*!
The symmetric cipher protecting depot chunks.

Every chunk on the CDN is encrypted under its depot's 16 byte key: the
first block of the ciphertext is the ECB encrypted IV, and the remainder is
the AES-CBC encrypted payload with PKCS#7 padding. Both directions are
implemented here; the encrypting half is what fixtures use to fabricate
chunks.
*/

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use aes::Aes128;
use rand::prelude::*;
use thiserror::Error;

use std::fmt;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_LEN: usize = 16;

/// Error describing the ways decryption of a chunk can fail
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("depot key is not valid hex")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("depot key must be 16 bytes, got {0}")]
    BadKeyLength(usize),
    #[error("ciphertext is too short to contain an IV block")]
    TooShort,
    #[error("ciphertext length is not a whole number of cipher blocks")]
    BadBlockLength,
    #[error("bad PKCS#7 padding in decrypted chunk")]
    BadPadding,
}

type Result<T> = std::result::Result<T, CryptoError>;

/// The 16 byte symmetric key of a single depot.
///
/// Keys are distributed hex encoded (in `config.vdf` and on the command
/// line) and are the only secret involved in a download.
#[derive(Clone, PartialEq, Eq)]
pub struct DepotKey([u8; 16]);

impl DepotKey {
    /// Parses a hex encoded key, as found in `config.vdf`
    pub fn from_hex(input: &str) -> Result<DepotKey> {
        let bytes = hex::decode(input.trim())?;
        if bytes.len() != 16 {
            return Err(CryptoError::BadKeyLength(bytes.len()));
        }
        let mut key = [0_u8; 16];
        key.copy_from_slice(&bytes);
        Ok(DepotKey(key))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> DepotKey {
        DepotKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for DepotKey {
    // Key material stays out of log output
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DepotKey(..)")
    }
}

/// Decrypts a chunk blob fetched from the CDN.
///
/// # Errors
///
/// Returns `Err` if the blob is not shaped like `ECB(iv) || CBC(payload)`
/// or the padding does not check out, both of which mean the blob is
/// corrupt or the key is wrong.
pub fn decrypt(data: &[u8], key: &DepotKey) -> Result<Vec<u8>> {
    if data.len() < BLOCK_LEN * 2 {
        return Err(CryptoError::TooShort);
    }
    if (data.len() - BLOCK_LEN) % BLOCK_LEN != 0 {
        return Err(CryptoError::BadBlockLength);
    }
    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    let mut iv = [0_u8; BLOCK_LEN];
    iv.copy_from_slice(&data[..BLOCK_LEN]);
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut iv));

    Aes128CbcDec::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&iv),
    )
    .decrypt_padded_vec_mut::<Pkcs7>(&data[BLOCK_LEN..])
    .map_err(|_| CryptoError::BadPadding)
}

/// Encrypts a chunk payload the way the CDN stores it, under a freshly
/// generated random IV
pub fn encrypt(data: &[u8], key: &DepotKey) -> Vec<u8> {
    let mut iv = [0_u8; BLOCK_LEN];
    thread_rng().fill_bytes(&mut iv);

    let body = Aes128CbcEnc::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&iv),
    )
    .encrypt_padded_vec_mut::<Pkcs7>(data);

    let cipher = Aes128::new(GenericArray::from_slice(key.as_bytes()));
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut iv));

    let mut out = Vec::with_capacity(BLOCK_LEN + body.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&body);
    out
}
