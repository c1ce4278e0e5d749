//! NIP-04 direct-message encryption.
//!
//! The pairwise key is the x-coordinate of the ECDH point between our
//! secret key and the peer's public key (lifted from its x-only form).
//! Content is AES-256-CBC with PKCS#7 padding and a random 16-byte IV,
//! framed as `base64(ciphertext) "?iv=" base64(iv)`.

use aes::Aes256;
use base64::Engine;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use zeroize::Zeroize;

use crate::keys::Keypair;
use crate::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const IV_SIZE: usize = 16;

const B64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Derive the 32-byte pairwise key shared with `peer_pubkey_hex`.
///
/// The x-coordinate alone is used, so either lift of the peer's x-only key
/// yields the same secret.
fn shared_key(keypair: &Keypair, peer_pubkey_hex: &str) -> Result<[u8; 32]> {
    let peer_bytes =
        hex::decode(peer_pubkey_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    if peer_bytes.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "expected 32 bytes, got {}",
            peer_bytes.len()
        )));
    }

    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(&peer_bytes);
    let peer = k256::PublicKey::from_sec1_bytes(&sec1)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let secret = k256::SecretKey::from_slice(keypair.secret_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    let shared_point = (peer.to_projective() * *secret.to_nonzero_scalar()).to_affine();
    let encoded = shared_point.to_encoded_point(false);
    let x = encoded
        .x()
        .ok_or_else(|| CryptoError::KeyDerivation("shared point at infinity".to_string()))?;

    let mut key = [0u8; 32];
    key.copy_from_slice(x);
    Ok(key)
}

/// Encrypt `plaintext` for `peer_pubkey_hex`.
pub fn encrypt(keypair: &Keypair, peer_pubkey_hex: &str, plaintext: &[u8]) -> Result<String> {
    let mut key = shared_key(keypair, peer_pubkey_hex)?;
    let iv: [u8; IV_SIZE] = rand::random();

    let ciphertext =
        Aes256CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);
    key.zeroize();

    Ok(format!("{}?iv={}", B64.encode(ciphertext), B64.encode(iv)))
}

/// Decrypt a `base64(ct)?iv=base64(iv)` string from `peer_pubkey_hex`.
pub fn decrypt(keypair: &Keypair, peer_pubkey_hex: &str, content: &str) -> Result<Vec<u8>> {
    let (ct_b64, iv_b64) = content
        .split_once("?iv=")
        .ok_or_else(|| CryptoError::InvalidInput("missing iv separator".to_string()))?;

    let ciphertext = B64
        .decode(ct_b64)
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    let iv_bytes = B64
        .decode(iv_b64)
        .map_err(|e| CryptoError::InvalidInput(e.to_string()))?;
    if iv_bytes.len() != IV_SIZE {
        return Err(CryptoError::InvalidInput(format!(
            "iv must be {IV_SIZE} bytes, got {}",
            iv_bytes.len()
        )));
    }
    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&iv_bytes);

    let mut key = shared_key(keypair, peer_pubkey_hex)?;
    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::Decryption);
    key.zeroize();
    plaintext
}

/// Whether a content string looks like a DM ciphertext frame.
pub fn looks_encrypted(content: &str) -> bool {
    content.contains("?iv=")
}
