use core::fmt;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A minimal secret container that zeroizes its contents on drop.
///
/// This is intentionally small and avoids exposing secrets via `Debug`.
#[derive(Clone)]
pub(crate) struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub(crate) fn expose(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<secret>")
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub(crate) type HmacSha1 = Hmac<Sha1>;

pub(crate) fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

pub(crate) fn hmac_sha1(key: &[u8], data: &[u8]) -> Result<[u8; 20]> {
    let mut mac =
        <HmacSha1 as Mac>::new_from_slice(key).map_err(|_| Error::Crypto("invalid HMAC key"))?;
    mac.update(data);
    let bytes = mac.finalize().into_bytes();
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes[..]);
    Ok(out)
}

pub(crate) fn hmac_sha1_truncated_12(key: &[u8], data: &[u8]) -> Result<[u8; 12]> {
    let full = hmac_sha1(key, data)?;
    let mut out = [0u8; 12];
    out.copy_from_slice(&full[..12]);
    Ok(out)
}

/// Derive K1 (integrity) and K2 (confidentiality) from the SIK.
///
/// The IPMI spec derives additional keying material from constant strings:
/// 20 bytes of 0x01 for K1 and 20 bytes of 0x02 for K2.
pub(crate) fn derive_k1_k2_sha1(sik: &[u8; 20]) -> Result<([u8; 20], [u8; 20])> {
    let const1 = [0x01u8; 20];
    let const2 = [0x02u8; 20];

    let k1 = hmac_sha1(sik, &const1)?;
    let k2 = hmac_sha1(sik, &const2)?;
    Ok((k1, k2))
}

pub(crate) fn derive_aes_key_from_k2(k2: &[u8; 20]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&k2[..16]);
    out
}

/// AES-128-CBC encryption without padding.
///
/// The caller must ensure `plaintext.len()` is a multiple of 16.
pub(crate) fn aes128_cbc_encrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if !plaintext.len().is_multiple_of(16) {
        return Err(Error::Crypto(
            "AES-CBC plaintext length must be a multiple of 16",
        ));
    }

    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(plaintext.len());
    let mut prev = *iv;

    for block in plaintext.chunks(16) {
        let mut xored = [0u8; 16];
        for i in 0..16 {
            xored[i] = block[i] ^ prev[i];
        }

        let mut ga = GenericArray::clone_from_slice(&xored);
        cipher.encrypt_block(&mut ga);

        let mut ct = [0u8; 16];
        ct.copy_from_slice(&ga);
        out.extend_from_slice(&ct);
        prev = ct;
    }

    Ok(out)
}

/// AES-128-CBC decryption without padding.
///
/// The caller must ensure `ciphertext.len()` is a multiple of 16.
pub(crate) fn aes128_cbc_decrypt(
    key: &[u8; 16],
    iv: &[u8; 16],
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if !ciphertext.len().is_multiple_of(16) {
        return Err(Error::Crypto(
            "AES-CBC ciphertext length must be a multiple of 16",
        ));
    }

    let cipher = Aes128::new_from_slice(key).map_err(|_| Error::Crypto("invalid AES-128 key"))?;

    let mut out = Vec::with_capacity(ciphertext.len());
    let mut prev = *iv;

    for block in ciphertext.chunks(16) {
        let mut ga = GenericArray::clone_from_slice(block);
        cipher.decrypt_block(&mut ga);

        let mut pt = [0u8; 16];
        pt.copy_from_slice(&ga);
        for i in 0..16 {
            pt[i] ^= prev[i];
        }

        out.extend_from_slice(&pt);

        let mut next_prev = [0u8; 16];
        next_prev.copy_from_slice(block);
        prev = next_prev;
    }

    Ok(out)
}

/// Append IPMI confidentiality padding (IPMI v2.0 §13.28.3).
///
/// `pad = 16 - (len % 16)` bytes are appended: 0x01, 0x02, ... up to
/// `pad - 1`, then the Confidentiality Pad Length byte `pad - 1`. The
/// result is always a whole number of AES blocks. This differs from
/// PKCS#7 by one byte; standard consoles reject the PKCS#7 form.
pub(crate) fn pad_confidentiality(data: &[u8]) -> Vec<u8> {
    let pad = 16 - (data.len() % 16);
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    for i in 1..pad {
        out.push(i as u8);
    }
    out.push((pad - 1) as u8);
    out
}

/// Strip IPMI confidentiality padding: the last byte is the pad length,
/// and `pad + 1` bytes are removed in total.
pub(crate) fn strip_confidentiality(mut data: Vec<u8>) -> Result<Vec<u8>> {
    let pad = *data
        .last()
        .ok_or(Error::Crypto("empty confidentiality payload"))? as usize;
    if pad + 1 > data.len() {
        return Err(Error::Crypto("invalid confidentiality pad length"));
    }
    data.truncate(data.len() - pad - 1);
    Ok(data)
}

/// Encrypt an IPMI payload with AES-CBC-128 and confidentiality padding.
///
/// A fresh random IV is generated per payload; the result is
/// `iv || ciphertext`.
pub(crate) fn encrypt_ipmi_payload(aes_key: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut iv = [0u8; 16];
    rand::rng().fill_bytes(&mut iv);

    let padded = pad_confidentiality(plaintext);
    let ciphertext = aes128_cbc_encrypt(aes_key, &iv, &padded)?;

    let mut out = Vec::with_capacity(16 + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt an `iv || ciphertext` IPMI payload and strip the padding.
pub(crate) fn decrypt_ipmi_payload(aes_key: &[u8; 16], payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() < 16 {
        return Err(Error::Crypto("encrypted payload too short"));
    }

    let iv: [u8; 16] = payload[..16]
        .try_into()
        .map_err(|_| Error::Crypto("invalid IV"))?;
    let ciphertext = &payload[16..];
    if ciphertext.is_empty() {
        return Err(Error::Crypto("empty ciphertext"));
    }

    let plaintext = aes128_cbc_decrypt(aes_key, &iv, ciphertext)?;
    strip_confidentiality(plaintext)
}
