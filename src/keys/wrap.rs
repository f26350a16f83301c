//! Key-data confidentiality: AES Key Wrap (RFC 3394) and legacy RC4

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256, Block};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{HandshakeError, Result};

const DEFAULT_IV: [u8; 8] = [0xA6; 8];

/// Key-data cipher selected by the descriptor version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyWrap {
    /// AES Key Wrap with the KEK (versions 0, 2 and 3)
    AesKw,
    /// RC4 keyed with EAPOL IV || KEK, first 256 bytes discarded (version 1)
    Rc4,
}

impl KeyWrap {
    pub fn wrap(self, kek: &[u8], iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
        match self {
            KeyWrap::AesKw => aes_wrap(kek, plaintext),
            KeyWrap::Rc4 => Ok(rc4_crypt(kek, iv, plaintext).to_vec()),
        }
    }

    pub fn unwrap(self, kek: &[u8], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            KeyWrap::AesKw => aes_unwrap(kek, ciphertext),
            KeyWrap::Rc4 => Ok(rc4_crypt(kek, iv, ciphertext)),
        }
    }
}

enum Kw {
    A128(Aes128),
    A256(Aes256),
}

impl Kw {
    fn new(kek: &[u8]) -> Result<Self> {
        let bad_len = |_| HandshakeError::Crypto(format!("invalid KEK length {}", kek.len()));
        match kek.len() {
            16 => Ok(Kw::A128(Aes128::new_from_slice(kek).map_err(bad_len)?)),
            32 => Ok(Kw::A256(Aes256::new_from_slice(kek).map_err(bad_len)?)),
            n => Err(HandshakeError::Crypto(format!("invalid KEK length {}", n))),
        }
    }

    fn encrypt(&self, block: &mut Block) {
        match self {
            Kw::A128(c) => c.encrypt_block(block),
            Kw::A256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut Block) {
        match self {
            Kw::A128(c) => c.decrypt_block(block),
            Kw::A256(c) => c.decrypt_block(block),
        }
    }
}

/// RFC 3394 wrap. Input must be a multiple of 8 bytes and at least 16.
pub fn aes_wrap(kek: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() % 8 != 0 || plaintext.len() < 16 {
        return Err(HandshakeError::Crypto(format!(
            "key wrap input of {} bytes",
            plaintext.len()
        )));
    }
    let cipher = Kw::new(kek)?;
    let n = plaintext.len() / 8;
    let mut a = DEFAULT_IV;
    let mut r = Zeroizing::new(plaintext.to_vec());
    let mut block = Block::default();

    for j in 0..6 {
        for i in 0..n {
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&r[i * 8..i * 8 + 8]);
            cipher.encrypt(&mut block);
            let t = (n * j + i + 1) as u64;
            a.copy_from_slice(&block[..8]);
            for (x, y) in a.iter_mut().zip(t.to_be_bytes()) {
                *x ^= y;
            }
            r[i * 8..i * 8 + 8].copy_from_slice(&block[8..]);
        }
    }

    let mut out = Vec::with_capacity(plaintext.len() + 8);
    out.extend_from_slice(&a);
    out.extend_from_slice(&r);
    Ok(out)
}

/// RFC 3394 unwrap. Any integrity failure is a key-data decrypt failure.
pub fn aes_unwrap(kek: &[u8], ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if ciphertext.len() % 8 != 0 || ciphertext.len() < 24 {
        return Err(HandshakeError::KeyDataDecryptFailure);
    }
    let cipher = Kw::new(kek)?;
    let n = ciphertext.len() / 8 - 1;
    let mut a = [0u8; 8];
    a.copy_from_slice(&ciphertext[..8]);
    let mut r = Zeroizing::new(ciphertext[8..].to_vec());
    let mut block = Block::default();

    for j in (0..6).rev() {
        for i in (0..n).rev() {
            let t = (n * j + i + 1) as u64;
            for (x, y) in a.iter_mut().zip(t.to_be_bytes()) {
                *x ^= y;
            }
            block[..8].copy_from_slice(&a);
            block[8..].copy_from_slice(&r[i * 8..i * 8 + 8]);
            cipher.decrypt(&mut block);
            a.copy_from_slice(&block[..8]);
            r[i * 8..i * 8 + 8].copy_from_slice(&block[8..]);
        }
    }

    if bool::from(a[..].ct_eq(&DEFAULT_IV[..])) {
        Ok(r)
    } else {
        Err(HandshakeError::KeyDataDecryptFailure)
    }
}

fn rc4_apply(key: &[u8], skip: usize, data: &mut [u8]) {
    let mut s: [u8; 256] = std::array::from_fn(|i| i as u8);
    let mut j: u8 = 0;
    for i in 0..256 {
        j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
        s.swap(i, j as usize);
    }

    let (mut i, mut j) = (0u8, 0u8);
    for n in 0..skip + data.len() {
        i = i.wrapping_add(1);
        j = j.wrapping_add(s[i as usize]);
        s.swap(i as usize, j as usize);
        let k = s[s[i as usize].wrapping_add(s[j as usize]) as usize];
        if n >= skip {
            data[n - skip] ^= k;
        }
    }
    s.fill(0);
}

/// WPA key-data RC4: key = EAPOL key IV || KEK, 256 keystream bytes dropped
pub fn rc4_crypt(kek: &[u8], iv: &[u8; 16], data: &[u8]) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(16 + kek.len()));
    key.extend_from_slice(iv);
    key.extend_from_slice(kek);
    let mut out = Zeroizing::new(data.to_vec());
    rc4_apply(&key, 256, &mut out);
    out
}
