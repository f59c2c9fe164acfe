use aes::cipher::block_padding::Pkcs7;
use aes::cipher::BlockDecryptMut;
use aes::cipher::BlockSizeUser;
use aes::cipher::Key;
use aes::cipher::Unsigned;
use cbc::cipher::BlockEncryptMut;
use cbc::cipher::KeyIvInit;
use crypto_common::{IvSizeUser, KeySizeUser, OutputSizeUser};
use hmac::{Hmac, Mac};
use rand_core::CryptoRngCore;
use sha2::Sha256;

use crate::error::RnsError;

type AesCbcEnc = cbc::Encryptor<aes::Aes128>;
type AesCbcDec = cbc::Decryptor<aes::Aes128>;
type AesKey = Key<aes::Aes128>;

type HmacSha256 = Hmac<Sha256>;

const HMAC_OUT_SIZE: usize = <<HmacSha256 as OutputSizeUser>::OutputSize as Unsigned>::USIZE;
const SIGN_KEY_SIZE: usize = <<aes::Aes128 as KeySizeUser>::KeySize as Unsigned>::USIZE;
const ENC_KEY_SIZE: usize = SIGN_KEY_SIZE;
const IV_SIZE: usize = <<AesCbcEnc as IvSizeUser>::IvSize as Unsigned>::USIZE;
const AES_BLOCK_SIZE: usize = <<aes::Aes128 as BlockSizeUser>::BlockSize as Unsigned>::USIZE;

pub const FERNET_KEY_SIZE: usize = SIGN_KEY_SIZE + ENC_KEY_SIZE;
pub const FERNET_OVERHEAD_SIZE: usize = IV_SIZE + HMAC_OUT_SIZE;
pub const FERNET_MAX_PADDING_SIZE: usize = AES_BLOCK_SIZE;

pub struct PlainText<'a>(&'a [u8]);
pub struct Token<'a>(&'a [u8]);
pub struct VerifiedToken<'a>(&'a [u8]);

// Modified implementation of the Fernet spec at
// https://github.com/fernet/spec/blob/master/Spec.md
//
// The spec's one byte VERSION and eight byte TIMESTAMP fields are not
// relevant to Reticulum and are stripped: they incur overhead and leak
// initiator metadata. A token is iv || ciphertext || hmac, keyed by exactly
// 32 bytes split into the signing half and the AES-128 half.
pub struct Fernet<R: CryptoRngCore> {
    rng: R,
    sign_key: [u8; SIGN_KEY_SIZE],
    enc_key: AesKey,
}

impl<'a> PlainText<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }
}

impl<'a> From<&'a str> for PlainText<'a> {
    fn from(item: &'a str) -> Self {
        Self(item.as_bytes())
    }
}

impl<'a> From<&'a [u8]> for PlainText<'a> {
    fn from(item: &'a [u8]) -> Self {
        Self(item)
    }
}

impl<'a> Token<'a> {
    pub fn as_bytes(&self) -> &'a [u8] {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> From<&'a [u8]> for Token<'a> {
    fn from(item: &'a [u8]) -> Self {
        Self(item)
    }
}

impl<R: CryptoRngCore + Copy> Fernet<R> {
    pub fn new_from_key(key: &[u8; FERNET_KEY_SIZE], rng: R) -> Self {
        let mut sign_key = [0u8; SIGN_KEY_SIZE];
        sign_key.copy_from_slice(&key[..SIGN_KEY_SIZE]);

        let mut enc_key_bytes = [0u8; ENC_KEY_SIZE];
        enc_key_bytes.copy_from_slice(&key[SIGN_KEY_SIZE..]);

        Self { rng, sign_key, enc_key: enc_key_bytes.into() }
    }

    pub fn new_from_slices(sign_key: &[u8], enc_key: &[u8], rng: R) -> Self {
        let mut key = [0u8; FERNET_KEY_SIZE];
        let sign_len = sign_key.len().min(SIGN_KEY_SIZE);
        key[..sign_len].copy_from_slice(&sign_key[..sign_len]);
        let enc_len = enc_key.len().min(ENC_KEY_SIZE);
        key[SIGN_KEY_SIZE..SIGN_KEY_SIZE + enc_len].copy_from_slice(&enc_key[..enc_len]);
        Self::new_from_key(&key, rng)
    }

    pub fn new_rand(mut rng: R) -> Self {
        let mut key = [0u8; FERNET_KEY_SIZE];
        rng.fill_bytes(&mut key);
        Self::new_from_key(&key, rng)
    }

    pub fn encrypt<'a>(
        &self,
        text: PlainText,
        out_buf: &'a mut [u8],
    ) -> Result<Token<'a>, RnsError> {
        let padded_len = (text.0.len() / AES_BLOCK_SIZE + 1) * AES_BLOCK_SIZE;
        let required = FERNET_OVERHEAD_SIZE + padded_len;
        if out_buf.len() < required {
            return Err(RnsError::InvalidArgument);
        }

        let iv = AesCbcEnc::generate_iv(self.rng);
        out_buf[..IV_SIZE].copy_from_slice(iv.as_slice());
        let mut out_len = IV_SIZE;

        let cipher_len = AesCbcEnc::new(&self.enc_key, &iv)
            .encrypt_padded_b2b_mut::<Pkcs7>(text.0, &mut out_buf[out_len..])
            .map_err(|_| RnsError::InvalidArgument)?
            .len();
        out_len += cipher_len;

        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::InvalidArgument)?;
        hmac.update(&out_buf[..out_len]);
        let tag = hmac.finalize().into_bytes();

        out_buf[out_len..out_len + tag.len()].copy_from_slice(tag.as_slice());
        out_len += tag.len();

        Ok(Token(&out_buf[..out_len]))
    }

    /// Constant-time MAC check. Must pass before any plaintext is produced.
    pub fn verify<'a>(&self, token: Token<'a>) -> Result<VerifiedToken<'a>, RnsError> {
        let token_data = token.0;

        if token_data.len() <= FERNET_OVERHEAD_SIZE {
            return Err(RnsError::InvalidToken);
        }

        let tag_start = token_data.len() - HMAC_OUT_SIZE;

        let mut hmac = <HmacSha256 as Mac>::new_from_slice(&self.sign_key)
            .map_err(|_| RnsError::InvalidToken)?;
        hmac.update(&token_data[..tag_start]);

        hmac.verify_slice(&token_data[tag_start..]).map_err(|_| RnsError::InvalidToken)?;

        Ok(VerifiedToken(token_data))
    }

    pub fn decrypt<'a, 'b>(
        &self,
        token: VerifiedToken<'a>,
        out_buf: &'b mut [u8],
    ) -> Result<PlainText<'b>, RnsError> {
        let token_data = token.0;
        let tag_start = token_data.len() - HMAC_OUT_SIZE;

        let iv: [u8; IV_SIZE] =
            token_data[..IV_SIZE].try_into().map_err(|_| RnsError::InvalidToken)?;
        let ciphertext = &token_data[IV_SIZE..tag_start];

        let plain = AesCbcDec::new(&self.enc_key, &iv.into())
            .decrypt_padded_b2b_mut::<Pkcs7>(ciphertext, out_buf)
            .map_err(|_| RnsError::InvalidToken)?;

        Ok(PlainText(plain))
    }
}

#[cfg(test)]
mod tests {
    use core::str;
    use rand_core::OsRng;

    use super::{Fernet, Token, AES_BLOCK_SIZE, FERNET_OVERHEAD_SIZE};

    #[test]
    fn encrypt_then_decrypt() {
        const BUF_SIZE: usize = 4096;

        let fernet = Fernet::new_rand(OsRng);
        let out_msg: &str = "#FERNET_TEST_MESSAGE#";

        let mut out_buf = [0u8; BUF_SIZE];
        let token = fernet.encrypt(out_msg.into(), &mut out_buf).expect("cipher token");
        let token = fernet.verify(token).expect("verified token");

        let mut in_buf = [0u8; BUF_SIZE];
        let in_msg = str::from_utf8(
            fernet.decrypt(token, &mut in_buf).expect("decoded token").as_bytes(),
        )
        .expect("valid string");

        assert_eq!(in_msg, out_msg);
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let fernet = Fernet::new_rand(OsRng);

        let mut out_buf = [0u8; 128];
        let token = fernet.encrypt((&[] as &[u8]).into(), &mut out_buf).expect("cipher token");
        let token = fernet.verify(token).expect("verified token");

        let mut in_buf = [0u8; 128];
        let plain = fernet.decrypt(token, &mut in_buf).expect("decoded token");
        assert!(plain.as_bytes().is_empty());
    }

    #[test]
    fn tampered_token_fails_verification() {
        let fernet = Fernet::new_rand(OsRng);

        let mut out_buf = [0u8; 256];
        let token_len = {
            let token = fernet.encrypt("payload".into(), &mut out_buf).expect("cipher token");
            token.len()
        };

        out_buf[FERNET_OVERHEAD_SIZE / 2] ^= 0x01;
        assert!(fernet.verify(Token::from(&out_buf[..token_len])).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let fernet = Fernet::new_rand(OsRng);
        let other = Fernet::new_rand(OsRng);

        let mut out_buf = [0u8; 256];
        let token_len =
            fernet.encrypt("payload".into(), &mut out_buf).expect("cipher token").len();

        assert!(other.verify(Token::from(&out_buf[..token_len])).is_err());
    }

    #[test]
    fn rejects_undersized_output_buffer() {
        let fernet = Fernet::new_rand(OsRng);
        let mut out_buf = [0u8; FERNET_OVERHEAD_SIZE + AES_BLOCK_SIZE - 1];
        assert!(fernet.encrypt("hello".into(), &mut out_buf).is_err());
    }
}
