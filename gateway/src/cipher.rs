use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::read::GzDecoder;
use std::io::Read;
use upstream::errors::{ApiError, Result};
use upstream::prefetch::ContentCipher;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Chapter payload decryption: base64 ciphertext with a 16-byte IV prefix,
/// AES-128-CBC under the hex-encoded registered key, then an optional gzip
/// layer inside the plaintext.
pub struct AesCbcCipher;

impl ContentCipher for AesCbcCipher {
    fn decrypt(&self, ciphertext: &str, key: &str) -> Result<String> {
        let key = hex::decode(key.trim())
            .map_err(|e| ApiError::DecryptionFailed(format!("key is not valid hex: {e}")))?;
        if key.len() != 16 {
            return Err(ApiError::DecryptionFailed(format!(
                "key must be 16 bytes, got {}",
                key.len()
            )));
        }

        let raw = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| ApiError::DecryptionFailed(format!("ciphertext is not valid base64: {e}")))?;
        if raw.len() < 16 {
            return Err(ApiError::DecryptionFailed(
                "ciphertext shorter than its iv".into(),
            ));
        }
        let (iv, body) = raw.split_at(16);

        let plain = Aes128CbcDec::new_from_slices(&key, iv)
            .map_err(|e| ApiError::DecryptionFailed(format!("cipher init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| ApiError::DecryptionFailed("bad padding".into()))?;

        if plain.len() >= 2 && plain[0] == 0x1f && plain[1] == 0x8b {
            let mut decoder = GzDecoder::new(plain.as_slice());
            let mut text = String::new();
            decoder
                .read_to_string(&mut text)
                .map_err(|e| ApiError::DecryptionFailed(format!("gzip layer: {e}")))?;
            return Ok(text);
        }
        String::from_utf8(plain)
            .map_err(|e| ApiError::DecryptionFailed(format!("plaintext is not utf-8: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncryptMut;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f";
    const IV: [u8; 16] = [7u8; 16];

    fn encrypt(plaintext: &[u8]) -> String {
        let key = hex::decode(KEY_HEX).unwrap();
        let body = Aes128CbcEnc::new_from_slices(&key, &IV)
            .unwrap()
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        let mut raw = IV.to_vec();
        raw.extend(body);
        STANDARD.encode(raw)
    }

    #[test]
    fn test_decrypt_plain_payload() {
        let ciphertext = encrypt(b"<p><blk>hello</blk></p>");
        let plain = AesCbcCipher.decrypt(&ciphertext, KEY_HEX).unwrap();
        assert_eq!(plain, "<p><blk>hello</blk></p>");
    }

    #[test]
    fn test_decrypt_gzipped_payload() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed chapter").unwrap();
        let ciphertext = encrypt(&encoder.finish().unwrap());

        let plain = AesCbcCipher.decrypt(&ciphertext, KEY_HEX).unwrap();
        assert_eq!(plain, "compressed chapter");
    }

    #[test]
    fn test_bad_key_rejected() {
        let ciphertext = encrypt(b"irrelevant");
        assert!(matches!(
            AesCbcCipher.decrypt(&ciphertext, "zz"),
            Err(ApiError::DecryptionFailed(_))
        ));
        assert!(matches!(
            AesCbcCipher.decrypt(&ciphertext, "0011"),
            Err(ApiError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let short = STANDARD.encode([1u8; 8]);
        assert!(matches!(
            AesCbcCipher.decrypt(&short, KEY_HEX),
            Err(ApiError::DecryptionFailed(_))
        ));
    }
}
