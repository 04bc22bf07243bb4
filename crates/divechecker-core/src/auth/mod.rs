//! ECDSA P-256 challenge-response authentication
//!
//! The host sends a 32-byte nonce; the device signs `SHA-256(nonce)` and
//! returns the DER signature. The key is loaded lazily on the first
//! challenge. Whatever that first load concludes is final for the rest of the
//! boot: key sources cannot change while the firmware runs.

mod keys;

use heapless::Vec;
use log::{error, info, warn};
use p256::ecdsa::signature::RandomizedSigner;
use p256::ecdsa::{Signature, SigningKey};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use sha2::{Digest, Sha256};
use thiserror_no_std::Error;
use zeroize::Zeroizing;

pub use keys::*;

pub const NONCE_LEN: usize = 32;
/// Upper bound of a DER-encoded P-256 signature.
pub const MAX_SIGNATURE_LEN: usize = 72;

const DRBG_PERSONALIZATION: &[u8] = b"divechecker_ecdsa";

pub type DerSignature = Vec<u8, MAX_SIGNATURE_LEN>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("ECDSA not ready")]
    KeyNotConfigured,
    #[error("Key load failed")]
    KeyLoadFailed,
    #[error("Invalid nonce")]
    MalformedNonce,
    #[error("Sign failed")]
    SigningFailed,
}

/// Hardware random number generator used to seed the signing DRBG.
pub trait EntropySource {
    fn fill_bytes(&mut self, dest: &mut [u8]);
}

struct Signer {
    key: SigningKey,
    drbg: ChaCha20Rng,
}

enum AuthState {
    Uninit,
    Ready(Signer),
    Failed(AuthError),
}

pub struct AuthSubsystem<K, E> {
    keys: K,
    entropy: E,
    state: AuthState,
}

impl<K: KeyProvider, E: EntropySource> AuthSubsystem<K, E> {
    pub fn new(keys: K, entropy: E) -> Self {
        Self {
            keys,
            entropy,
            state: AuthState::Uninit,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, AuthState::Ready(_))
    }

    /// Load the key on first use; later calls return the cached outcome.
    pub fn ensure_initialized(&mut self) -> Result<(), AuthError> {
        match self.state {
            AuthState::Ready(_) => return Ok(()),
            AuthState::Failed(e) => return Err(e),
            AuthState::Uninit => {}
        }

        match self.initialize() {
            Ok(signer) => {
                info!("ECDSA key loaded");
                self.state = AuthState::Ready(signer);
                Ok(())
            }
            Err(e) => {
                warn!("ECDSA unavailable: {e}");
                self.state = AuthState::Failed(e);
                Err(e)
            }
        }
    }

    fn initialize(&mut self) -> Result<Signer, AuthError> {
        let secret = self.keys.load()?;
        if secret.iter().all(|&b| b == 0) {
            warn!("ECDSA keys not configured");
            return Err(AuthError::KeyNotConfigured);
        }

        let key = SigningKey::from_slice(secret.as_slice()).map_err(|_| {
            error!("Private key is not a valid P-256 scalar");
            AuthError::KeyLoadFailed
        })?;

        if let Some(expected) = self.keys.provisioned_public_key() {
            let derived = key.verifying_key().to_encoded_point(false);
            if derived.as_bytes() != expected.as_slice() {
                error!("Provisioned public key does not match private key");
                return Err(AuthError::KeyLoadFailed);
            }
        }

        let mut entropy = Zeroizing::new([0u8; 32]);
        self.entropy.fill_bytes(entropy.as_mut_slice());
        let mut hasher = Sha256::new();
        hasher.update(entropy.as_slice());
        hasher.update(DRBG_PERSONALIZATION);
        let drbg = ChaCha20Rng::from_seed(hasher.finalize().into());

        Ok(Signer { key, drbg })
    }

    /// Sign a 32-byte challenge, returning the DER signature.
    pub fn sign(&mut self, nonce: &[u8]) -> Result<DerSignature, AuthError> {
        self.ensure_initialized()?;
        if nonce.len() != NONCE_LEN {
            return Err(AuthError::MalformedNonce);
        }

        let AuthState::Ready(signer) = &mut self.state else {
            return Err(AuthError::KeyNotConfigured);
        };

        let signature: Signature = signer
            .key
            .try_sign_with_rng(&mut signer.drbg, nonce)
            .map_err(|e| {
                error!("ECDSA sign failed: {e:?}");
                AuthError::SigningFailed
            })?;

        Vec::from_slice(signature.to_der().as_bytes()).map_err(|_| AuthError::SigningFailed)
    }

    /// Uncompressed SEC1 encoding of the device public key.
    pub fn public_key_sec1(&mut self) -> Result<[u8; PUBLIC_KEY_LEN], AuthError> {
        self.ensure_initialized()?;
        let AuthState::Ready(signer) = &self.state else {
            return Err(AuthError::KeyNotConfigured);
        };

        let point = signer.key.verifying_key().to_encoded_point(false);
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(point.as_bytes());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::VerifyingKey;
    use p256::ecdsa::signature::Verifier;

    const TEST_KEY: [u8; 32] = [
        0xC9, 0xAF, 0xA9, 0xD8, 0x45, 0xBA, 0x75, 0x16, 0x6B, 0x5C, 0x21, 0x57, 0x67, 0xB1, 0xD6,
        0x93, 0x4E, 0x50, 0xC3, 0xDB, 0x36, 0xE8, 0x9B, 0x12, 0x7B, 0x8A, 0x62, 0x2B, 0x12, 0x0F,
        0x67, 0x21,
    ];

    struct CountingEntropy(u8);

    impl EntropySource for CountingEntropy {
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for byte in dest {
                self.0 = self.0.wrapping_add(1);
                *byte = self.0;
            }
        }
    }

    struct CountingKey {
        inner: StaticKey,
        loads: usize,
    }

    impl KeyProvider for CountingKey {
        fn load(&mut self) -> Result<PrivateKey, AuthError> {
            self.loads += 1;
            self.inner.load()
        }
    }

    fn test_public_key() -> [u8; PUBLIC_KEY_LEN] {
        let key = SigningKey::from_slice(&TEST_KEY).unwrap();
        let mut out = [0u8; PUBLIC_KEY_LEN];
        out.copy_from_slice(key.verifying_key().to_encoded_point(false).as_bytes());
        out
    }

    fn verify(public: &[u8], nonce: &[u8], der: &[u8]) -> bool {
        let key = VerifyingKey::from_sec1_bytes(public).unwrap();
        let signature = Signature::from_der(der).unwrap();
        key.verify(nonce, &signature).is_ok()
    }

    #[test]
    fn test_placeholder_key_fails_permanently() {
        let keys = CountingKey {
            inner: StaticKey::PLACEHOLDER,
            loads: 0,
        };
        let mut auth = AuthSubsystem::new(keys, CountingEntropy(0));

        assert_eq!(auth.sign(&[0u8; 32]), Err(AuthError::KeyNotConfigured));
        assert_eq!(auth.sign(&[0u8; 32]), Err(AuthError::KeyNotConfigured));
        assert!(!auth.is_ready());
        assert_eq!(auth.keys.loads, 1);
    }

    #[test]
    fn test_valid_key_signature_verifies() {
        let mut auth = AuthSubsystem::new(StaticKey::new(TEST_KEY), CountingEntropy(7));
        let nonce: [u8; 32] = core::array::from_fn(|i| i as u8);

        let der = auth.sign(&nonce).unwrap();
        assert!(der.len() <= MAX_SIGNATURE_LEN);
        assert_eq!(der[0], 0x30);

        let public = auth.public_key_sec1().unwrap();
        assert_eq!(public, test_public_key());
        assert!(verify(&public, &nonce, &der));
        assert!(!verify(&public, &[0xAA; 32], &der));
    }

    #[test]
    fn test_key_loaded_once() {
        let keys = CountingKey {
            inner: StaticKey::new(TEST_KEY),
            loads: 0,
        };
        let mut auth = AuthSubsystem::new(keys, CountingEntropy(0));
        for _ in 0..3 {
            auth.sign(&[1u8; 32]).unwrap();
        }
        assert_eq!(auth.keys.loads, 1);
    }

    #[test]
    fn test_wrong_nonce_length_is_rejected() {
        let mut auth = AuthSubsystem::new(StaticKey::new(TEST_KEY), CountingEntropy(0));
        assert_eq!(auth.sign(&[0u8; 31]), Err(AuthError::MalformedNonce));
        assert_eq!(auth.sign(&[0u8; 33]), Err(AuthError::MalformedNonce));
        assert!(auth.is_ready());
    }

    #[test]
    fn test_unprogrammed_otp_is_not_configured() {
        let otp = OtpImage::new(TEST_KEY, &test_public_key(), 0);
        let mut auth = AuthSubsystem::new(OtpKeyProvider::new(otp), CountingEntropy(0));
        assert_eq!(auth.ensure_initialized(), Err(AuthError::KeyNotConfigured));
    }

    #[test]
    fn test_programmed_otp_signs() {
        let otp = OtpImage::programmed(TEST_KEY, &test_public_key());
        let mut auth = AuthSubsystem::new(OtpKeyProvider::new(otp), CountingEntropy(0));

        let nonce = [0x5A; 32];
        let der = auth.sign(&nonce).unwrap();
        assert!(verify(&test_public_key(), &nonce, &der));
    }

    #[test]
    fn test_otp_public_key_mismatch_fails_load() {
        let mut public = test_public_key();
        public[10] ^= 0xFF;
        let otp = OtpImage::programmed(TEST_KEY, &public);
        let mut auth = AuthSubsystem::new(OtpKeyProvider::new(otp), CountingEntropy(0));
        assert_eq!(auth.ensure_initialized(), Err(AuthError::KeyLoadFailed));
    }

    #[test]
    fn test_otp_rows_unpack_high_byte_first() {
        let otp = OtpImage::programmed(TEST_KEY, &test_public_key());
        let mut provider = OtpKeyProvider::new(otp);
        assert_eq!(*provider.load().unwrap(), TEST_KEY);
        assert_eq!(provider.provisioned_public_key(), Some(test_public_key()));
    }

    #[test]
    fn test_otp_image_row_layout() {
        let public = test_public_key();
        let mut otp = OtpImage::programmed(TEST_KEY, &public);

        assert_eq!(otp.read_row(OTP_PRIVATE_KEY_ROW), u16::from_be_bytes([0xC9, 0xAF]));
        assert_eq!(otp.read_row(0x70F), u16::from_be_bytes([0x67, 0x21]));
        assert_eq!(otp.read_row(OTP_PUBLIC_KEY_ROW), u16::from_be_bytes([0x04, public[1]]));
        // Last public row holds the 65th byte and an unused low byte.
        assert_eq!(otp.read_row(0x730), u16::from_be_bytes([public[64], 0]));
        assert_eq!(otp.read_row(0x731), 0);
        assert_eq!(otp.read_row(OTP_KEY_FLAG_ROW), OTP_KEY_PROGRAMMED);
        assert_eq!(otp.read_row(0x6FF), 0);
        assert_eq!(otp.read_row(0x741), 0);
    }

    #[test]
    fn test_blank_otp_reads_zero() {
        let mut otp = OtpImage::blank();
        for row in OTP_PRIVATE_KEY_ROW..=OTP_KEY_FLAG_ROW {
            assert_eq!(otp.read_row(row), 0);
        }
        let mut auth = AuthSubsystem::new(OtpKeyProvider::new(otp), CountingEntropy(0));
        assert_eq!(auth.sign(&[0u8; 32]), Err(AuthError::KeyNotConfigured));
    }

    #[test]
    fn test_static_key_from_hex() {
        let hex = "c9afa9d845ba75166b5c215767b1d6934e50c3db36e89b127b8a622b120f6721\n";
        let mut key = StaticKey::from_hex(hex).unwrap();
        assert_eq!(*key.load().unwrap(), TEST_KEY);

        assert!(StaticKey::from_hex("c9af").is_none());
        assert!(StaticKey::from_hex(&hex.replace('c', "x")).is_none());
    }
}
