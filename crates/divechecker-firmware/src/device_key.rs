//! Signing key selection.
//!
//! The compiled key comes from `build.rs`; the fused key is read from eFuse
//! at boot. Which one is used is fixed at build time by the `otp-key` feature.

use divechecker_core::auth::{
    AuthError, KeyProvider, OtpImage, OtpKeyProvider, PUBLIC_KEY_LEN, PrivateKey, StaticKey,
};
use divechecker_core::config::KeySource;

use crate::app_state::read_key_fuses;

include!(concat!(env!("OUT_DIR"), "/device_key.rs"));

pub const fn compiled_key() -> StaticKey {
    StaticKey::new(DEVICE_PRIVATE_KEY)
}

/// Key provider picked from [`KeySource`].
pub enum DeviceKey {
    Compiled(StaticKey),
    Fused(OtpKeyProvider<OtpImage>),
}

impl DeviceKey {
    pub fn from_source(source: KeySource) -> Self {
        match source {
            KeySource::Compiled => Self::Compiled(compiled_key()),
            KeySource::Otp => Self::Fused(OtpKeyProvider::new(read_key_fuses())),
        }
    }
}

impl KeyProvider for DeviceKey {
    fn load(&mut self) -> Result<PrivateKey, AuthError> {
        match self {
            Self::Compiled(key) => key.load(),
            Self::Fused(otp) => otp.load(),
        }
    }

    fn provisioned_public_key(&mut self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        match self {
            Self::Compiled(key) => key.provisioned_public_key(),
            Self::Fused(otp) => otp.provisioned_public_key(),
        }
    }
}
