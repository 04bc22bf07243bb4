use zeroize::Zeroizing;

use super::AuthError;

pub const PRIVATE_KEY_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 65;

pub type PrivateKey = Zeroizing<[u8; PRIVATE_KEY_LEN]>;

/// Source of the device's ECDSA P-256 private key.
pub trait KeyProvider {
    /// Fetch the raw 32-byte scalar.
    fn load(&mut self) -> Result<PrivateKey, AuthError>;

    /// Uncompressed SEC1 public key provisioned next to the private key, if
    /// the source has one. Checked against the derived key on load.
    fn provisioned_public_key(&mut self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        None
    }
}

/// Key baked into the image at build time.
///
/// Builds without a configured key carry the all-zero placeholder, which the
/// auth subsystem refuses.
pub struct StaticKey {
    key: [u8; PRIVATE_KEY_LEN],
}

impl StaticKey {
    pub const PLACEHOLDER: Self = Self::new([0; PRIVATE_KEY_LEN]);

    pub const fn new(key: [u8; PRIVATE_KEY_LEN]) -> Self {
        Self { key }
    }

    /// Parse 64 hex digits, as found in a `.env` file.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim().as_bytes();
        if hex.len() != PRIVATE_KEY_LEN * 2 {
            return None;
        }
        let mut key = [0u8; PRIVATE_KEY_LEN];
        for (out, pair) in key.iter_mut().zip(hex.chunks_exact(2)) {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            *out = (hi << 4 | lo) as u8;
        }
        Some(Self::new(key))
    }
}

impl KeyProvider for StaticKey {
    fn load(&mut self) -> Result<PrivateKey, AuthError> {
        Ok(Zeroizing::new(self.key))
    }
}

/// Read access to 16-bit one-time-programmable fuse rows.
pub trait OtpRows {
    fn read_row(&mut self, row: u16) -> u16;
}

pub const OTP_PRIVATE_KEY_ROW: u16 = 0x700;
pub const OTP_PUBLIC_KEY_ROW: u16 = 0x710;
pub const OTP_KEY_FLAG_ROW: u16 = 0x740;
pub const OTP_KEY_PROGRAMMED: u16 = 0xDC01;

/// Bytes reserved for the public key: every row up to the flag row.
pub const OTP_PUBLIC_KEY_AREA: usize = ((OTP_KEY_FLAG_ROW - OTP_PUBLIC_KEY_ROW) * 2) as usize;

/// Snapshot of the key fuses, served through the row layout below.
///
/// Parts whose fuses are not organised in rows read their key blocks into
/// this image once at boot.
pub struct OtpImage {
    private: PrivateKey,
    public: [u8; OTP_PUBLIC_KEY_AREA],
    flag: u16,
}

impl OtpImage {
    /// Unburnt fuses: all rows read zero.
    pub fn blank() -> Self {
        Self::new([0; PRIVATE_KEY_LEN], &[], 0)
    }

    /// `public` beyond [`OTP_PUBLIC_KEY_AREA`] bytes is ignored.
    pub fn new(private: [u8; PRIVATE_KEY_LEN], public: &[u8], flag: u16) -> Self {
        let mut area = [0u8; OTP_PUBLIC_KEY_AREA];
        let len = public.len().min(OTP_PUBLIC_KEY_AREA);
        area[..len].copy_from_slice(&public[..len]);
        Self {
            private: Zeroizing::new(private),
            public: area,
            flag,
        }
    }

    /// Fuses as the provisioning tool leaves them.
    pub fn programmed(private: [u8; PRIVATE_KEY_LEN], public: &[u8; PUBLIC_KEY_LEN]) -> Self {
        Self::new(private, public, OTP_KEY_PROGRAMMED)
    }
}

impl OtpRows for OtpImage {
    fn read_row(&mut self, row: u16) -> u16 {
        let (bytes, first): (&[u8], u16) = match row {
            OTP_PRIVATE_KEY_ROW..OTP_PUBLIC_KEY_ROW => {
                (self.private.as_slice(), OTP_PRIVATE_KEY_ROW)
            }
            OTP_PUBLIC_KEY_ROW..OTP_KEY_FLAG_ROW => (&self.public, OTP_PUBLIC_KEY_ROW),
            OTP_KEY_FLAG_ROW => return self.flag,
            _ => return 0,
        };
        let i = usize::from(row - first) * 2;
        match bytes.get(i..i + 2) {
            Some(&[hi, lo]) => u16::from_be_bytes([hi, lo]),
            _ => 0,
        }
    }
}

/// Keys programmed into OTP, two bytes per row, high byte first.
///
/// | Rows            | Content                         |
/// |-----------------|---------------------------------|
/// | `0x700..0x710`  | private key (32 bytes)          |
/// | `0x710..0x731`  | public key (65 bytes, last low byte unused) |
/// | `0x740`         | `0xDC01` once programmed        |
pub struct OtpKeyProvider<O> {
    otp: O,
}

impl<O: OtpRows> OtpKeyProvider<O> {
    pub fn new(otp: O) -> Self {
        Self { otp }
    }

    pub fn is_programmed(&mut self) -> bool {
        self.otp.read_row(OTP_KEY_FLAG_ROW) == OTP_KEY_PROGRAMMED
    }

    fn read_bytes(&mut self, first_row: u16, out: &mut [u8]) {
        for (i, pair) in out.chunks_mut(2).enumerate() {
            let [hi, lo] = self.otp.read_row(first_row + i as u16).to_be_bytes();
            pair[0] = hi;
            if let Some(second) = pair.get_mut(1) {
                *second = lo;
            }
        }
    }
}

impl<O: OtpRows> KeyProvider for OtpKeyProvider<O> {
    fn load(&mut self) -> Result<PrivateKey, AuthError> {
        if !self.is_programmed() {
            return Err(AuthError::KeyNotConfigured);
        }
        let mut key = Zeroizing::new([0u8; PRIVATE_KEY_LEN]);
        self.read_bytes(OTP_PRIVATE_KEY_ROW, key.as_mut_slice());
        Ok(key)
    }

    fn provisioned_public_key(&mut self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        if !self.is_programmed() {
            return None;
        }
        let mut public = [0u8; PUBLIC_KEY_LEN];
        self.read_bytes(OTP_PUBLIC_KEY_ROW, &mut public);
        Some(public)
    }
}
