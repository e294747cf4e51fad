//! AES-CM key derivation (RFC 3711 §4.3).

use aes::cipher::{KeyIvInit, StreamCipher};

use crate::{AES_128_KEY_LEN, SALT_LEN};

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// Key-derivation labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KdfLabel {
    RtpEncryption = 0x00,
    RtpAuthentication = 0x01,
    RtpSalt = 0x02,
    RtcpEncryption = 0x03,
    RtcpAuthentication = 0x04,
    RtcpSalt = 0x05,
}

/// Derives `out.len()` bytes of session keying material.
///
/// With the default key-derivation rate of zero the derivation input is
/// `(label << 48) XOR master_salt`, shifted into the upper bits of the
/// counter block.
pub fn derive(
    master_key: &[u8; AES_128_KEY_LEN],
    master_salt: &[u8; SALT_LEN],
    label: KdfLabel,
    out: &mut [u8],
) {
    let mut iv = [0u8; 16];
    iv[..SALT_LEN].copy_from_slice(master_salt);
    // key_id = label || r, r = 0: the label lands 48 bits up from the salt's
    // least significant byte.
    iv[SALT_LEN - 7] ^= label as u8;

    out.fill(0);
    let mut cipher = Aes128Ctr::new(master_key.into(), &iv.into());
    cipher.apply_keystream(out);
}
