#![warn(rust_2018_idioms)]
#![allow(dead_code)]

pub mod context;
pub mod kdf;
pub mod replay;

pub use context::SrtpContext;

use shared::error::{Error, Result};

/// AES-CM-128 session/master key length.
pub const AES_128_KEY_LEN: usize = 16;
/// Session/master salt length.
pub const SALT_LEN: usize = 14;
/// Combined key + salt, the per-direction unit DTLS exports.
pub const KEY_WITH_SALT_LEN: usize = AES_128_KEY_LEN + SALT_LEN;
/// HMAC-SHA1-80 truncated tag length.
pub const AUTH_TAG_LEN: usize = 10;
/// HMAC-SHA1 session auth key length.
pub const AUTH_KEY_LEN: usize = 20;
/// Anti-replay window width in packets.
pub const REPLAY_WINDOW_SIZE: u64 = 1024;

/// Total keying material exported from DTLS with the
/// `EXTRACTOR-dtls_srtp` label.
pub const KEYING_MATERIAL_LEN: usize = 2 * KEY_WITH_SALT_LEN;

/// One direction's master key and salt.
#[derive(Clone)]
pub struct MasterKey {
    pub key: [u8; AES_128_KEY_LEN],
    pub salt: [u8; SALT_LEN],
}

impl MasterKey {
    /// The flat `key || salt` layout used by SRTP policies.
    pub fn to_key_with_salt(&self) -> [u8; KEY_WITH_SALT_LEN] {
        let mut out = [0u8; KEY_WITH_SALT_LEN];
        out[..AES_128_KEY_LEN].copy_from_slice(&self.key);
        out[AES_128_KEY_LEN..].copy_from_slice(&self.salt);
        out
    }
}

/// Client and server write keys split out of the DTLS export.
#[derive(Clone)]
pub struct SrtpKeyingMaterial {
    pub client_write: MasterKey,
    pub server_write: MasterKey,
}

/// Splits exported keying material laid out as
/// `client_key | server_key | client_salt | server_salt`.
pub fn partition_keying_material(material: &[u8]) -> Result<SrtpKeyingMaterial> {
    if material.len() != KEYING_MATERIAL_LEN {
        return Err(Error::KeyingMaterialExport(format!(
            "expected {KEYING_MATERIAL_LEN} bytes, got {}",
            material.len()
        )));
    }
    let mut client_write = MasterKey {
        key: [0; AES_128_KEY_LEN],
        salt: [0; SALT_LEN],
    };
    let mut server_write = client_write.clone();

    let mut offset = 0;
    client_write
        .key
        .copy_from_slice(&material[offset..offset + AES_128_KEY_LEN]);
    offset += AES_128_KEY_LEN;
    server_write
        .key
        .copy_from_slice(&material[offset..offset + AES_128_KEY_LEN]);
    offset += AES_128_KEY_LEN;
    client_write
        .salt
        .copy_from_slice(&material[offset..offset + SALT_LEN]);
    offset += SALT_LEN;
    server_write
        .salt
        .copy_from_slice(&material[offset..offset + SALT_LEN]);

    Ok(SrtpKeyingMaterial {
        client_write,
        server_write,
    })
}
