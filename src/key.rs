// Copyright 2024, The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Resolution of the symmetric key that unlocks a filesystem.
//!
//! In production the key is released by the attestation service only after this sandbox proved it
//! runs trusted code. The released key is either the 32-byte symmetric key itself or an RSA key
//! from whose private exponent the symmetric key is derived with HKDF-SHA256. For testing, a raw
//! hex key can be used instead, but only when explicitly allowed.
//!
//! dm-crypt reads the key from a file. [`KeyFile`] owns that file and removes it when dropped.

use crate::config::{FilesystemSpec, KeyBlob, KeyDerivation, Settings};
use crate::context::MountContext;
use crate::error::KeyError;
use anyhow::{Context, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use log::{debug, info, warn};
use ring::hkdf::{self, Salt, HKDF_SHA256};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{remove_file, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Size of the symmetric key given to dm-crypt.
pub const KEY_SIZE: usize = 32;

const DEFAULT_LABEL: &str = "Symmetric Encryption Key";

// JWK members are base64url; be lenient about padding.
const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    NO_PAD.with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub type SymmetricKey = Zeroizing<[u8; KEY_SIZE]>;

/// A key in JSON Web Key form, as returned by the secure key release.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct Jwk {
    pub kty: String,
    /// Octet keys: the key value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k: Option<Zeroizing<String>>,
    /// RSA keys: the private exponent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<Zeroizing<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

// Never print key material.
impl fmt::Debug for Jwk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Jwk").field("kty", &self.kty).finish_non_exhaustive()
    }
}

/// Performs secure key release against the attestation service.
pub trait KeyReleaser {
    fn release(&self, ctx: &MountContext, key: &KeyBlob) -> Result<Jwk>;
}

/// A released key.
pub enum ReleasedKey {
    Octet(SymmetricKey),
    Rsa { private_exponent: Zeroizing<Vec<u8>> },
}

impl TryFrom<&Jwk> for ReleasedKey {
    type Error = KeyError;

    fn try_from(jwk: &Jwk) -> Result<Self, KeyError> {
        match jwk.kty.as_str() {
            "oct" => {
                let k = jwk.k.as_deref().ok_or_else(|| KeyError::InvalidOctetKey("no k".into()))?;
                let bytes = Zeroizing::new(
                    BASE64_URL.decode(k).map_err(|e| KeyError::InvalidOctetKey(e.to_string()))?,
                );
                if bytes.len() != KEY_SIZE {
                    return Err(KeyError::InvalidOctetKey(format!("got {} bytes", bytes.len())));
                }
                let mut key = Zeroizing::new([0u8; KEY_SIZE]);
                key.copy_from_slice(&bytes);
                Ok(ReleasedKey::Octet(key))
            }
            "RSA" => {
                let d = jwk
                    .d
                    .as_deref()
                    .ok_or_else(|| KeyError::MissingPrivateExponent("no d".into()))?;
                let mut exponent = Zeroizing::new(
                    BASE64_URL
                        .decode(d)
                        .map_err(|e| KeyError::MissingPrivateExponent(e.to_string()))?,
                );
                // The exponent is used as a big-endian integer without leading zeros.
                let leading = exponent.iter().take_while(|b| **b == 0).count();
                exponent.drain(..leading);
                if exponent.is_empty() {
                    return Err(KeyError::MissingPrivateExponent("d is zero".into()));
                }
                Ok(ReleasedKey::Rsa { private_exponent: exponent })
            }
            other => Err(KeyError::UnsupportedKeyType(other.to_owned())),
        }
    }
}

impl ReleasedKey {
    /// The key to hand to dm-crypt: octet keys as they are, RSA keys through HKDF.
    pub fn into_symmetric_key(self, derivation: &KeyDerivation) -> Result<SymmetricKey, KeyError> {
        match self {
            ReleasedKey::Octet(key) => Ok(key),
            ReleasedKey::Rsa { private_exponent } => {
                derive_symmetric_key(&private_exponent, &derivation.salt, &derivation.label)
            }
        }
    }
}

struct KeyLen(usize);

impl hkdf::KeyType for KeyLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derives a symmetric key with HKDF-SHA256 from `secret`, keyed by the hex-encoded `salt_hex`
/// and labelled with `label` (or "Symmetric Encryption Key" when it is empty).
pub fn derive_symmetric_key(
    secret: &[u8],
    salt_hex: &str,
    label: &str,
) -> Result<SymmetricKey, KeyError> {
    let salt = hex::decode(salt_hex).map_err(|e| KeyError::MalformedSalt(e.to_string()))?;
    let label = if label.is_empty() { DEFAULT_LABEL } else { label };
    debug!("Key derivation label: {}", label);

    let prk = Salt::new(HKDF_SHA256, &salt).extract(secret);
    let info = [label.as_bytes()];
    let okm = prk.expand(&info, KeyLen(KEY_SIZE)).map_err(|_| KeyError::Derivation)?;
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    okm.fill(&mut key[..]).map_err(|_| KeyError::Derivation)?;
    Ok(key)
}

/// Decodes a raw test key, which must be exactly 32 bytes.
pub fn decode_raw_key(raw_key_hex: &str) -> Result<SymmetricKey, KeyError> {
    let bytes = Zeroizing::new(
        hex::decode(raw_key_hex.trim()).map_err(|e| KeyError::MalformedRawKey(e.to_string()))?,
    );
    if bytes.len() != KEY_SIZE {
        return Err(KeyError::RawKeyLength(bytes.len()));
    }
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// Obtains the key of `fs`, through secure key release when a key id is given, otherwise from the
/// raw test key when that is allowed.
pub fn resolve_key(
    ctx: &MountContext,
    releaser: &dyn KeyReleaser,
    settings: &Settings,
    fs: &FilesystemSpec,
) -> Result<SymmetricKey, KeyError> {
    if !fs.key.kid.is_empty() {
        info!("Performing secure key release of {}", fs.key.kid);
        let jwk = releaser
            .release(ctx, &fs.key)
            .map_err(|e| KeyError::Release(format!("{}: {:#}", fs.key.kid, e)))?;
        debug!("Key type: {}", jwk.kty);
        return ReleasedKey::try_from(&jwk)?.into_symmetric_key(&fs.key_derivation);
    }
    if fs.raw_key.is_empty() {
        return Err(KeyError::NoKeySource);
    }
    if !settings.allow_raw_key {
        return Err(KeyError::RawKeyNotAllowed);
    }
    warn!("Using a raw key for {:?}; this is only meant for testing", fs.mount_point);
    decode_raw_key(&fs.raw_key)
}

/// A key file that exists only as long as this value does.
#[derive(Debug)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    /// Writes `key` to a new file at `path`. Fails if the file already exists.
    pub fn create(path: &Path, key: &[u8]) -> Result<KeyFile> {
        debug!("Creating keyfile: {:?}", path);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .with_context(|| format!("Failed to create keyfile {:?}", path))?;
        // From here on the file is removed whatever happens.
        let key_file = KeyFile { path: path.to_path_buf() };
        file.write_all(key).with_context(|| format!("Failed to write keyfile {:?}", path))?;
        file.sync_all()?;
        Ok(key_file)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for KeyFile {
    fn drop(&mut self) {
        match remove_file(&self.path) {
            Ok(()) => debug!("Deleted keyfile: {:?}", self.path),
            Err(e) => warn!("Failed to delete keyfile {:?}: {}", self.path, e),
        }
    }
}
