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

//! Remote filesystem request and runtime settings.

use crate::acquire::ReadinessWait;
use crate::error::MountError;
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Length of a sha256 root hash, in hex characters.
const ROOT_HASH_HEX_LEN: usize = 64;

/// Identity of the workload, forwarded to the backing store and the key release.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct Identity {
    #[serde(default)]
    pub client_id: String,
}

/// Where the platform certificate chain is fetched from when it isn't in the environment.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CertCache {
    #[serde(default)]
    pub endpoint_type: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub tee_type: String,
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub client_id: String,
}

/// The key to be released by the attestation service.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyBlob {
    #[serde(default)]
    pub kid: String,
    #[serde(default)]
    pub kty: String,
    #[serde(default)]
    pub key_ops: Vec<String>,
    /// Opaque to us; handed to the key release as is.
    #[serde(default)]
    pub authority: serde_json::Value,
    #[serde(default)]
    pub akv: serde_json::Value,
}

/// Parameters for deriving a symmetric key from a released RSA key.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct KeyDerivation {
    /// Hex-encoded salt.
    #[serde(default)]
    pub salt: String,
    /// Defaults to "Symmetric Encryption Key" when empty.
    #[serde(default)]
    pub label: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct DmVerity {
    #[serde(default)]
    pub enable: bool,
    #[serde(default, rename = "hashurl")]
    pub hash_url: String,
    #[serde(default, rename = "roothash")]
    pub root_hash: String,
}

/// One remote filesystem to be mounted.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct FilesystemSpec {
    pub mount_point: PathBuf,
    pub url: String,
    #[serde(default)]
    pub url_private: bool,
    #[serde(default)]
    pub read_write: bool,
    #[serde(default)]
    pub key: KeyBlob,
    #[serde(default)]
    pub key_derivation: KeyDerivation,
    /// Hex-encoded key, only honoured when testing with raw keys is allowed.
    #[serde(default)]
    pub raw_key: String,
    #[serde(default)]
    pub dm_verity: DmVerity,
}

impl FilesystemSpec {
    /// Checks the request before anything is touched on disk.
    pub fn validate(&self) -> Result<(), MountError> {
        if self.read_write && self.dm_verity.enable {
            return Err(MountError::InvalidConfig(format!(
                "{:?} can't be both writable and dm-verity protected",
                self.mount_point
            )));
        }
        if !self.mount_point.is_absolute() || self.mount_point.parent().is_none() {
            return Err(MountError::InvalidConfig(format!(
                "mount point {:?} must be an absolute path below /",
                self.mount_point
            )));
        }
        if self.dm_verity.enable {
            if self.dm_verity.hash_url.is_empty() {
                return Err(MountError::InvalidConfig(format!(
                    "dm-verity is enabled for {:?} but no hash image is given",
                    self.mount_point
                )));
            }
            validate_root_hash(&self.dm_verity.root_hash)?;
        }
        Ok(())
    }
}

/// The root hash goes straight to veritysetup, so reject anything that isn't a sha256 digest.
pub fn validate_root_hash(root_hash: &str) -> Result<(), MountError> {
    if root_hash.len() != ROOT_HASH_HEX_LEN || !root_hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MountError::InvalidConfig(format!(
            "root hash must be {} hex characters, got {:?}",
            ROOT_HASH_HEX_LEN, root_hash
        )));
    }
    Ok(())
}

/// Everything needed to mount the remote filesystems of a sandbox.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RemoteFilesystemsInformation {
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub certcache: CertCache,
    #[serde(default)]
    pub filesystems: Vec<FilesystemSpec>,
}

impl RemoteFilesystemsInformation {
    /// Parses the base64-encoded JSON form handed over on the command line.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let json = STANDARD.decode(encoded.trim()).context("Failed to decode base64 request")?;
        serde_json::from_slice(&json).context("Failed to parse request")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        info!("loading request from {:?}...", path);
        let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
        serde_json::from_reader(file).with_context(|| format!("Failed to parse {:?}", path))
    }

    /// Validates every filesystem so that nothing is mounted when any of them is malformed.
    pub fn validate(&self) -> Result<()> {
        for (index, fs) in self.filesystems.iter().enumerate() {
            fs.validate().with_context(|| format!("filesystem {} is invalid", index))?;
        }
        Ok(())
    }
}

/// Knobs of the mount pipeline.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Root of the per-invocation working files (image folders, logs, key files).
    pub temp_dir: PathBuf,
    pub azmount_bin: PathBuf,
    pub veritysetup_bin: PathBuf,
    pub cryptsetup_bin: PathBuf,
    /// Cache block size of the backing store, in KiB.
    pub cache_block_size: u32,
    /// Number of cache blocks of the backing store.
    pub num_blocks: u32,
    pub readiness: ReadinessWait,
    /// Allows `raw_key` to stand in for the secure key release. Never set in production.
    pub allow_raw_key: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            temp_dir: PathBuf::from("/tmp/remotefs"),
            azmount_bin: PathBuf::from("/bin/azmount"),
            veritysetup_bin: PathBuf::from("veritysetup"),
            cryptsetup_bin: PathBuf::from("cryptsetup"),
            cache_block_size: 512,
            num_blocks: 32,
            readiness: ReadinessWait::default(),
            allow_raw_key: false,
        }
    }
}
