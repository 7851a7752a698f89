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

//! Errors raised while mounting remote filesystems.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// A failure of one phase of the mount pipeline.
#[derive(Debug, Error)]
pub enum MountError {
    /// The request asks for something that can't be done safely.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// The backing store never exposed the image file.
    #[error("Timed out after {waited:?} waiting for {path:?}")]
    AcquisitionTimeout {
        /// The file that never appeared.
        path: PathBuf,
        /// How long we waited for it.
        waited: Duration,
    },
    /// Somebody cancelled a wait before the image showed up.
    #[error("Cancelled while waiting for {0:?}")]
    Cancelled(PathBuf),
    /// An external tool exited with an error.
    #[error("{tool} exited with {status}: {output}")]
    ToolFailed {
        /// Name of the tool, as it was invoked.
        tool: String,
        /// Exit status of the tool.
        status: ExitStatus,
        /// Combined stdout and stderr of the tool.
        output: String,
    },
    /// The key to unlock the filesystem couldn't be obtained.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// The opened device couldn't be made visible at the mount point.
    #[error("Failed to publish {0}")]
    Publish(String),
}

/// Failures of key release, derivation or decoding.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum KeyError {
    /// The released key is neither an octet nor an RSA key.
    #[error("Key type {0} not supported")]
    UnsupportedKeyType(String),
    /// The octet key is not exactly 32 bytes or can't be decoded.
    #[error("Expected 32-byte octet key: {0}")]
    InvalidOctetKey(String),
    /// The RSA key doesn't carry its private exponent.
    #[error("RSA key has no usable private exponent: {0}")]
    MissingPrivateExponent(String),
    /// The key derivation salt is not a hex string.
    #[error("Failed to decode key derivation salt: {0}")]
    MalformedSalt(String),
    /// The raw test key is not a hex string.
    #[error("Failed to decode raw key: {0}")]
    MalformedRawKey(String),
    /// The raw test key decodes to the wrong number of bytes.
    #[error("Raw key must be 32 bytes, got {0}")]
    RawKeyLength(usize),
    /// A raw test key was given while testing with raw keys is disabled.
    #[error("Raw keys are not allowed outside of testing")]
    RawKeyNotAllowed,
    /// Neither a key to release nor a usable raw key was given.
    #[error("No key source configured")]
    NoKeySource,
    /// HKDF refused to produce key material.
    #[error("Failed to derive symmetric key")]
    Derivation,
    /// The secure key release was rejected.
    #[error("Secure key release failed: {0}")]
    Release(String),
}
