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

//! Identity and attestation state shared by all filesystems of one invocation.

use crate::config::{CertCache, Identity};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

const SECURITY_POLICY_VAR: &str = "UVM_SECURITY_POLICY";
const REFERENCE_INFO_VAR: &str = "UVM_REFERENCE_INFO";
const HOST_CERTIFICATE_VAR: &str = "UVM_HOST_AMD_CERTIFICATE";

/// Platform certificates as served by the host certificate cache.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct PlatformCerts {
    #[serde(default, rename = "vcekCert")]
    pub vcek_cert: String,
    /// Hex-encoded TCB version the certificates were issued for.
    #[serde(default)]
    pub tcbm: String,
    #[serde(default, rename = "certificateChain")]
    pub certificate_chain: String,
    #[serde(default, rename = "cacheControl")]
    pub cache_control: String,
}

impl PlatformCerts {
    pub fn is_absent(&self) -> bool {
        self.vcek_cert.is_empty() && self.certificate_chain.is_empty()
    }
}

/// Encoded platform evidence handed to the sandbox by the host.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct UvmInformation {
    pub encoded_security_policy: String,
    pub encoded_uvm_reference_info: String,
    pub initial_certs: PlatformCerts,
}

impl UvmInformation {
    /// Reads the evidence through `lookup`, which maps a variable name to its value. Missing or
    /// malformed variables leave the corresponding field empty; the certificates are fetched later
    /// if they are absent.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name).unwrap_or_else(|| {
                warn!("{} is not set", name);
                String::new()
            })
        };
        let encoded_certs = var(HOST_CERTIFICATE_VAR);
        let initial_certs = if encoded_certs.is_empty() {
            PlatformCerts::default()
        } else {
            decode_certs(&encoded_certs).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {:?}", HOST_CERTIFICATE_VAR, e);
                PlatformCerts::default()
            })
        };
        UvmInformation {
            encoded_security_policy: var(SECURITY_POLICY_VAR),
            encoded_uvm_reference_info: var(REFERENCE_INFO_VAR),
            initial_certs,
        }
    }

    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }
}

fn decode_certs(encoded: &str) -> Result<PlatformCerts> {
    let json = STANDARD.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&json)?)
}

/// Retrieves the platform certificates when the host didn't provide them.
pub trait CertFetcher {
    fn fetch_certs(&self, cache: &CertCache) -> Result<PlatformCerts>;
}

/// What the key release needs to validate the attestation report against the chip's
/// certificate chain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CertState {
    pub cert_cache: CertCache,
    pub tcbm: u64,
}

/// Process-wide state, built once before any filesystem is touched and read-only afterwards.
#[derive(Clone, Debug)]
pub struct MountContext {
    identity: Identity,
    cert_state: CertState,
    uvm_information: UvmInformation,
}

impl MountContext {
    /// Completes the platform evidence and builds the context. Any failure here means no
    /// filesystem can be trusted, so callers must not go on.
    pub fn initialize(
        identity: Identity,
        cert_cache: CertCache,
        mut uvm_information: UvmInformation,
        fetcher: &dyn CertFetcher,
    ) -> Result<Self> {
        if uvm_information.initial_certs.is_absent() {
            info!("Platform certificates are absent, retrieving them from {}", cert_cache.endpoint);
            uvm_information.initial_certs = fetcher
                .fetch_certs(&cert_cache)
                .with_context(|| format!("Failed to retrieve certs from {}", cert_cache.endpoint))?;
        }

        let tcbm = &uvm_information.initial_certs.tcbm;
        debug!("Platform TCBM: {}", tcbm);
        let tcbm = u64::from_str_radix(tcbm.trim(), 16)
            .with_context(|| format!("Failed to parse TCBM {:?}", tcbm))?;

        Ok(MountContext {
            identity,
            cert_state: CertState { cert_cache, tcbm },
            uvm_information,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn cert_state(&self) -> &CertState {
        &self.cert_state
    }

    pub fn uvm_information(&self) -> &UvmInformation {
        &self.uvm_information
    }
}
