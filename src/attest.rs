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

//! Secure key release and certificate retrieval through an external attestation helper.
//!
//! The helper owns the attestation protocol. We hand it our evidence and read back JSON:
//!
//! ```text
//! <helper> release --kid <kid> --authority <json> --akv <json> --identity <b64> --evidence <b64>
//! <helper> certs --endpoint <url> --endpoint-type <type> --tee-type <type> --api-version <v>
//!     --client-id <id>
//! ```

use crate::config::{CertCache, KeyBlob};
use crate::context::{CertFetcher, MountContext, PlatformCerts};
use crate::key::{Jwk, KeyReleaser};
use crate::tool::{run_for_stdout, CommandRunner, ToolCommand};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::debug;
use serde_json::json;
use std::path::{Path, PathBuf};

pub const DEFAULT_HELPER: &str = "/bin/skr";

/// Releases keys by running the helper's `release` subcommand.
pub struct HelperKeyReleaser<'a> {
    runner: &'a dyn CommandRunner,
    helper: PathBuf,
}

impl<'a> HelperKeyReleaser<'a> {
    pub fn new(runner: &'a dyn CommandRunner, helper: &Path) -> Self {
        HelperKeyReleaser { runner, helper: helper.to_path_buf() }
    }
}

impl KeyReleaser for HelperKeyReleaser<'_> {
    fn release(&self, ctx: &MountContext, key: &KeyBlob) -> Result<Jwk> {
        let identity = serde_json::to_vec(ctx.identity()).context("Failed to marshal identity")?;
        let evidence = json!({
            "uvm_information": ctx.uvm_information(),
            "tcbm": ctx.cert_state().tcbm,
            "cert_cache": ctx.cert_state().cert_cache,
        });
        let command = ToolCommand::new(&self.helper)
            .arg("release")
            .arg("--kid")
            .arg(&key.kid)
            .arg("--authority")
            .arg(key.authority.to_string())
            .arg("--akv")
            .arg(key.akv.to_string())
            .arg("--identity")
            .arg(STANDARD.encode(identity))
            .arg("--evidence")
            .arg(STANDARD.encode(evidence.to_string()));
        debug!("Requesting release of {}", key.kid);
        let output = run_for_stdout(self.runner, &command)?;
        serde_json::from_str(&output).context("Helper returned a malformed key")
    }
}

/// Fetches platform certificates by running the helper's `certs` subcommand.
pub struct HelperCertFetcher<'a> {
    runner: &'a dyn CommandRunner,
    helper: PathBuf,
}

impl<'a> HelperCertFetcher<'a> {
    pub fn new(runner: &'a dyn CommandRunner, helper: &Path) -> Self {
        HelperCertFetcher { runner, helper: helper.to_path_buf() }
    }
}

impl CertFetcher for HelperCertFetcher<'_> {
    fn fetch_certs(&self, cache: &CertCache) -> Result<PlatformCerts> {
        let command = ToolCommand::new(&self.helper)
            .arg("certs")
            .arg("--endpoint")
            .arg(&cache.endpoint)
            .arg("--endpoint-type")
            .arg(&cache.endpoint_type)
            .arg("--tee-type")
            .arg(&cache.tee_type)
            .arg("--api-version")
            .arg(&cache.api_version)
            .arg("--client-id")
            .arg(&cache.client_id);
        let output = run_for_stdout(self.runner, &command)?;
        serde_json::from_str(&output).context("Helper returned malformed certificates")
    }
}
