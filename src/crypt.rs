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

//! dm-crypt layer. Always sits on top of dm-verity when both are used.

use crate::config::Settings;
use crate::key::KeyFile;
use crate::layout::FsLayout;
use crate::tool::{run_checked, CommandRunner, ToolCommand};
use anyhow::{Context, Result};
use log::{debug, info};
use std::path::{Path, PathBuf};

/// The device dm-crypt reads from: the verity device if there is one, the raw image otherwise.
pub fn encryption_source<'a>(image: &'a Path, verity_device: Option<&'a Path>) -> &'a Path {
    verity_device.unwrap_or(image)
}

/// Opens the LUKS container at `source` as `remote-crypt-<ordinal>`. Returns the path of the
/// decrypted device.
pub fn open_crypt(
    runner: &dyn CommandRunner,
    settings: &Settings,
    layout: &FsLayout,
    source: &Path,
    key_file: &KeyFile,
) -> Result<PathBuf> {
    let name = layout.crypt_name();
    debug!("Opening {:?} as {}", source, name);
    // --debug and -v, otherwise cryptsetup says next to nothing when it fails.
    let command = ToolCommand::new(&settings.cryptsetup_bin)
        .args(["--debug", "-v"])
        .arg("luksOpen")
        .arg(source)
        .arg(&name)
        .arg("--key-file")
        .arg(key_file.path())
        // No journal for the integrity metadata, for performance.
        .arg("--integrity-no-journal")
        .arg("--persistent");
    run_checked(runner, &command).with_context(|| format!("luksOpen failed: {}", name))?;
    info!("Opened dm-crypt device {}", name);
    Ok(layout.crypt_device())
}
