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

//! dm-verity layer. The data image is verified block by block against the hash image, whose
//! integrity is anchored by the trusted root hash.

use crate::config::Settings;
use crate::layout::FsLayout;
use crate::tool::{run_checked, CommandRunner, ToolCommand};
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Opens `remote-verity-<ordinal>` over `data_image` and `hash_image`, then records `root_hash`
/// next to the mount point. Returns the path of the verity device.
pub fn open_verity(
    runner: &dyn CommandRunner,
    settings: &Settings,
    layout: &FsLayout,
    data_image: &Path,
    hash_image: &Path,
    root_hash: &str,
) -> Result<PathBuf> {
    let name = layout.verity_name();
    let command = ToolCommand::new(&settings.veritysetup_bin)
        .arg("open")
        .arg(data_image)
        .arg(&name)
        .arg(hash_image)
        .arg(root_hash);
    run_checked(runner, &command).context("Failed to open dm-verity device")?;
    info!("Opened dm-verity device {}", name);

    let root_hash_file = layout.root_hash_file()?;
    store_root_hash(&root_hash_file, root_hash).context("Failed to store root hash")?;
    Ok(layout.verity_device())
}

/// Persists the root hash as plain text so that it can be checked again later.
pub fn store_root_hash(path: &Path, root_hash: &str) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create root hash file {:?}", path))?;
    file.write_all(root_hash.as_bytes())
        .with_context(|| format!("Failed to write root hash to {:?}", path))?;
    debug!("Stored root hash in {:?}", path);
    Ok(())
}
