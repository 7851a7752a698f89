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

//! Makes the decrypted device visible to the workload. The device is mounted on a private folder
//! next to the requested mount point, which then becomes a symlink to that folder. Consumers of
//! the mount point never observe a half-mounted filesystem.

use crate::error::MountError;
use crate::layout::FsLayout;
use anyhow::{Context, Result};
use log::info;
use nix::mount::{mount, MsFlags};
use std::fs::DirBuilder;
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};

const FS_TYPE: &str = "ext4";

/// A single mount(2) call.
#[derive(Clone, Debug, PartialEq)]
pub struct MountRequest {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fs_type: &'static str,
    pub flags: MsFlags,
    pub data: Option<&'static str>,
}

impl MountRequest {
    /// Read-only filesystems are mounted without replaying the journal, since nothing may be
    /// written to the device.
    pub fn for_filesystem(source: &Path, target: &Path, read_write: bool) -> Self {
        let (flags, data) = if read_write {
            (MsFlags::empty(), None)
        } else {
            (MsFlags::MS_RDONLY, Some("noload"))
        };
        MountRequest {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fs_type: FS_TYPE,
            flags,
            data,
        }
    }
}

pub trait Mounter {
    fn mount(&self, request: &MountRequest) -> Result<()>;
}

/// Mounts through the kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, request: &MountRequest) -> Result<()> {
        mount(
            Some(request.source.as_path()),
            request.target.as_path(),
            Some(request.fs_type),
            request.flags,
            request.data,
        )
        .with_context(|| format!("mount failed: {:?}", request))
    }
}

/// Mounts `device` and points the mount point of `layout` at it. Returns the mount folder.
pub fn publish(
    mounter: &dyn Mounter,
    layout: &FsLayout,
    device: &Path,
    read_write: bool,
) -> Result<PathBuf, MountError> {
    let folder = layout.mount_folder().map_err(|e| MountError::Publish(format!("{:#}", e)))?;
    DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(&folder)
        .map_err(|e| MountError::Publish(format!("mkdir {:?}: {}", folder, e)))?;

    let request = MountRequest::for_filesystem(device, &folder, read_write);
    mounter
        .mount(&request)
        .map_err(|e| MountError::Publish(format!("{:?} on {:?}: {:#}", device, folder, e)))?;
    info!("Mounted {:?} on {:?} (read_write: {})", device, folder, read_write);

    // Relative target, so the link stays valid if the parent is bind-mounted elsewhere.
    symlink(layout.mount_folder_name(), layout.mount_point()).map_err(|e| {
        MountError::Publish(format!("symlink {:?} -> {:?}: {}", layout.mount_point(), folder, e))
    })?;
    info!("{:?} is ready", layout.mount_point());
    Ok(folder)
}
