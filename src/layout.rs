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

//! Names and paths of everything a filesystem creates. All of them are derived from the ordinal
//! of the filesystem in the request, so two filesystems of one invocation never collide.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const MAPPER_DEV_ROOT: &str = "/dev/mapper";

/// Which remote image of a filesystem a backing store serves.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ImageKind {
    Data,
    Hash,
}

impl ImageKind {
    fn dir_name(&self) -> &str {
        match *self {
            ImageKind::Data => "data",
            ImageKind::Hash => "hash",
        }
    }
}

/// Paths and device names of the filesystem at `ordinal`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FsLayout {
    ordinal: usize,
    temp_dir: PathBuf,
    mount_point: PathBuf,
}

impl FsLayout {
    pub fn new(temp_dir: &Path, ordinal: usize, mount_point: &Path) -> Self {
        FsLayout {
            ordinal,
            temp_dir: temp_dir.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        }
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Folder the backing store exposes the image in.
    pub fn image_dir(&self, kind: ImageKind) -> PathBuf {
        self.temp_dir.join(kind.dir_name()).join(self.ordinal.to_string())
    }

    /// The virtual block file exposed by the backing store.
    pub fn image_file(&self, kind: ImageKind) -> PathBuf {
        self.image_dir(kind).join("data")
    }

    pub fn backing_store_log(&self, kind: ImageKind) -> PathBuf {
        self.temp_dir.join(kind.dir_name()).join(format!("log-{}.txt", self.ordinal))
    }

    pub fn key_file(&self) -> PathBuf {
        self.temp_dir.join(format!("keyfile-{}", self.ordinal))
    }

    pub fn verity_name(&self) -> String {
        format!("remote-verity-{}", self.ordinal)
    }

    pub fn crypt_name(&self) -> String {
        format!("remote-crypt-{}", self.ordinal)
    }

    pub fn verity_device(&self) -> PathBuf {
        Path::new(MAPPER_DEV_ROOT).join(self.verity_name())
    }

    pub fn crypt_device(&self) -> PathBuf {
        Path::new(MAPPER_DEV_ROOT).join(self.crypt_name())
    }

    /// Name of the private mount folder, relative to the parent of the mount point. The
    /// published symlink points here.
    pub fn mount_folder_name(&self) -> String {
        format!(".filesystem-{}", self.ordinal)
    }

    /// The private folder the device is actually mounted on.
    pub fn mount_folder(&self) -> Result<PathBuf> {
        Ok(self.mount_point_parent()?.join(self.mount_folder_name()))
    }

    /// Where the trusted root hash is kept for later re-verification.
    pub fn root_hash_file(&self) -> Result<PathBuf> {
        Ok(self.mount_point_parent()?.join(format!(".dm-verity-root-hash-{}", self.ordinal)))
    }

    fn mount_point_parent(&self) -> Result<&Path> {
        self.mount_point
            .parent()
            .with_context(|| format!("Mount point {:?} has no parent", self.mount_point))
    }
}
