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

//! Drives each requested filesystem through acquisition, dm-verity, key resolution, dm-crypt and
//! publication, in that order. Filesystems are handled one at a time; the first failure stops the
//! run and nothing already mounted is undone.

use crate::acquire::{acquire_image, Clock, ImageSource};
use crate::config::{FilesystemSpec, RemoteFilesystemsInformation, Settings};
use crate::context::MountContext;
use crate::crypt::{encryption_source, open_crypt};
use crate::error::MountError;
use crate::key::{resolve_key, KeyFile, KeyReleaser};
use crate::layout::{FsLayout, ImageKind};
use crate::mount::{publish, Mounter};
use crate::tool::CommandRunner;
use crate::verity::open_verity;
use anyhow::{Context, Result};
use log::info;
use std::path::PathBuf;

/// The collaborators of a mount run.
pub struct Pipeline<'a> {
    runner: &'a dyn CommandRunner,
    clock: &'a dyn Clock,
    mounter: &'a dyn Mounter,
    releaser: &'a dyn KeyReleaser,
    settings: &'a Settings,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        clock: &'a dyn Clock,
        mounter: &'a dyn Mounter,
        releaser: &'a dyn KeyReleaser,
        settings: &'a Settings,
    ) -> Self {
        Pipeline { runner, clock, mounter, releaser, settings }
    }

    /// Mounts every filesystem of `info`. Nothing is started unless all of them are valid.
    pub fn mount_all(&self, ctx: &MountContext, info: &RemoteFilesystemsInformation) -> Result<()> {
        info.validate()?;
        for (ordinal, fs) in info.filesystems.iter().enumerate() {
            self.mount_filesystem(ctx, ordinal, fs)
                .with_context(|| format!("failed to mount filesystem index {}", ordinal))?;
        }
        info!("Mounted {} remote filesystem(s)", info.filesystems.len());
        Ok(())
    }

    /// Mounts one filesystem and returns the folder it is mounted on.
    pub fn mount_filesystem(
        &self,
        ctx: &MountContext,
        ordinal: usize,
        fs: &FilesystemSpec,
    ) -> Result<PathBuf> {
        fs.validate()?;
        let layout = FsLayout::new(&self.settings.temp_dir, ordinal, &fs.mount_point);
        info!("Mounting {} at {:?}", fs.url, fs.mount_point);

        let data_image = self
            .acquire(ctx, &layout, ImageKind::Data, &fs.url, fs)
            .context("failed to acquire data image")?;

        let verity_device = if fs.dm_verity.enable {
            let hash_image = self
                .acquire(ctx, &layout, ImageKind::Hash, &fs.dm_verity.hash_url, fs)
                .context("failed to acquire hash image")?;
            let device = open_verity(
                self.runner,
                self.settings,
                &layout,
                &data_image,
                &hash_image,
                &fs.dm_verity.root_hash,
            )
            .context("failed to enable dm-verity")?;
            Some(device)
        } else {
            None
        };

        let crypt_device = {
            let key = resolve_key(ctx, self.releaser, self.settings, fs)
                .map_err(MountError::from)
                .context("failed to obtain key")?;
            let key_file = KeyFile::create(&layout.key_file(), &key[..])
                .context("failed to create key file")?;
            let source = encryption_source(&data_image, verity_device.as_deref());
            open_crypt(self.runner, self.settings, &layout, source, &key_file)
                .context("failed to open dm-crypt device")?
            // key_file is removed here, whether or not luksOpen succeeded.
        };

        let folder = publish(self.mounter, &layout, &crypt_device, fs.read_write)
            .context("failed to mount filesystem")?;
        Ok(folder)
    }

    fn acquire(
        &self,
        ctx: &MountContext,
        layout: &FsLayout,
        kind: ImageKind,
        url: &str,
        fs: &FilesystemSpec,
    ) -> Result<PathBuf> {
        let source = ImageSource { kind, url, private: fs.url_private, read_write: fs.read_write };
        acquire_image(self.runner, self.clock, self.settings, ctx.identity(), layout, &source)
    }
}
