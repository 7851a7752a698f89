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

//! Acquisition of remote images. The backing store is a separate, long-lived process that exposes
//! a remote blob as a local virtual block file; it owns caching and network retries. All we see
//! of it is whether the file exists yet.

use crate::config::{Identity, Settings};
use crate::error::MountError;
use crate::layout::{FsLayout, ImageKind};
use crate::tool::{CommandRunner, ToolCommand};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, info};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(60);
// 1000 polls of 60ms: the image has a minute to show up.
const MAX_POLLS: u32 = 1000;

/// Source of sleeps for the readiness wait.
pub trait Clock {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Lets another thread abandon a [`ReadinessWait`].
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Polls for a condition at a fixed interval, at most `max_polls` times.
#[derive(Clone, Debug)]
pub struct ReadinessWait {
    interval: Duration,
    max_polls: u32,
    cancel: Option<CancelToken>,
}

impl Default for ReadinessWait {
    fn default() -> Self {
        ReadinessWait::new(POLL_INTERVAL, MAX_POLLS)
    }
}

impl ReadinessWait {
    pub fn new(interval: Duration, max_polls: u32) -> Self {
        ReadinessWait { interval, max_polls, cancel: None }
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The longest time a wait can take.
    pub fn bound(&self) -> Duration {
        self.interval * self.max_polls
    }

    /// Returns as soon as `ready` holds. Fails with [`MountError::AcquisitionTimeout`] once
    /// `max_polls` intervals have passed without it holding. `path` names what is waited for.
    pub fn wait_for<F>(
        &self,
        clock: &dyn Clock,
        path: &Path,
        mut ready: F,
    ) -> Result<(), MountError>
    where
        F: FnMut() -> bool,
    {
        if ready() {
            return Ok(());
        }
        for _ in 0..self.max_polls {
            if self.cancel.as_ref().map_or(false, CancelToken::is_cancelled) {
                return Err(MountError::Cancelled(path.to_path_buf()));
            }
            clock.sleep(self.interval);
            if ready() {
                return Ok(());
            }
        }
        Err(MountError::AcquisitionTimeout { path: path.to_path_buf(), waited: self.bound() })
    }
}

/// A remote image and how the backing store should serve it.
#[derive(Clone, Copy, Debug)]
pub struct ImageSource<'a> {
    pub kind: ImageKind,
    pub url: &'a str,
    pub private: bool,
    pub read_write: bool,
}

/// Starts the backing store for `source` and leaves it running in the background. Returns the
/// path at which the image will appear.
pub fn start_backing_store(
    runner: &dyn CommandRunner,
    settings: &Settings,
    identity: &Identity,
    layout: &FsLayout,
    source: &ImageSource,
) -> Result<PathBuf> {
    let image_dir = layout.image_dir(source.kind);
    create_dir_all(&image_dir).with_context(|| format!("mkdir failed: {:?}", image_dir))?;

    let identity = serde_json::to_vec(identity).context("Failed to marshal identity")?;
    let log_file = layout.backing_store_log(source.kind);
    debug!("{} log goes to {:?}", settings.azmount_bin.display(), log_file);

    let command = ToolCommand::new(&settings.azmount_bin)
        .arg("-mountpoint")
        .arg(&image_dir)
        .arg("-url")
        .arg(source.url)
        .arg("-private")
        .arg(source.private.to_string())
        .arg("-identity")
        .arg(STANDARD.encode(identity))
        .arg("-logfile")
        .arg(&log_file)
        .arg("-blocksize")
        .arg(settings.cache_block_size.to_string())
        .arg("-numblocks")
        .arg(settings.num_blocks.to_string())
        .arg("-readWrite")
        .arg(source.read_write.to_string());
    runner.spawn(&command).context("Failed to start the backing store")?;
    Ok(layout.image_file(source.kind))
}

/// Exposes the remote image locally and waits until it is there.
pub fn acquire_image(
    runner: &dyn CommandRunner,
    clock: &dyn Clock,
    settings: &Settings,
    identity: &Identity,
    layout: &FsLayout,
    source: &ImageSource,
) -> Result<PathBuf> {
    info!("Acquiring remote image {}", source.url);
    let image = start_backing_store(runner, settings, identity, layout, source)?;
    settings.readiness.wait_for(clock, &image, || image.exists())?;
    debug!("Image found: {:?}", image);
    Ok(image)
}
