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

//! Mounts remote filesystem images inside a confidential sandbox.
//!
//! Each image is exposed locally by a backing-store process, optionally verified with dm-verity,
//! decrypted with dm-crypt using a key released only to attested code, and finally mounted and
//! published at its requested mount point.

pub mod acquire;
pub mod attest;
pub mod config;
pub mod context;
pub mod crypt;
pub mod error;
pub mod key;
pub mod layout;
pub mod mount;
pub mod pipeline;
pub mod tool;
pub mod verity;

pub use config::{FilesystemSpec, RemoteFilesystemsInformation, Settings};
pub use context::MountContext;
pub use error::{KeyError, MountError};
pub use pipeline::Pipeline;
