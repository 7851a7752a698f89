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

//! Drives the whole mount pipeline against fake tools, a fake kernel and a fake key release.

use anyhow::{bail, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use nix::mount::MsFlags;
use remotefs::acquire::{Clock, ReadinessWait};
use remotefs::config::{CertCache, DmVerity, Identity, KeyBlob};
use remotefs::context::{CertFetcher, PlatformCerts, UvmInformation};
use remotefs::key::{Jwk, KeyReleaser};
use remotefs::mount::{MountRequest, Mounter};
use remotefs::tool::{CommandRunner, ToolCommand};
use remotefs::{
    FilesystemSpec, KeyError, MountContext, MountError, Pipeline, RemoteFilesystemsInformation,
    Settings,
};
use std::cell::RefCell;
use std::fs;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output};
use std::time::Duration;
use tempfile::TempDir;
use zeroize::Zeroizing;

const RAW_KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
const ROOT_HASH: &str = "5e2b1c9d0a8f7e6d5c4b3a29181f0e0d0c0b0a09080706050403020100ffeedd";
const AZMOUNT: &str = "/bin/azmount";
const VERITYSETUP: &str = "veritysetup";
const CRYPTSETUP: &str = "cryptsetup";

/// Pretends to be the backing store, veritysetup and cryptsetup.
#[derive(Default)]
struct FakeTools {
    /// Images whose URL contains this never show up.
    missing_url: Option<&'static str>,
    /// Tools with this name exit with an error.
    failing_tool: Option<&'static str>,
    spawned: RefCell<Vec<ToolCommand>>,
    ran: RefCell<Vec<ToolCommand>>,
    /// Key file path and content, as seen by cryptsetup.
    keys_seen: RefCell<Vec<(PathBuf, Vec<u8>)>>,
}

impl FakeTools {
    fn ran_tool(&self, tool: &str) -> Vec<ToolCommand> {
        self.ran.borrow().iter().filter(|c| c.program() == Path::new(tool)).cloned().collect()
    }
}

impl CommandRunner for FakeTools {
    fn run(&self, command: &ToolCommand) -> Result<Output> {
        self.ran.borrow_mut().push(command.clone());
        if command.program() == Path::new(CRYPTSETUP) {
            let path = PathBuf::from(command.flag_value("--key-file").unwrap());
            let key = fs::read(&path)?;
            self.keys_seen.borrow_mut().push((path, key));
        }
        let fail = self.failing_tool.map_or(false, |t| command.program() == Path::new(t));
        Ok(Output {
            status: ExitStatus::from_raw(if fail { 1 << 8 } else { 0 }),
            stdout: Vec::new(),
            stderr: if fail { b"Device or resource busy".to_vec() } else { Vec::new() },
        })
    }

    fn spawn(&self, command: &ToolCommand) -> Result<()> {
        self.spawned.borrow_mut().push(command.clone());
        let url = command.flag_value("-url").unwrap().to_str().unwrap();
        if self.missing_url.map_or(false, |m| url.contains(m)) {
            return Ok(());
        }
        let image = Path::new(command.flag_value("-mountpoint").unwrap()).join("data");
        fs::write(image, b"ext4")?;
        Ok(())
    }
}

#[derive(Default)]
struct FakeMounter {
    requests: RefCell<Vec<MountRequest>>,
}

impl Mounter for FakeMounter {
    fn mount(&self, request: &MountRequest) -> Result<()> {
        self.requests.borrow_mut().push(request.clone());
        Ok(())
    }
}

/// Releases the same octet key for every kid.
struct FakeReleaser {
    key: [u8; 32],
}

impl KeyReleaser for FakeReleaser {
    fn release(&self, _ctx: &MountContext, key: &KeyBlob) -> Result<Jwk> {
        if key.kid == "revoked" {
            bail!("key release denied");
        }
        Ok(Jwk {
            kty: "oct".to_owned(),
            k: Some(Zeroizing::new(URL_SAFE_NO_PAD.encode(self.key))),
            ..Default::default()
        })
    }
}

struct NoSleep;

impl Clock for NoSleep {
    fn sleep(&self, _duration: Duration) {}
}

struct NoFetch;

impl CertFetcher for NoFetch {
    fn fetch_certs(&self, _cache: &CertCache) -> Result<PlatformCerts> {
        bail!("certificates are inline")
    }
}

struct Fixture {
    temp: TempDir,
    settings: Settings,
    ctx: MountContext,
    tools: FakeTools,
    mounter: FakeMounter,
    releaser: FakeReleaser,
}

impl Fixture {
    fn new() -> Self {
        Self::with_tools(FakeTools::default())
    }

    fn with_tools(tools: FakeTools) -> Self {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("mnt")).unwrap();
        let settings = Settings {
            temp_dir: temp.path().join("work"),
            azmount_bin: PathBuf::from(AZMOUNT),
            veritysetup_bin: PathBuf::from(VERITYSETUP),
            cryptsetup_bin: PathBuf::from(CRYPTSETUP),
            readiness: ReadinessWait::new(Duration::from_millis(1), 5),
            allow_raw_key: true,
            ..Default::default()
        };
        let uvm = UvmInformation {
            initial_certs: PlatformCerts {
                vcek_cert: "vcek".to_owned(),
                tcbm: "0300000000000873".to_owned(),
                ..Default::default()
            },
            ..Default::default()
        };
        let ctx = MountContext::initialize(
            Identity { client_id: "sandbox".to_owned() },
            CertCache::default(),
            uvm,
            &NoFetch,
        )
        .unwrap();
        Fixture {
            temp,
            settings,
            ctx,
            tools,
            mounter: FakeMounter::default(),
            releaser: FakeReleaser { key: [0x5a; 32] },
        }
    }

    fn mount_point(&self, name: &str) -> PathBuf {
        self.temp.path().join("mnt").join(name)
    }

    fn raw_fs(&self, name: &str) -> FilesystemSpec {
        FilesystemSpec {
            mount_point: self.mount_point(name),
            url: format!("https://storage.example/{}.img", name),
            raw_key: RAW_KEY.to_owned(),
            ..Default::default()
        }
    }

    fn verity_fs(&self, name: &str) -> FilesystemSpec {
        FilesystemSpec {
            dm_verity: DmVerity {
                enable: true,
                hash_url: format!("https://storage.example/{}.hash", name),
                root_hash: ROOT_HASH.to_owned(),
            },
            ..self.raw_fs(name)
        }
    }

    fn mount_all(&self, filesystems: Vec<FilesystemSpec>) -> Result<()> {
        let info = RemoteFilesystemsInformation { filesystems, ..Default::default() };
        Pipeline::new(&self.tools, &NoSleep, &self.mounter, &self.releaser, &self.settings)
            .mount_all(&self.ctx, &info)
    }

    fn key_file(&self, ordinal: usize) -> PathBuf {
        self.settings.temp_dir.join(format!("keyfile-{}", ordinal))
    }
}

#[test]
fn verity_protected_filesystem() {
    let fixture = Fixture::new();
    fixture.mount_all(vec![fixture.verity_fs("models")]).unwrap();

    let work = &fixture.settings.temp_dir;
    let spawned = fixture.tools.spawned.borrow();
    assert_eq!(2, spawned.len());
    assert_eq!(work.join("data/0").as_os_str(), spawned[0].flag_value("-mountpoint").unwrap());
    assert_eq!(work.join("hash/0").as_os_str(), spawned[1].flag_value("-mountpoint").unwrap());

    let verity = fixture.tools.ran_tool(VERITYSETUP);
    assert_eq!(1, verity.len());
    assert_eq!("remote-verity-0", verity[0].get_args()[2]);

    let crypt = fixture.tools.ran_tool(CRYPTSETUP);
    assert_eq!(1, crypt.len());
    let args = crypt[0].get_args();
    assert_eq!("luksOpen", args[2]);
    assert_eq!("/dev/mapper/remote-verity-0", args[3]);
    assert_eq!("remote-crypt-0", args[4]);

    let stored = fs::read_to_string(fixture.temp.path().join("mnt/.dm-verity-root-hash-0"));
    assert_eq!(ROOT_HASH, stored.unwrap());

    let requests = fixture.mounter.requests.borrow();
    assert_eq!(Path::new("/dev/mapper/remote-crypt-0"), requests[0].source);
    assert_eq!(MsFlags::MS_RDONLY, requests[0].flags);
    assert_eq!(Some("noload"), requests[0].data);
    assert_eq!(
        Path::new(".filesystem-0"),
        fs::read_link(fixture.mount_point("models")).unwrap()
    );
}

#[test]
fn unprotected_writable_filesystem() {
    let fixture = Fixture::new();
    let fs_spec = FilesystemSpec { read_write: true, ..fixture.raw_fs("scratch") };
    fixture.mount_all(vec![fs_spec]).unwrap();

    assert_eq!(1, fixture.tools.spawned.borrow().len());
    assert_eq!("true", fixture.tools.spawned.borrow()[0].flag_value("-readWrite").unwrap());
    assert!(fixture.tools.ran_tool(VERITYSETUP).is_empty());

    let crypt = fixture.tools.ran_tool(CRYPTSETUP);
    let source = fixture.settings.temp_dir.join("data/0/data");
    assert_eq!(source.as_os_str(), crypt[0].get_args()[3]);

    let requests = fixture.mounter.requests.borrow();
    assert_eq!(MsFlags::empty(), requests[0].flags);
    assert_eq!(None, requests[0].data);
}

#[test]
fn raw_key_is_written_verbatim_and_removed() {
    let fixture = Fixture::new();
    fixture.mount_all(vec![fixture.raw_fs("share")]).unwrap();

    let keys = fixture.tools.keys_seen.borrow();
    assert_eq!(1, keys.len());
    assert_eq!(fixture.key_file(0), keys[0].0);
    assert_eq!(hex::decode(RAW_KEY).unwrap(), keys[0].1);
    assert!(!fixture.key_file(0).exists());
}

#[test]
fn released_key_reaches_cryptsetup() {
    let fixture = Fixture::new();
    let fs_spec = FilesystemSpec {
        key: KeyBlob { kid: "fs-key".to_owned(), kty: "oct".to_owned(), ..Default::default() },
        raw_key: String::new(),
        ..fixture.raw_fs("share")
    };
    fixture.mount_all(vec![fs_spec]).unwrap();

    assert_eq!(vec![0x5a; 32], fixture.tools.keys_seen.borrow()[0].1);
}

#[test]
fn key_file_is_removed_when_luks_open_fails() {
    let tools = FakeTools { failing_tool: Some(CRYPTSETUP), ..Default::default() };
    let fixture = Fixture::with_tools(tools);

    let err = fixture.mount_all(vec![fixture.raw_fs("share")]).unwrap_err();

    assert!(matches!(err.downcast_ref::<MountError>(), Some(MountError::ToolFailed { .. })));
    assert_eq!(1, fixture.tools.keys_seen.borrow().len());
    assert!(!fixture.key_file(0).exists());
    assert!(fixture.mounter.requests.borrow().is_empty());
    assert!(fixture.mount_point("share").symlink_metadata().is_err());
}

#[test]
fn filesystems_get_their_own_devices() {
    let fixture = Fixture::new();
    fixture.mount_all(vec![fixture.raw_fs("first"), fixture.verity_fs("second")]).unwrap();

    let crypt = fixture.tools.ran_tool(CRYPTSETUP);
    assert_eq!("remote-crypt-0", crypt[0].get_args()[4]);
    assert_eq!("remote-crypt-1", crypt[1].get_args()[4]);
    assert_eq!("/dev/mapper/remote-verity-1", crypt[1].get_args()[3]);

    let work = &fixture.settings.temp_dir;
    assert!(work.join("data/0/data").exists());
    assert!(work.join("data/1/data").exists());
    assert!(work.join("hash/1/data").exists());

    assert_eq!(Path::new(".filesystem-0"), fs::read_link(fixture.mount_point("first")).unwrap());
    assert_eq!(Path::new(".filesystem-1"), fs::read_link(fixture.mount_point("second")).unwrap());
}

#[test]
fn writable_verity_is_rejected_before_any_work() {
    let fixture = Fixture::new();
    let bad = FilesystemSpec { read_write: true, ..fixture.verity_fs("bad") };

    let err = fixture.mount_all(vec![fixture.raw_fs("good"), bad]).unwrap_err();

    assert!(matches!(err.downcast_ref::<MountError>(), Some(MountError::InvalidConfig(_))));
    assert!(fixture.tools.spawned.borrow().is_empty());
    assert!(fixture.tools.ran.borrow().is_empty());
    assert!(fixture.mounter.requests.borrow().is_empty());
}

#[test]
fn first_failure_stops_the_run() {
    let tools = FakeTools { missing_url: Some("second"), ..Default::default() };
    let fixture = Fixture::with_tools(tools);

    let err = fixture
        .mount_all(vec![fixture.raw_fs("first"), fixture.raw_fs("second"), fixture.raw_fs("third")])
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MountError>(),
        Some(MountError::AcquisitionTimeout { .. })
    ));
    assert!(format!("{:#}", err).contains("filesystem index 1"));
    // The first filesystem stays mounted, the third is never started.
    assert_eq!(1, fixture.mounter.requests.borrow().len());
    assert_eq!(2, fixture.tools.spawned.borrow().len());
    assert!(fixture.mount_point("first").symlink_metadata().is_ok());
}

#[test]
fn raw_key_needs_opt_in() {
    let mut fixture = Fixture::new();
    fixture.settings.allow_raw_key = false;

    let err = fixture.mount_all(vec![fixture.raw_fs("share")]).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MountError>(),
        Some(MountError::Key(KeyError::RawKeyNotAllowed))
    ));
    assert!(fixture.tools.ran_tool(CRYPTSETUP).is_empty());
    assert!(!fixture.key_file(0).exists());
}

#[test]
fn rejected_key_release_stops_before_cryptsetup() {
    let fixture = Fixture::new();
    let fs_spec = FilesystemSpec {
        key: KeyBlob { kid: "revoked".to_owned(), ..Default::default() },
        ..fixture.raw_fs("share")
    };

    let err = fixture.mount_all(vec![fs_spec]).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MountError>(),
        Some(MountError::Key(KeyError::Release(_)))
    ));
    assert!(fixture.tools.ran_tool(CRYPTSETUP).is_empty());
}
