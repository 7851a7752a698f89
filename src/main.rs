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

//! `remotefs` mounts the remote filesystems described by a base64-encoded JSON request.

use anyhow::{bail, Context, Result};
use clap::{arg, ArgAction, ArgMatches};
use log::{error, info, LevelFilter};
use remotefs::acquire::SystemClock;
use remotefs::attest::{HelperCertFetcher, HelperKeyReleaser, DEFAULT_HELPER};
use remotefs::context::UvmInformation;
use remotefs::mount::SystemMounter;
use remotefs::tool::SystemRunner;
use remotefs::{MountContext, Pipeline, RemoteFilesystemsInformation, Settings};
use std::path::{Path, PathBuf};

fn main() {
    let matches = clap_command().get_matches();
    init_logging(matches.get_flag("verbose"));
    if let Err(e) = try_main(&matches) {
        error!("failed with {:?}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    // RUST_LOG, when set, wins over the default level.
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

fn clap_command() -> clap::Command {
    clap::Command::new("remotefs").args(&[
        arg!(--info <BASE64> "the request, as base64-encoded JSON").conflicts_with("info-file"),
        arg!(--"info-file" <PATH> "file holding the request as JSON")
            .value_parser(clap::value_parser!(PathBuf)),
        arg!(--"temp-dir" <DIR> "directory for working files")
            .value_parser(clap::value_parser!(PathBuf)),
        arg!(--azmount <BIN> "the backing-store binary").value_parser(clap::value_parser!(PathBuf)),
        arg!(--veritysetup <BIN> "the veritysetup binary")
            .value_parser(clap::value_parser!(PathBuf)),
        arg!(--cryptsetup <BIN> "the cryptsetup binary").value_parser(clap::value_parser!(PathBuf)),
        arg!(--"skr-helper" <BIN> "the attestation helper binary")
            .value_parser(clap::value_parser!(PathBuf))
            .default_value(DEFAULT_HELPER),
        arg!(--"allow-raw-key" "accept raw keys (testing only)").action(ArgAction::SetTrue),
        arg!(-v --verbose "log debug output").action(ArgAction::SetTrue),
    ])
}

fn settings_from(matches: &ArgMatches) -> Settings {
    let mut settings = Settings::default();
    let path = |id: &str| matches.get_one::<PathBuf>(id).cloned();
    if let Some(dir) = path("temp-dir") {
        settings.temp_dir = dir;
    }
    if let Some(bin) = path("azmount") {
        settings.azmount_bin = bin;
    }
    if let Some(bin) = path("veritysetup") {
        settings.veritysetup_bin = bin;
    }
    if let Some(bin) = path("cryptsetup") {
        settings.cryptsetup_bin = bin;
    }
    settings.allow_raw_key = matches.get_flag("allow-raw-key");
    settings
}

fn load_request(matches: &ArgMatches) -> Result<RemoteFilesystemsInformation> {
    if let Some(encoded) = matches.get_one::<String>("info") {
        return RemoteFilesystemsInformation::from_base64(encoded);
    }
    if let Some(path) = matches.get_one::<PathBuf>("info-file") {
        return RemoteFilesystemsInformation::load_from(path);
    }
    bail!("Either --info or --info-file is required")
}

fn try_main(matches: &ArgMatches) -> Result<()> {
    let request = load_request(matches)?;
    let settings = settings_from(matches);
    if settings.allow_raw_key {
        info!("Raw keys are allowed");
    }
    let helper: &Path = matches
        .get_one::<PathBuf>("skr-helper")
        .map(PathBuf::as_path)
        .unwrap_or_else(|| Path::new(DEFAULT_HELPER));

    let runner = SystemRunner;
    let ctx = MountContext::initialize(
        request.identity.clone(),
        request.certcache.clone(),
        UvmInformation::from_env(),
        &HelperCertFetcher::new(&runner, helper),
    )
    .context("Failed to initialize attestation context")?;

    let releaser = HelperKeyReleaser::new(&runner, helper);
    let pipeline = Pipeline::new(&runner, &SystemClock, &SystemMounter, &releaser, &settings);
    pipeline.mount_all(&ctx, &request)
}
