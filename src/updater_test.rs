// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use std::path::{Path, PathBuf};

use rstest::rstest;

use super::{update_volume, HelperUpdater, BOOT_DIR_P, BOOT_DIR_R, BOOT_DIR_S, ROOT_UUID_KEY};
use crate::caches::BootCaches;
use crate::disks::mock::MockArbiter;
use crate::disks::FinderInfo;
use crate::staleness;

fixtures!();

const HELPER_BSD: &str = "disk0s3";

struct Setup {
    arbiter: MockArbiter,
    caches: BootCaches,
    host: PathBuf,
    helper: PathBuf,
}

fn setup(tmpdir: &tempfile::TempDir) -> Setup {
    install_test_config();
    let host = tmpdir.path().join("host");
    let helper = tmpdir.path().join("helper");
    build_host_volume(&host);
    std::fs::create_dir_all(&helper).unwrap();

    let arbiter = host_arbiter(&host, vec![(HELPER_BSD, helper.clone())]);
    let caches = BootCaches::read(&host, &arbiter)
        .expect("read should succeed")
        .expect("descriptor should parse");
    Setup {
        arbiter,
        caches,
        host,
        helper,
    }
}

fn rps_dirs(helper: &Path) -> Vec<String> {
    let mut found = Vec::new();
    for name in [BOOT_DIR_R, BOOT_DIR_P, BOOT_DIR_S] {
        if helper.join(name).is_dir() {
            found.push(name.to_string());
        }
    }
    found
}

async fn run_update(setup: &mut Setup) -> crate::Result<()> {
    let stale = staleness::scan(&mut setup.caches).expect("scan should succeed");
    assert!(stale.any, "expected something to update");
    HelperUpdater::new(&mut setup.caches, &setup.arbiter, stale)
        .update_helpers(&[HELPER_BSD.to_string()])
        .await
}

#[rstest]
#[tokio::test]
async fn test_fresh_helper_end_to_end(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    init_logging();
    let mut setup = setup(&tmpdir);

    run_update(&mut setup).await.expect("update should succeed");

    // exactly one rotation directory holds the new generation
    let dirs = rps_dirs(&setup.helper);
    assert_eq!(dirs.len(), 1, "exactly one RPS dir after a clean run");
    let active = setup.helper.join(&dirs[0]);

    // the mkext was copied into the active set byte for byte
    assert_eq!(
        std::fs::read(active.join("System/Library/Extensions.mkext")).unwrap(),
        std::fs::read(setup.host.join("System/Library/Extensions.mkext")).unwrap(),
    );

    // the boot config was rewritten with the host volume's uuid
    let config: plist::Value = plist::from_file(
        active.join("Library/Preferences/SystemConfiguration/com.apple.Boot.plist"),
    )
    .expect("staged boot config should parse");
    let config = config.as_dictionary().expect("boot config is a dict");
    assert_eq!(
        config.get(ROOT_UUID_KEY).and_then(|v| v.as_string()),
        Some(TEST_UUID)
    );
    assert_eq!(
        config.get("Kernel").and_then(|v| v.as_string()),
        Some("mach_kernel"),
        "existing config keys survive the rewrite"
    );

    // the booter sits at its mirrored path outside the rotation
    let booter = setup.helper.join("System/Library/CoreServices/boot.efi");
    assert_eq!(
        std::fs::read(&booter).unwrap(),
        b"efi booter bytes".to_vec()
    );

    // fresh labels: rendered content plus plain-text details
    let label = setup.helper.join("System/Library/CoreServices/.disk_label");
    assert_eq!(
        std::fs::read(&label).unwrap(),
        format!("LABEL:{TEST_VOLNAME} 1").into_bytes()
    );
    assert_eq!(
        std::fs::read(setup.helper.join(
            "System/Library/CoreServices/.disk_label.contentDetails"
        ))
        .unwrap(),
        TEST_VOLNAME.as_bytes().to_vec()
    );

    // the bless commit named the booter and its enclosing folder
    use std::os::unix::fs::MetadataExt;
    let blessed = setup
        .arbiter
        .blessed(&setup.helper)
        .expect("helper should have been blessed");
    let booter_ino = std::fs::metadata(&booter).unwrap().ino() as u32;
    let folder_ino = std::fs::metadata(booter.parent().unwrap()).unwrap().ino() as u32;
    assert_eq!(blessed.0[FinderInfo::EFI_BOOTER], booter_ino);
    assert_eq!(blessed.0[FinderInfo::SYSTEM_FOLDER], folder_ino);

    // booters were synced and tagged before the bless
    assert!(setup
        .arbiter
        .typed_inodes()
        .iter()
        .any(|(ino, _)| *ino == booter_ino as u64));

    // all helpers succeeded, so the bootstamps were committed
    let stale = staleness::scan(&mut setup.caches).unwrap();
    assert!(!stale.any, "volume should be fresh after a full update");

    // and the helper was unmounted again
    assert_eq!(setup.arbiter.unmounts(), vec![(HELPER_BSD.to_string(), false)]);
}

#[rstest]
#[tokio::test]
async fn test_rotation_advances_from_single_dir(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let mut setup = setup(&tmpdir);

    // a helper with R active from some earlier generation
    ensure(
        setup
            .helper
            .join(BOOT_DIR_R)
            .join("System/Library/Extensions.mkext"),
        "ancient mkext",
    );

    run_update(&mut setup).await.expect("update should succeed");

    // the rotation moved off R; the new generation won the selection
    let dirs = rps_dirs(&setup.helper);
    assert_eq!(dirs, vec![BOOT_DIR_P.to_string()]);
    assert_eq!(
        std::fs::read(
            setup
                .helper
                .join(BOOT_DIR_P)
                .join("System/Library/Extensions.mkext")
        )
        .unwrap(),
        b"mkext contents".to_vec()
    );
}

#[rstest]
#[tokio::test]
async fn test_rotation_advances_from_two_dirs(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let mut setup = setup(&tmpdir);

    // R and P present; P is the currently selected generation
    ensure(
        setup.helper.join(BOOT_DIR_R).join("stale-r-marker"),
        "old r",
    );
    ensure(
        setup.helper.join(BOOT_DIR_P).join("stale-p-marker"),
        "old p",
    );

    run_update(&mut setup).await.expect("update should succeed");

    // the update consumed the free slot and reaped the old active
    let dirs = rps_dirs(&setup.helper);
    assert_eq!(dirs, vec![BOOT_DIR_S.to_string()]);
    assert!(setup
        .helper
        .join(BOOT_DIR_S)
        .join("System/Library/Extensions.mkext")
        .is_file());
}

#[rstest]
#[tokio::test]
async fn test_zero_length_rps_source_fails_helper(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let mut setup = setup(&tmpdir);
    std::fs::write(setup.host.join("System/Library/Extensions.mkext"), b"").unwrap();

    let result = run_update(&mut setup).await;
    assert!(result.is_err(), "a zero-size cache file fails the helper");

    // no stamps were committed, the volume stays stale for a retry
    let stale = staleness::scan(&mut setup.caches).unwrap();
    assert!(stale.any);

    // the partially staged slot is harmless: it is the sacrificial
    // slot of the next run and nothing was blessed
    assert_eq!(rps_dirs(&setup.helper), vec![BOOT_DIR_S.to_string()]);
    assert!(setup.arbiter.blessed(&setup.helper).is_none());
}

#[rstest]
#[tokio::test]
async fn test_bless_failure_restores_previous_booter(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    init_logging();
    let mut setup = setup(&tmpdir);

    // the helper already boots an older generation
    let booter = setup.helper.join("System/Library/CoreServices/boot.efi");
    ensure(booter.clone(), "previous efi booter");
    setup.arbiter.fail_next_bless(1);

    let result = run_update(&mut setup).await;
    assert!(result.is_err(), "bless failure fails the helper");

    // rollback put the old booter back, byte for byte
    assert_eq!(
        std::fs::read(&booter).unwrap(),
        b"previous efi booter".to_vec()
    );
    assert!(
        !booter.with_extension("efi.old").exists(),
        "no .old fallback should linger"
    );

    // the labels nuked mid-update were rewritten on the way out
    assert_eq!(
        std::fs::read(setup.helper.join("System/Library/CoreServices/.disk_label")).unwrap(),
        format!("LABEL:{TEST_VOLNAME} 1").into_bytes()
    );

    // and nothing was committed
    assert!(setup.arbiter.blessed(&setup.helper).is_none());
    let stale = staleness::scan(&mut setup.caches).unwrap();
    assert!(stale.any);
}

#[rstest]
#[tokio::test]
async fn test_update_volume_is_idempotent(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let setup = setup(&tmpdir);

    let updated = update_volume(&setup.host, false, &setup.arbiter)
        .await
        .expect("one-shot update should succeed");
    assert!(updated, "first run has work to do");

    let updated = update_volume(&setup.host, false, &setup.arbiter)
        .await
        .expect("second run should succeed");
    assert!(!updated, "second run with no source changes does nothing");
}

#[rstest]
#[tokio::test]
async fn test_update_volume_without_helpers_is_a_noop(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    install_test_config();
    let host = tmpdir.path().join("host");
    build_host_volume(&host);
    let arbiter = host_arbiter(&host, vec![]);

    let updated = update_volume(&host, false, &arbiter)
        .await
        .expect("volume without helpers is fine");
    assert!(!updated);
}

#[rstest]
#[tokio::test]
async fn test_update_volume_fails_when_mkext_rebuild_fails(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let setup = setup(&tmpdir);

    // stale mkext forces a synchronous builder run first, and the
    // test builder always fails
    std::fs::write(
        setup.host.join("System/Library/Extensions.mkext"),
        "changed mkext",
    )
    .unwrap();
    let result = update_volume(&setup.host, false, &setup.arbiter).await;
    assert!(result.is_err());
}

#[rstest]
#[tokio::test]
async fn test_failed_mount_skips_bootstamps(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let mut setup = setup(&tmpdir);
    setup.arbiter.fail_next_mount(1);

    let result = run_update(&mut setup).await;
    assert!(result.is_err());

    let stale = staleness::scan(&mut setup.caches).unwrap();
    assert!(stale.any, "stamps must not be written after a failed helper");
}
