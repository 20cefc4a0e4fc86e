// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use rstest::rstest;

use super::{BootCaches, Descriptor, BOOT_CACHES_PATH, TS_CACHE_DIR};
use crate::Error;

fixtures!();

#[rstest]
fn test_read_full_descriptor(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let arbiter = host_arbiter(root, vec![]);

    let caches = BootCaches::read(root, &arbiter)
        .expect("read should succeed")
        .expect("descriptor should be recognized");

    assert_eq!(caches.uuid(), TEST_UUID);
    assert_eq!(caches.volume_name(), TEST_VOLNAME);
    assert_eq!(caches.root(), root);

    // rps = bootconfig + mkext, misc = disk label
    assert_eq!(caches.rps_paths().len(), 2);
    assert_eq!(caches.misc_paths().len(), 1);
    assert!(caches.efibooter().is_some());
    assert!(caches.ofbooter().is_none());

    let mkext = caches.mkext().expect("mkext entry expected");
    assert_eq!(mkext.rpath(), Path::new("System/Library/Extensions.mkext"));
    assert_eq!(
        caches.label().expect("label entry expected").rpath(),
        Path::new("System/Library/CoreServices/.disk_label")
    );
    assert_eq!(
        caches.extensions_dir(),
        Some(root.join("System/Library/Extensions"))
    );
    assert_eq!(caches.archs(), vec!["i386".to_string(), "ppc".to_string()]);
}

#[rstest]
fn test_tspath_rewrites_slashes(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let arbiter = host_arbiter(root, vec![]);

    let caches = BootCaches::read(root, &arbiter).unwrap().unwrap();
    let mkext = caches.mkext().unwrap();
    assert_eq!(
        mkext.tspath(),
        Path::new(TS_CACHE_DIR)
            .join(TEST_UUID)
            .join("System:Library:Extensions.mkext")
    );
}

#[rstest]
fn test_read_creates_bootstamp_dir(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let arbiter = host_arbiter(root, vec![]);

    let caches = BootCaches::read(root, &arbiter).unwrap().unwrap();
    let tsdir = caches.bootstamp_dir();
    assert_eq!(tsdir, root.join(TS_CACHE_DIR).join(TEST_UUID));
    assert!(tsdir.is_dir(), "bootstamp directory should be created");
}

#[rstest]
fn test_missing_descriptor_is_not_an_error(tmpdir: tempfile::TempDir) {
    let arbiter = host_arbiter(tmpdir.path(), vec![]);
    let caches = BootCaches::read(tmpdir.path(), &arbiter).expect("read should succeed");
    assert!(caches.is_none());
}

#[rstest]
fn test_unknown_toplevel_key_rejected(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let bad = descriptor_xml().replace(
        "    <key>PreBootPaths</key>",
        "    <key>NewFangledCache</key>\n    <string>whatever</string>\n    <key>PreBootPaths</key>",
    );
    ensure(root.join(BOOT_CACHES_PATH), &bad);
    let arbiter = host_arbiter(root, vec![]);

    match BootCaches::read(root, &arbiter) {
        Err(Error::InvalidDescriptor(_)) => (),
        other => panic!("unknown key should reject the descriptor, got {other:?}"),
    }
}

#[rstest]
fn test_unknown_nested_key_rejected(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let bad = descriptor_xml().replace(
        "        <key>BootConfig</key>",
        "        <key>KernelCache</key>\n        <string>somewhere</string>\n        <key>BootConfig</key>",
    );
    ensure(root.join(BOOT_CACHES_PATH), &bad);
    let arbiter = host_arbiter(root, vec![]);

    match BootCaches::read(root, &arbiter) {
        Err(Error::InvalidDescriptor(_)) => (),
        other => panic!("unknown nested key should reject the descriptor, got {other:?}"),
    }
}

#[rstest]
fn test_group_writable_descriptor_rejected(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let bcpath = root.join(BOOT_CACHES_PATH);
    std::fs::set_permissions(&bcpath, std::fs::Permissions::from_mode(0o664)).unwrap();
    let arbiter = host_arbiter(root, vec![]);

    match BootCaches::read(root, &arbiter) {
        Err(Error::InvalidDescriptor(msg)) => {
            assert!(msg.contains("writable"), "unexpected message: {msg}")
        }
        other => panic!("writable descriptor should be rejected, got {other:?}"),
    }
}

#[rstest]
fn test_disrespected_owner_silently_ignored(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let bcpath = root.join(BOOT_CACHES_PATH);
    nix::unistd::chown(&bcpath, Some(nix::unistd::Uid::from_raw(99)), None).unwrap();
    let arbiter = host_arbiter(root, vec![]);

    let caches = BootCaches::read(root, &arbiter).expect("uid 99 should not be an error");
    assert!(caches.is_none());
}

#[rstest]
fn test_additional_paths_extend_both_sets(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let extended = descriptor_xml()
        .replace(
            "        <key>DiskLabel</key>",
            "        <key>AdditionalPaths</key>\n        <array>\n            <string>System/Library/CoreServices/SystemVersion.plist</string>\n        </array>\n        <key>DiskLabel</key>",
        )
        .replace(
            "        <key>BootConfig</key>",
            "        <key>AdditionalPaths</key>\n        <array>\n            <string>mach_kernel</string>\n        </array>\n        <key>BootConfig</key>",
        );
    ensure(root.join(BOOT_CACHES_PATH), &extended);
    let arbiter = host_arbiter(root, vec![]);

    let caches = BootCaches::read(root, &arbiter).unwrap().unwrap();
    assert_eq!(caches.rps_paths().len(), 3);
    assert_eq!(caches.misc_paths().len(), 2);
    // the additional paths come first, the keyed entries after
    assert_eq!(caches.rps_paths()[0].rpath(), Path::new("mach_kernel"));
    assert_eq!(
        caches.label().unwrap().rpath(),
        Path::new("System/Library/CoreServices/.disk_label")
    );
}

#[rstest]
fn test_descriptor_round_trip() {
    let parsed: Descriptor =
        plist::from_bytes(descriptor_xml().as_bytes()).expect("descriptor should parse");

    let mut encoded = Vec::new();
    plist::to_writer_xml(&mut encoded, &parsed).expect("descriptor should serialize");
    let reparsed: Descriptor = plist::from_bytes(&encoded).expect("round trip should parse");

    assert_eq!(parsed, reparsed);
}

#[rstest]
fn test_watched_paths_cover_everything(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let root = tmpdir.path();
    build_host_volume(root);
    let arbiter = host_arbiter(root, vec![]);

    let caches = BootCaches::read(root, &arbiter).unwrap().unwrap();
    let paths = caches.watched_paths();
    assert!(paths.contains(&root.join("System/Library/Extensions")));
    assert!(paths.contains(&root.join("System/Library/Extensions.mkext")));
    assert!(paths.contains(&root.join("System/Library/CoreServices/boot.efi")));
    assert!(paths.contains(&root.join("System/Library/CoreServices/.disk_label")));
    assert!(paths.contains(
        &root.join("Library/Preferences/SystemConfiguration/com.apple.Boot.plist")
    ));
}
