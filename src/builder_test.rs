// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk
use rstest::rstest;

use super::{rebuild_helpers, rebuild_mkext};
use crate::caches::BootCaches;

fixtures!();

#[rstest]
#[tokio::test]
async fn test_synchronous_build_reports_exit_code(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    install_test_config(); // builder is /bin/false
    let root = tmpdir.path();
    build_host_volume(root);
    let arbiter = host_arbiter(root, vec![]);
    let caches = BootCaches::read(root, &arbiter).unwrap().unwrap();

    let code = rebuild_mkext(&caches, true)
        .await
        .expect("launching the builder should work");
    assert_eq!(code, Some(1), "/bin/false exits nonzero");
}

#[rstest]
#[tokio::test]
async fn test_detached_build_leaves_nothing_to_reap(tmpdir: tempfile::TempDir) {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    install_test_config();
    let root = tmpdir.path();
    build_host_volume(root);
    let arbiter = host_arbiter(root, vec![]);
    let caches = BootCaches::read(root, &arbiter).unwrap().unwrap();

    // the intermediate parent exits as soon as the real builder is
    // re-parented to the system
    rebuild_helpers(&caches, false)
        .await
        .expect("detached launch should succeed");
}
