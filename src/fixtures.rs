// Copyright (c) 2021 Sony Pictures Imageworks, et al.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/imageworks/spk

macro_rules! fixtures {
    () => {
        use rstest::fixture;

        #[allow(dead_code)]
        const TEST_UUID: &str = "8D3C53F5-B1E9-4A64-9D58-6CB1B8E3F2A7";

        #[allow(dead_code)]
        const TEST_VOLNAME: &str = "TestVol";

        #[allow(dead_code)]
        const BOOT_CONFIG_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Kernel</key>
    <string>mach_kernel</string>
</dict>
</plist>
"#;

        #[allow(dead_code)]
        fn init_logging() {
            let sub = tracing_subscriber::FmtSubscriber::builder()
                .with_max_level(tracing::Level::TRACE)
                .without_time()
                .with_test_writer()
                .finish();
            let _ = tracing::subscriber::set_global_default(sub);
        }

        #[fixture]
        fn tmpdir() -> tempfile::TempDir {
            tempfile::Builder::new()
                .prefix("bootsync-test-")
                .tempdir()
                .expect("failed to create dir for test")
        }

        #[allow(dead_code)]
        fn ensure(path: std::path::PathBuf, data: &str) {
            std::fs::create_dir_all(path.parent().unwrap()).expect("failed to make dirs");
            std::fs::write(path, data).expect("failed to write file data");
        }

        /// Most of these tests exercise a descriptor that must be owned
        /// by root; they skip themselves elsewhere.
        #[allow(dead_code)]
        fn is_root() -> bool {
            nix::unistd::geteuid().is_root()
        }

        #[allow(dead_code)]
        fn descriptor_xml() -> String {
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>PreBootPaths</key>
    <dict>
        <key>DiskLabel</key>
        <string>System/Library/CoreServices/.disk_label</string>
    </dict>
    <key>BooterPaths</key>
    <dict>
        <key>EFIBooter</key>
        <string>System/Library/CoreServices/boot.efi</string>
    </dict>
    <key>PostBootPaths</key>
    <dict>
        <key>BootConfig</key>
        <string>Library/Preferences/SystemConfiguration/com.apple.Boot.plist</string>
        <key>MKext</key>
        <dict>
            <key>Path</key>
            <string>System/Library/Extensions.mkext</string>
            <key>ExtensionsDir</key>
            <string>System/Library/Extensions</string>
            <key>Archs</key>
            <array>
                <string>i386</string>
                <string>ppc</string>
            </array>
        </dict>
    </dict>
</dict>
</plist>
"#
            .to_string()
        }

        /// Lay down a host volume with every artifact the descriptor
        /// names, mkext freshly built.
        #[allow(dead_code)]
        fn build_host_volume(root: &std::path::Path) {
            ensure(root.join(crate::caches::BOOT_CACHES_PATH), &descriptor_xml());
            std::fs::create_dir_all(root.join("System/Library/Extensions"))
                .expect("failed to make extensions dir");
            ensure(root.join("System/Library/Extensions.mkext"), "mkext contents");
            ensure(
                root.join("System/Library/CoreServices/boot.efi"),
                "efi booter bytes",
            );
            ensure(
                root.join("System/Library/CoreServices/.disk_label"),
                "old label",
            );
            ensure(
                root.join("Library/Preferences/SystemConfiguration/com.apple.Boot.plist"),
                BOOT_CONFIG_XML,
            );
            freshen_mkext(root);
        }

        /// Mark the mkext as just built: mtime exactly one past the
        /// extensions directory's.
        #[allow(dead_code)]
        fn freshen_mkext(root: &std::path::Path) {
            use nix::sys::stat::{stat, utimensat, UtimensatFlags};
            use nix::sys::time::TimeSpec;

            let extsb = stat(&root.join("System/Library/Extensions")).unwrap();
            let fresh = TimeSpec::new(extsb.st_mtime + 1, 0);
            utimensat(
                None,
                &root.join("System/Library/Extensions.mkext"),
                &fresh,
                &fresh,
                UtimensatFlags::FollowSymlink,
            )
            .unwrap();
        }

        /// A mock arbiter with one host volume and its helpers.
        #[allow(dead_code)]
        fn host_arbiter(
            root: &std::path::Path,
            helpers: Vec<(&str, std::path::PathBuf)>,
        ) -> crate::disks::mock::MockArbiter {
            let arbiter = crate::disks::mock::MockArbiter::new();
            let names = helpers.iter().map(|(name, _)| name.to_string()).collect();
            arbiter.add_volume("disk0s2", root, TEST_UUID, TEST_VOLNAME, names);
            for (name, mount) in helpers {
                arbiter.add_helper(name, &mount);
            }
            arbiter
        }

        /// Settle long enough to never fire on its own, no partition
        /// size floor, and a builder that can't do any harm.
        #[allow(dead_code)]
        fn install_test_config() {
            let mut config = crate::Config::default();
            config.watch.settle_seconds = 60;
            config.helpers.min_partition_bytes = 0;
            config.builder.path = std::path::PathBuf::from("/bin/false");
            let _ = config.make_current();
        }
    };
}
