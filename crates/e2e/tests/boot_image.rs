//! Boot image patching with the real cpio tool

use installer_e2e::boot_image::{
    interactive_defaults, sha256_file, CpioPatcher, ImagePatcher, INTERACTIVE_DEFAULTS_PATH,
};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

fn have_cpio() -> bool {
    let found = Command::new("cpio")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false);
    if !found {
        eprintln!("cpio not installed, skipping");
    }
    found
}

/// Build a small updates.img with one regular file in it
async fn source_image(dir: &Path) -> std::path::PathBuf {
    let tree = dir.join("tree");
    fs::create_dir_all(tree.join("usr/share/anaconda")).unwrap();
    fs::write(tree.join("usr/share/anaconda/product.conf"), "[Product]\n").unwrap();

    let image = dir.join("updates-fedora-rawhide.img");
    CpioPatcher::new().pack_tree(&tree, &image).await.unwrap();
    image
}

#[tokio::test]
async fn patched_image_carries_directive_and_source_is_untouched() {
    if !have_cpio() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let source = source_image(tmp.path()).await;
    let before = sha256_file(&source).await.unwrap();

    let dest = tmp.path().join("vm-1-updates.img");
    let url = "http://10.0.2.2:8000/fedora-rawhide-anaconda-payload";
    let patched = CpioPatcher::new().patch(&source, &dest, url).await.unwrap();

    assert_eq!(patched.path, dest);
    assert_eq!(patched.payload_url, url);
    assert_eq!(patched.digest, sha256_file(&dest).await.unwrap());
    assert_eq!(sha256_file(&source).await.unwrap(), before);

    let out = tmp.path().join("out");
    fs::create_dir_all(&out).unwrap();
    CpioPatcher::new().unpack(&dest, &out).await.unwrap();
    assert_eq!(
        fs::read_to_string(out.join(INTERACTIVE_DEFAULTS_PATH)).unwrap(),
        interactive_defaults(url)
    );
    assert_eq!(
        fs::read_to_string(out.join("usr/share/anaconda/product.conf")).unwrap(),
        "[Product]\n"
    );
}

#[tokio::test]
async fn sessions_get_independent_images() {
    if !have_cpio() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let source = source_image(tmp.path()).await;
    let patcher = CpioPatcher::new();

    let a = tmp.path().join("vm-a-updates.img");
    let b = tmp.path().join("vm-b-updates.img");
    patcher.patch(&source, &a, "http://10.0.2.2:8000/a").await.unwrap();
    patcher.patch(&source, &b, "http://10.0.2.2:8001/b").await.unwrap();

    let out = tmp.path().join("out-a");
    fs::create_dir_all(&out).unwrap();
    patcher.unpack(&a, &out).await.unwrap();
    assert_eq!(
        fs::read_to_string(out.join(INTERACTIVE_DEFAULTS_PATH)).unwrap(),
        interactive_defaults("http://10.0.2.2:8000/a")
    );
}

#[tokio::test]
async fn missing_source_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let err = CpioPatcher::new()
        .patch(
            &tmp.path().join("updates-missing.img"),
            &tmp.path().join("out.img"),
            "http://10.0.2.2:8000/payload",
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("updates-missing.img"));
    assert!(!tmp.path().join("out.img").exists());
}
