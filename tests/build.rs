//! End-to-end builds through the direct (no sandbox) backend.

use std::os::unix::fs::PermissionsExt;

use pretty_assertions::assert_eq;

use cask::{instantiate, realize, Derivation, Error, RealizeConfig, Sandbox, Store};

async fn temp_store() -> (tempfile::TempDir, Store) {
    let root = tempfile::tempdir().unwrap();
    let store = Store::open(root.path().join("store")).await.unwrap();
    (root, store)
}

fn direct() -> RealizeConfig {
    RealizeConfig {
        sandbox: Sandbox::None,
        ..RealizeConfig::default()
    }
}

fn shell(name: &str, script: &str) -> Derivation {
    Derivation::builder(name, "/bin/sh")
        .arg("-c")
        .arg(script)
        .build()
}

#[tokio::test]
async fn builds_and_installs_output() {
    let (_root, store) = temp_store().await;
    let drv = shell("greeting", r#"echo hello > "$out/greeting""#);
    let instantiated = instantiate(&store, &drv).await.unwrap();

    let out = realize(&store, &instantiated.drv_path, &direct())
        .await
        .unwrap();
    assert_eq!(out, instantiated.out_path);
    assert_eq!(
        tokio::fs::read(out.as_path().join("greeting")).await.unwrap(),
        b"hello\n"
    );

    // Locked down: directory 0o555, file 0o444.
    let dir_mode = tokio::fs::metadata(&out).await.unwrap().permissions().mode() & 0o777;
    let file_mode = tokio::fs::metadata(out.as_path().join("greeting"))
        .await
        .unwrap()
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(dir_mode, 0o555);
    assert_eq!(file_mode, 0o444);
}

#[tokio::test]
async fn dependencies_build_first_and_flow_through_env() {
    let (_root, store) = temp_store().await;
    let leaf = shell("leaf", r#"echo leaf-data > "$out/data""#);
    let top = Derivation::builder("top", "/bin/sh")
        .arg("-c")
        .arg(r#"read value < "$input0/data"; echo "got-$value" > "$out/result""#)
        .input(&leaf)
        .build();
    let instantiated = instantiate(&store, &top).await.unwrap();

    let out = realize(&store, &instantiated.drv_path, &direct())
        .await
        .unwrap();
    assert_eq!(
        tokio::fs::read(out.as_path().join("result")).await.unwrap(),
        b"got-leaf-data\n"
    );
}

#[tokio::test]
async fn existing_outputs_are_not_rebuilt() {
    let (root, store) = temp_store().await;
    let side = root.path().join("side-effect");
    let drv = Derivation::builder("cached", "/bin/sh")
        .arg("-c")
        .arg(r#"echo ran >> "$SIDE"; echo data > "$out/d""#)
        .env("SIDE", side.to_str().unwrap())
        .build();
    let instantiated = instantiate(&store, &drv).await.unwrap();

    let first = realize(&store, &instantiated.drv_path, &direct())
        .await
        .unwrap();
    let second = realize(&store, &instantiated.drv_path, &direct())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(tokio::fs::read(&side).await.unwrap(), b"ran\n");
}

#[tokio::test]
async fn builder_env_is_sanitized() {
    let (_root, store) = temp_store().await;
    // A variable the test process carries must not leak into the build.
    std::env::set_var("CASK_TEST_LEAK", "leaked");
    let drv = shell(
        "env-dump",
        r#"echo "path=$PATH home=$HOME leak=${CASK_TEST_LEAK:-clean}" > "$out/env""#,
    );
    let instantiated = instantiate(&store, &drv).await.unwrap();
    let out = realize(&store, &instantiated.drv_path, &direct())
        .await
        .unwrap();
    assert_eq!(
        tokio::fs::read(out.as_path().join("env")).await.unwrap(),
        b"path=/path-not-set home=/homeless-shelter leak=clean\n"
    );
}

#[tokio::test]
async fn scratch_directory_is_the_working_directory() {
    let (_root, store) = temp_store().await;
    // The working directory and $TMPDIR are the same scratch dir; prove
    // it through the filesystem rather than string-comparing paths.
    let drv = shell(
        "scratch-probe",
        r#"echo x > probe; [ -e "$TMPDIR/probe" ] && echo same > "$out/check""#,
    );
    let instantiated = instantiate(&store, &drv).await.unwrap();
    let out = realize(&store, &instantiated.drv_path, &direct())
        .await
        .unwrap();
    assert_eq!(
        tokio::fs::read(out.as_path().join("check")).await.unwrap(),
        b"same\n"
    );
}

#[tokio::test]
async fn failed_build_reports_code_and_stderr() {
    let (_root, store) = temp_store().await;
    let drv = shell("explodes", "echo boom >&2; exit 3");
    let instantiated = instantiate(&store, &drv).await.unwrap();

    let err = realize(&store, &instantiated.drv_path, &direct())
        .await
        .expect_err("build succeeded");
    match err {
        Error::BuildFailed { code, stderr, .. } => {
            assert_eq!(code, 3);
            assert!(stderr.contains("boom"), "stderr tail: {stderr:?}");
        }
        other => panic!("expected BuildFailed, got {other}"),
    }
    // No partial output, no scratch entries.
    assert!(!store.has(&instantiated.out_path).await);
    assert!(store
        .list()
        .await
        .unwrap()
        .iter()
        .all(|name| !name.starts_with(".tmp-")));
}

#[tokio::test]
async fn deleted_output_is_reported_missing() {
    let (_root, store) = temp_store().await;
    let drv = shell("vanishing", r#"rmdir "$out""#);
    let instantiated = instantiate(&store, &drv).await.unwrap();

    let err = realize(&store, &instantiated.drv_path, &direct())
        .await
        .expect_err("missing output accepted");
    assert!(matches!(err, Error::MissingOutput { .. }), "got {err}");
}

#[tokio::test]
async fn missing_builder_fails_without_partial_output() {
    let (_root, store) = temp_store().await;
    let drv = Derivation::builder("no-builder", "/does/not/exist").build();
    let instantiated = instantiate(&store, &drv).await.unwrap();

    realize(&store, &instantiated.drv_path, &direct())
        .await
        .expect_err("spawned a missing builder");
    assert!(!store.has(&instantiated.out_path).await);
}
