//! End-to-end tests driving the `inpack` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const CATALOG: &str = r#"
[[component]]
id = "core"
label = "Core"

[[component.artifact]]
path = "bin/app"
source = "payload/app.bin"

[[component]]
id = "docs"
depends = ["core"]

[[component.artifact]]
path = "share/readme.txt"
content = "read me"
codec = "gzip"

[[component.artifact]]
path = "share/notes"
source = "payload/notes"
"#;

/// Temp workspace with a catalog and its source files.
struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let root = temp_dir.path();
        fs::create_dir_all(root.join("payload/notes/sub")).unwrap();
        fs::write(root.join("payload/app.bin"), vec![7u8; 4096]).unwrap();
        fs::write(root.join("payload/notes/a.txt"), b"alpha").unwrap();
        fs::write(root.join("payload/notes/sub/b.txt"), b"bravo").unwrap();
        fs::write(root.join("catalog.toml"), CATALOG).unwrap();
        Self { temp_dir }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.temp_dir.path().join(rel)
    }

    fn inpack(&self, args: &[&str]) -> Output {
        let bin_path = env!("CARGO_BIN_EXE_inpack");
        Command::new(bin_path)
            .current_dir(self.temp_dir.path())
            .env_remove("INPACK_DEFAULT_CODEC")
            .env_remove("INPACK_ZSTD_LEVEL")
            .env_remove("INPACK_WORKERS")
            .env_remove("INPACK_COMMIT_TIMEOUT_SECS")
            .args(args)
            .output()
            .expect("failed to run inpack")
    }

    fn build(&self) -> Output {
        self.inpack(&["build", "catalog.toml", "out/app.inpk", "out/app.json"])
    }
}

fn code(output: &Output) -> Option<i32> {
    output.status.code()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn files_under(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = walk(root)
        .into_iter()
        .map(|p| {
            p.strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            out.extend(walk(&path));
        } else {
            out.push(path);
        }
    }
    out
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.inpack(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Usage:"));
}

#[test]
fn test_build_deploy_verify_uninstall() {
    let ctx = TestContext::new();

    let output = ctx.build();
    assert!(output.status.success(), "build failed: {}", stderr(&output));
    assert!(ctx.path("out/app.inpk").is_file());
    assert!(ctx.path("out/app.json").is_file());

    let output = ctx.inpack(&["verify", "out/app.inpk", "out/app.json"]);
    assert!(output.status.success(), "verify failed: {}", stderr(&output));

    let output = ctx.inpack(&["deploy", "out/app.inpk", "out/app.json", "install"]);
    assert!(output.status.success(), "deploy failed: {}", stderr(&output));
    assert_eq!(
        files_under(&ctx.path("install")),
        [
            ".inpack/receipt.json",
            "bin/app",
            "share/notes/a.txt",
            "share/notes/sub/b.txt",
            "share/readme.txt",
        ]
    );
    assert_eq!(
        fs::read(ctx.path("install/share/readme.txt")).unwrap(),
        b"read me"
    );
    assert_eq!(fs::read(ctx.path("install/bin/app")).unwrap(), vec![7u8; 4096]);

    let output = ctx.inpack(&["uninstall", "install"]);
    assert!(output.status.success(), "uninstall failed: {}", stderr(&output));
    assert!(files_under(&ctx.path("install")).is_empty());
}

#[test]
fn test_component_selection() {
    let ctx = TestContext::new();
    let output = ctx.inpack(&[
        "build",
        "catalog.toml",
        "core.inpk",
        "core.json",
        "--component",
        "core",
    ]);
    assert!(output.status.success(), "build failed: {}", stderr(&output));

    let descriptor: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(ctx.path("core.json")).unwrap()).unwrap();
    let entries = descriptor["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["container_path"], "bin/app");
}

#[test]
fn test_cycle_exits_12_without_output() {
    let ctx = TestContext::new();
    fs::write(
        ctx.path("cycle.toml"),
        r#"
[[component]]
id = "a"
depends = ["b"]

[[component]]
id = "b"
depends = ["a"]
"#,
    )
    .unwrap();

    let output = ctx.inpack(&["build", "cycle.toml", "c.inpk", "c.json"]);
    assert_eq!(code(&output), Some(12));
    assert!(stderr(&output).contains("circular dependency"));
    assert!(!ctx.path("c.inpk").exists());
    assert!(!ctx.path("c.json").exists());
}

#[test]
fn test_unknown_component_exits_11() {
    let ctx = TestContext::new();
    let output = ctx.inpack(&[
        "build",
        "catalog.toml",
        "x.inpk",
        "x.json",
        "--component",
        "nope",
    ]);
    assert_eq!(code(&output), Some(11));
}

#[test]
fn test_verify_reports_mismatch() {
    let ctx = TestContext::new();
    assert!(ctx.build().status.success());

    // Give the first entry another entry's checksum.
    let path = ctx.path("out/app.json");
    let mut descriptor: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let other = descriptor["entries"][1]["checksum"].clone();
    descriptor["entries"][0]["checksum"] = other;
    fs::write(&path, serde_json::to_string_pretty(&descriptor).unwrap()).unwrap();

    let output = ctx.inpack(&["verify", "out/app.inpk", "out/app.json"]);
    assert_eq!(code(&output), Some(31));
    assert!(stderr(&output).contains("bin/app"));
}

#[test]
fn test_deploy_rejects_descriptor_from_another_build() {
    let ctx = TestContext::new();
    assert!(ctx.build().status.success());
    let output = ctx.inpack(&[
        "build",
        "catalog.toml",
        "core.inpk",
        "core.json",
        "--component",
        "core",
    ]);
    assert!(output.status.success());

    let output = ctx.inpack(&["deploy", "out/app.inpk", "core.json", "install"]);
    assert_eq!(code(&output), Some(60));
    assert!(!ctx.path("install").exists());
}

#[test]
fn test_failed_deploy_leaves_target_untouched() {
    let ctx = TestContext::new();
    assert!(ctx.build().status.success());

    let path = ctx.path("out/app.json");
    let mut descriptor: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
    let other = descriptor["entries"][0]["checksum"].clone();
    descriptor["entries"][2]["checksum"] = other;
    fs::write(&path, serde_json::to_string_pretty(&descriptor).unwrap()).unwrap();

    fs::create_dir_all(ctx.path("install/bin")).unwrap();
    fs::write(ctx.path("install/bin/app"), b"previous version").unwrap();

    let output = ctx.inpack(&["deploy", "out/app.inpk", "out/app.json", "install"]);
    assert_eq!(code(&output), Some(31));
    assert_eq!(files_under(&ctx.path("install")), ["bin/app"]);
    assert_eq!(
        fs::read(ctx.path("install/bin/app")).unwrap(),
        b"previous version"
    );
}

#[test]
fn test_uninstall_without_receipt_exits_60() {
    let ctx = TestContext::new();
    fs::create_dir_all(ctx.path("empty")).unwrap();
    let output = ctx.inpack(&["uninstall", "empty"]);
    assert_eq!(code(&output), Some(60));
}

#[test]
fn test_bad_flag_is_usage_error() {
    let ctx = TestContext::new();
    let output = ctx.inpack(&["deploy", "a", "b", "c", "--on-missing", "maybe"]);
    assert_eq!(code(&output), Some(2));
}
