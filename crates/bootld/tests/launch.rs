#![cfg(unix)]

use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

const SCHEMA: &str = "bootld.bundle.manifest@0.1.0";

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
    bundle: PathBuf,
    scratch_root: PathBuf,
}

impl Fixture {
    fn new(mode: &str, options: Value) -> Self {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path().canonicalize().expect("canonicalize tempdir");
        let bundle = root.join("app.bundle");
        let scratch_root = root.join("scratch-root");
        std::fs::create_dir_all(bundle.join("lib")).expect("create bundle");
        std::fs::create_dir_all(&scratch_root).expect("create scratch root");

        std::fs::copy(env!("CARGO_BIN_EXE_bootld-proc-echo"), bundle.join("app"))
            .expect("copy payload");
        std::fs::write(bundle.join("lib/libdata.so"), b"not really a library").expect("write lib");
        let manifest = json!({
            "schema_version": SCHEMA,
            "mode": mode,
            "payload": "app",
            "options": options,
        });
        std::fs::write(
            bundle.join("manifest.json"),
            serde_json::to_vec(&manifest).expect("manifest JSON"),
        )
        .expect("write manifest");

        Fixture {
            _tmp: tmp,
            root,
            bundle,
            scratch_root,
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_bootld"));
        cmd.args(args)
            .env("BOOTLD_BUNDLE_DIR", &self.bundle)
            .env("TMPDIR", &self.scratch_root)
            .env_remove("TEMP")
            .env_remove("TMP")
            .env_remove("LISTEN_PID");
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.command(args).output().expect("run bootld")
    }

    fn out_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn scratch_entries(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.scratch_root)
            .expect("read scratch root")
            .map(|e| e.expect("dir entry").path())
            .collect()
    }
}

fn read_json(path: &Path) -> Value {
    let bytes = std::fs::read(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()));
    serde_json::from_slice(&bytes).expect("parse JSON")
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn wait_for_file(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !path.exists() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", path.display());
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn child_exit_code_becomes_launcher_exit_code() {
    let fx = Fixture::new("onefile", json!({}));
    let out = fx.run(&["exit", "7"]);
    assert_eq!(out.status.code(), Some(7), "stderr:\n{}", stderr(&out));
    assert!(fx.scratch_entries().is_empty(), "{:?}", fx.scratch_entries());
}

#[test]
fn child_signal_is_reproduced_after_cleanup() {
    let fx = Fixture::new("onefile", json!({}));
    let signo = libc::SIGTERM.to_string();
    let out = fx.run(&["signal", signo.as_str()]);
    assert_eq!(out.status.signal(), Some(libc::SIGTERM), "stderr:\n{}", stderr(&out));
    assert!(fx.scratch_entries().is_empty(), "{:?}", fx.scratch_entries());
}

#[test]
fn arguments_reach_child_in_order() {
    let fx = Fixture::new("onedir", json!({}));
    let out_path = fx.out_file("argv.json");
    let out_str = out_path.to_str().expect("utf-8 path");
    let out = fx.run(&["argv", "--out", out_str, "one", "-x", "two"]);
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", stderr(&out));

    let v = read_json(&out_path);
    assert_eq!(v["argv"], json!(["argv", "--out", out_str, "one", "-x", "two"]));
    assert_eq!(v["rest"], json!(["one", "-x", "two"]));
}

#[cfg(target_os = "linux")]
#[test]
fn onefile_child_runs_from_scratch_with_staged_library_path() {
    let fx = Fixture::new("onefile", json!({}));
    let out_path = fx.out_file("env.json");
    let out = fx
        .command(&["env", "--out", out_path.to_str().expect("utf-8 path")])
        .env("LD_LIBRARY_PATH", "/opt/bootld-test/lib")
        .output()
        .expect("run bootld");
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", stderr(&out));

    let v = read_json(&out_path);
    let exe_dir = PathBuf::from(v["exe_dir"].as_str().expect("exe_dir"));
    assert_eq!(exe_dir.parent(), Some(fx.scratch_root.as_path()));
    let name = exe_dir.file_name().expect("name").to_string_lossy().into_owned();
    assert!(name.starts_with("_MEI"), "{name}");

    assert_eq!(
        v["ld_library_path"],
        json!(format!("{}:/opt/bootld-test/lib", exe_dir.display()))
    );
    assert_eq!(v["ld_library_path_orig"], json!("/opt/bootld-test/lib"));

    assert!(!exe_dir.exists());
    assert!(fx.scratch_entries().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn onedir_stages_bundle_dir_without_shadow_when_unset() {
    let fx = Fixture::new("onedir", json!({}));
    let out_path = fx.out_file("env.json");
    let out = fx
        .command(&["env", "--out", out_path.to_str().expect("utf-8 path")])
        .env_remove("LD_LIBRARY_PATH")
        .env_remove("LD_LIBRARY_PATH_ORIG")
        .output()
        .expect("run bootld");
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", stderr(&out));

    let v = read_json(&out_path);
    assert_eq!(v["exe_dir"], json!(fx.bundle.display().to_string()));
    assert_eq!(v["ld_library_path"], json!(fx.bundle.display().to_string()));
    assert_eq!(v["ld_library_path_orig"], Value::Null);
    assert!(fx.scratch_entries().is_empty());
}

#[test]
fn runtime_tmpdir_option_moves_scratch() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let rt = tmp.path().canonicalize().expect("canonicalize").join("rt");
    std::fs::create_dir_all(&rt).expect("create rt");
    let fx = Fixture::new(
        "onefile",
        json!({ "pyi-runtime-tmpdir": rt.display().to_string() }),
    );
    let out_path = fx.out_file("env.json");
    let out = fx.run(&["env", "--out", out_path.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", stderr(&out));

    let v = read_json(&out_path);
    let exe_dir = PathBuf::from(v["exe_dir"].as_str().expect("exe_dir"));
    assert_eq!(exe_dir.parent(), Some(rt.as_path()));
    assert_eq!(std::fs::read_dir(&rt).expect("read rt").count(), 0);
}

#[test]
fn unusable_runtime_tmpdir_is_fatal() {
    let fx = Fixture::new(
        "onefile",
        json!({ "pyi-runtime-tmpdir": "/nonexistent/bootld-rt" }),
    );
    let out = fx.run(&["exit", "0"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(
        stderr(&out).contains("cannot create temporary directory"),
        "stderr:\n{}",
        stderr(&out)
    );
}

#[test]
fn listen_pid_points_at_child() {
    let fx = Fixture::new("onedir", json!({}));
    let out_path = fx.out_file("env.json");
    let out = fx
        .command(&["env", "--out", out_path.to_str().expect("utf-8 path")])
        .env("LISTEN_PID", "1")
        .output()
        .expect("run bootld");
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", stderr(&out));

    let v = read_json(&out_path);
    let pid = v["pid"].as_u64().expect("pid");
    assert_eq!(v["listen_pid"], json!(pid.to_string()));
}

fn signal_launcher_while_child_waits(fx: &Fixture) -> Output {
    let ready = fx.out_file("ready");
    let child = fx
        .command(&[
            "wait-signal",
            "--ready",
            ready.to_str().expect("utf-8 path"),
            "--timeout-ms",
            "1500",
        ])
        .stderr(std::process::Stdio::piped())
        .spawn()
        .expect("spawn bootld");

    wait_for_file(&ready, Duration::from_secs(10));
    // Handlers are installed right after spawn returns in the launcher.
    std::thread::sleep(Duration::from_millis(200));
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGUSR1) };
    assert_eq!(rc, 0);
    child.wait_with_output().expect("wait bootld")
}

#[test]
fn forwarded_signal_reaches_child() {
    let fx = Fixture::new("onedir", json!({}));
    let out = signal_launcher_while_child_waits(&fx);
    assert_eq!(out.status.code(), Some(libc::SIGUSR1), "stderr:\n{}", stderr(&out));
}

#[test]
fn ignored_signal_does_not_reach_child() {
    let fx = Fixture::new("onedir", json!({ "pyi-bootloader-ignore-signals": "1" }));
    let out = signal_launcher_while_child_waits(&fx);
    assert_eq!(out.status.code(), Some(0), "stderr:\n{}", stderr(&out));
}

#[test]
fn unloadable_preload_fails_before_child_runs() {
    let fx = Fixture::new("onefile", json!({}));
    let manifest = json!({
        "schema_version": SCHEMA,
        "mode": "onefile",
        "payload": "app",
        "preload": ["lib/libdata.so"],
    });
    std::fs::write(
        fx.bundle.join("manifest.json"),
        serde_json::to_vec(&manifest).expect("manifest JSON"),
    )
    .expect("overwrite manifest");

    let out_path = fx.out_file("argv.json");
    let out = fx.run(&["argv", "--out", out_path.to_str().expect("utf-8 path")]);
    assert_eq!(out.status.code(), Some(1), "stderr:\n{}", stderr(&out));
    assert!(
        stderr(&out).contains("preload lib/libdata.so"),
        "stderr:\n{}",
        stderr(&out)
    );
    assert!(!out_path.exists());
    assert!(fx.scratch_entries().is_empty(), "{:?}", fx.scratch_entries());
}

#[test]
fn bad_manifest_exits_1() {
    let fx = Fixture::new("onedir", json!({}));
    std::fs::write(fx.bundle.join("manifest.json"), b"{\"schema_version\":\"nope\"}")
        .expect("overwrite manifest");
    let out = fx.run(&["exit", "0"]);
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("manifest"), "stderr:\n{}", stderr(&out));
}
