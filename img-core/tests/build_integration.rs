//! End-to-end build tests.
//!
//! RUN steps go through a scripted sandbox instead of a real chroot, so
//! these tests need neither root nor a base image. The scripted sandbox
//! understands a handful of commands (the last argv element):
//!
//! - `write <path> <content>` writes a file
//! - `fail` exits with status 1
//! - `exists <path> <out>` writes `yes`/`no` to `<out>` depending on whether `<path>` exists
//! - `env <VAR> <out>` writes the value of `VAR` to `<out>`
//! - `fail-on <arch>` exits with status 1 when building for `<arch>`
//!
//! Mounts are placed after the snapshot and left behind, so they show up in
//! the raw delta and the executor has to strip them.

use img_core::builder::layer::{self, TreeSnapshot};
use img_core::builder::options::{OutputKind, OutputSpec, SecretSpec};
use img_core::builder::parser::ImageRef;
use img_core::builder::{
    BlobStore, BuildOptions, Builder, ExportedArtifact, Platform, RunOutcome, RunRequest, Sandbox, SandboxError,
    ScriptSource,
};
use img_core::{Config, ImgError};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct ScriptedSandbox {
    runs: AtomicUsize,
}

impl ScriptedSandbox {
    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

fn write(root: &Path, path: &str, content: &str) -> std::io::Result<()> {
    let target = root.join(path.trim_start_matches('/'));
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(target, content)
}

impl Sandbox for ScriptedSandbox {
    fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let before = TreeSnapshot::capture(&request.rootfs)?;

        for mount in &request.mounts {
            let target = request.rootfs.join(mount.target.trim_start_matches('/'));
            fs::create_dir_all(target.parent().unwrap())?;
            fs::copy(&mount.source, &target)?;
        }

        let script = request.argv.last().cloned().unwrap_or_default();
        let words: Vec<&str> = script.split_whitespace().collect();
        let exit_code = match words.as_slice() {
            ["write", path, content] => {
                write(&request.rootfs, path, content)?;
                0
            }
            ["exists", path, out] => {
                let seen = request.rootfs.join(path.trim_start_matches('/')).exists();
                write(&request.rootfs, out, if seen { "yes" } else { "no" })?;
                0
            }
            ["env", var, out] => {
                write(&request.rootfs, out, request.env.get(*var).map(String::as_str).unwrap_or(""))?;
                0
            }
            ["fail-on", arch] => i32::from(request.platform.architecture == *arch),
            _ => 1,
        };

        let delta = layer::diff(&before, &request.rootfs)?;
        Ok(RunOutcome { delta, exit_code, output: format!("ran {}", script) })
    }
}

struct Harness {
    state: TempDir,
    context: TempDir,
    sandbox: Arc<ScriptedSandbox>,
    builder: Builder,
}

fn harness() -> Harness {
    let state = TempDir::new().unwrap();
    let context = TempDir::new().unwrap();
    let sandbox = Arc::new(ScriptedSandbox::default());

    let config = Config { state_dir: state.path().to_string_lossy().to_string(), max_workers: 4, ..Config::default() };
    let builder = Builder::open(config).unwrap().with_sandbox(sandbox.clone());
    Harness { state, context, sandbox, builder }
}

impl Harness {
    fn options(&self, script: &str, output: OutputSpec) -> BuildOptions {
        BuildOptions {
            context_path: self.context.path().to_path_buf(),
            script: ScriptSource::Inline(script.to_string()),
            output,
            ..BuildOptions::default()
        }
    }

    fn local(&self, name: &str) -> OutputSpec {
        OutputSpec {
            kind: OutputKind::Local,
            dest: Some(self.state.path().join(name)),
            names: Vec::new(),
            compression: None,
        }
    }
}

#[tokio::test]
async fn test_build_to_local_directory() {
    let h = harness();
    fs::write(h.context.path().join("app.conf"), "port=80").unwrap();

    let script = "FROM scratch\nCOPY app.conf /etc/app/\nWORKDIR /srv\nRUN write /srv/ready ok\n";
    let report = h.builder.build(h.options(script, h.local("out"))).await.unwrap();

    let out = h.state.path().join("out");
    assert_eq!(report.artifact, ExportedArtifact::Directory(out.clone()));
    assert_eq!(fs::read_to_string(out.join("etc/app/app.conf")).unwrap(), "port=80");
    assert_eq!(fs::read_to_string(out.join("srv/ready")).unwrap(), "ok");
    assert_eq!(report.results.len(), 1);
    assert_eq!(report.results[0].config.workdir.as_deref(), Some("/srv"));
}

#[tokio::test]
async fn test_rebuild_hits_cache_until_context_changes() {
    let h = harness();
    fs::write(h.context.path().join("input.txt"), "v1").unwrap();
    let script = "FROM scratch\nRUN write /first 1\nCOPY input.txt /input.txt\nRUN write /second 2\n";

    let first = h.builder.build(h.options(script, h.local("a"))).await.unwrap();
    assert_eq!(first.executed_steps(), 3);
    assert_eq!(h.sandbox.runs(), 2);

    let second = h.builder.build(h.options(script, h.local("b"))).await.unwrap();
    assert_eq!(second.cached_layers(), 3);
    assert_eq!(h.sandbox.runs(), 2);
    assert_eq!(first.results[0].rootfs, second.results[0].rootfs);

    // Only the COPY and what follows it are rebuilt.
    fs::write(h.context.path().join("input.txt"), "v2").unwrap();
    let third = h.builder.build(h.options(script, h.local("c"))).await.unwrap();
    assert_eq!(third.cached_layers(), 1);
    assert_eq!(third.executed_steps(), 2);
    assert_eq!(h.sandbox.runs(), 3);
    assert_eq!(fs::read_to_string(h.state.path().join("c/input.txt")).unwrap(), "v2");
}

#[tokio::test]
async fn test_no_cache_still_records_results() {
    let h = harness();
    let script = "FROM scratch\nRUN write /a 1\n";

    h.builder.build(h.options(script, h.local("a"))).await.unwrap();
    let mut options = h.options(script, h.local("b"));
    options.no_cache = true;
    let report = h.builder.build(options).await.unwrap();

    assert_eq!(report.cached_layers(), 0);
    assert_eq!(h.sandbox.runs(), 2);
}

#[tokio::test]
async fn test_secret_is_visible_to_the_step_but_not_the_image() {
    let h = harness();
    let secret = h.state.path().join("token.txt");
    fs::write(&secret, "s3cr3t").unwrap();

    let script = "FROM scratch\nRUN --mount=type=secret,id=token exists /run/secrets/token /seen\n\
                  RUN --mount=type=secret,id=other exists /run/secrets/other /other\n";
    let mut options = h.options(script, h.local("out"));
    options.secrets = vec![SecretSpec { id: "token".into(), source: secret }];

    let report = h.builder.build(options).await.unwrap();

    let out = h.state.path().join("out");
    assert_eq!(fs::read_to_string(out.join("seen")).unwrap(), "yes");
    // An id that was never provided is simply absent.
    assert_eq!(fs::read_to_string(out.join("other")).unwrap(), "no");
    assert!(!out.join("run/secrets/token").exists());

    let blobs = img_core::builder::CasStore::new(h.state.path()).unwrap();
    for layer_ref in &report.results[0].rootfs.layers {
        let data = blobs.get(&layer_ref.digest).unwrap().unwrap();
        for path in layer::entry_paths(&data).unwrap() {
            assert!(!path.starts_with("run/secrets/token"), "secret leaked into layer: {}", path.display());
        }
    }
}

#[tokio::test]
async fn test_required_secret_must_be_provided() {
    let h = harness();
    let script = "FROM scratch\nRUN --mount=type=secret,id=token,required exists /run/secrets/token /seen\n";

    let err = h.builder.build(h.options(script, h.local("out"))).await.unwrap_err();
    assert!(matches!(err, ImgError::Matrix(_)), "unexpected error: {}", err);
    assert!(err.to_string().contains("token"));
}

#[tokio::test]
async fn test_failure_names_stage_instruction_and_platform() {
    let h = harness();
    let script = "FROM scratch AS build\nRUN write /a 1\nRUN fail\nRUN write /b 2\n";

    let err = h.builder.build(h.options(script, h.local("out"))).await.unwrap_err();
    let ImgError::Matrix(matrix) = &err else { panic!("unexpected error: {}", err) };
    let failure = &matrix.failures[0];
    let origin = failure.origin.as_ref().unwrap();
    assert_eq!(origin.stage, "build");
    assert_eq!(origin.instruction, Some(1));
    assert_eq!(origin.line, 3);
    assert_eq!(failure.platform, Platform::host());
    assert!(err.to_string().contains("exited with code 1"));
    assert!(!h.state.path().join("out").exists());
}

#[tokio::test]
async fn test_invalid_output_fails_before_any_step() {
    let h = harness();
    let output = OutputSpec {
        kind: OutputKind::Image,
        dest: Some(h.state.path().join("x")),
        names: vec!["app".into()],
        compression: None,
    };

    let err = h.builder.build(h.options("FROM scratch\nRUN write /a 1\n", output)).await.unwrap_err();
    assert!(matches!(err, ImgError::Export(_)));
    assert_eq!(h.sandbox.runs(), 0);

    let mut options = h.options("FROM scratch\nRUN write /a 1\n", h.local("out"));
    options.platforms = vec!["linux/amd64".parse().unwrap(), "linux/arm64".parse().unwrap()];
    assert!(matches!(h.builder.build(options).await, Err(ImgError::Export(_))));
    assert_eq!(h.sandbox.runs(), 0);
}

#[tokio::test]
async fn test_multi_platform_image_is_usable_as_base() {
    let h = harness();
    let platforms: Vec<Platform> = vec!["linux/amd64".parse().unwrap(), "linux/arm64".parse().unwrap()];

    let base = "FROM scratch\nENV GREETING=hello\nLABEL stage=base\nRUN write /etc/os-release img\n";
    let mut options = h.options(base, OutputSpec::image(vec!["base:1".into()]));
    options.platforms = platforms.clone();
    let report = h.builder.build(options).await.unwrap();
    assert_eq!(report.results.len(), 2);
    let base_runs = h.sandbox.runs();

    let images = h.builder.images().list().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].reference, "docker.io/library/base:1");
    assert_eq!(images[0].platforms, platforms);

    let app = "FROM base:1\nLABEL stage=app\nRUN env GREETING /greeting\n";
    let mut options = h.options(app, OutputSpec::image(vec!["app:1".into()]));
    options.platforms = platforms.clone();
    options.labels = BTreeMap::from([("org.example.build".to_string(), "42".to_string())]);
    h.builder.build(options).await.unwrap();

    // Image bases are platform-specific: one run per platform.
    assert_eq!(h.sandbox.runs(), base_runs + 2);

    for platform in &platforms {
        let resolved = h.builder.images().resolve_blocking(&ImageRef::parse("app:1"), platform).unwrap();
        assert_eq!(resolved.config.env.get("GREETING").map(String::as_str), Some("hello"));
        assert_eq!(resolved.config.labels.get("stage").map(String::as_str), Some("app"));
        assert_eq!(resolved.config.labels.get("org.example.build").map(String::as_str), Some("42"));
        assert_eq!(resolved.rootfs.layers.len(), 2);
    }
}

#[tokio::test]
async fn test_target_and_cross_stage_copy() {
    let h = harness();
    let script = "FROM scratch AS build\nRUN write /out/bin tool\n\
                  FROM scratch AS unused\nRUN write /never 1\n\
                  FROM scratch\nLABEL final=yes\nCOPY --from=build /out/bin /usr/local/bin/tool\n";

    let report = h.builder.build(h.options(script, h.local("final"))).await.unwrap();
    assert_eq!(h.sandbox.runs(), 1);
    assert_eq!(fs::read_to_string(h.state.path().join("final/usr/local/bin/tool")).unwrap(), "tool");
    assert_eq!(report.results[0].config.labels.get("final").map(String::as_str), Some("yes"));

    let mut options = h.options(script, h.local("build"));
    options.target = Some("build".into());
    let report = h.builder.build(options).await.unwrap();
    assert!(report.results[0].config.labels.is_empty());
    assert!(h.state.path().join("build/out/bin").exists());
    assert_eq!(h.sandbox.runs(), 1);
}

#[tokio::test]
async fn test_tar_export_and_prune() {
    let h = harness();
    let dest = h.state.path().join("rootfs.tar");
    let output = OutputSpec { kind: OutputKind::Tar, dest: Some(dest.clone()), names: Vec::new(), compression: None };

    h.builder.build(h.options("FROM scratch\nRUN write /hello world\n", output)).await.unwrap();
    let data = fs::read(&dest).unwrap();
    let paths = layer::entry_paths(&data).unwrap();
    assert_eq!(paths[0], Path::new("./"));
    assert!(paths.iter().any(|p| p == Path::new("hello")));

    let stats = h.builder.prune().unwrap();
    assert_eq!(stats.cache_entries, 1);
    assert!(stats.blobs >= 1);
    assert!(h.builder.cache().entries().unwrap().is_empty());
}

#[tokio::test]
async fn test_tar_export_to_stdout() {
    let mut h = harness();
    let captured = Arc::new(Mutex::new(Vec::<u8>::new()));
    h.builder = h.builder.with_stdout(captured.clone());
    let output: OutputSpec = "type=tar,dest=-".parse().unwrap();

    let report = h.builder.build(h.options("FROM scratch\nRUN write /hello world\n", output)).await.unwrap();
    assert_eq!(report.artifact, ExportedArtifact::Archive(None));

    let data = captured.lock().unwrap().clone();
    let paths = layer::entry_paths(&data).unwrap();
    assert_eq!(paths[0], Path::new("./"));
    assert!(paths.iter().any(|p| p == Path::new("hello")));
}

#[tokio::test]
async fn test_failed_platform_keeps_siblings_but_exports_nothing() {
    let h = harness();
    let dest = h.state.path().join("layout.tar");
    let output = OutputSpec { kind: OutputKind::Oci, dest: Some(dest.clone()), names: Vec::new(), compression: None };
    let platforms: Vec<Platform> =
        ["linux/amd64", "linux/arm64", "linux/386"].iter().map(|p| p.parse().unwrap()).collect();

    let mut options = h.options("FROM scratch\nRUN fail-on arm64\n", output);
    options.platforms = platforms.clone();
    options.no_cache = true;
    let err = h.builder.build(options).await.unwrap_err();

    let ImgError::Matrix(matrix) = &err else { panic!("unexpected error: {}", err) };
    assert_eq!(matrix.failures.len(), 1);
    assert_eq!(matrix.failures[0].platform, platforms[1]);
    let completed: Vec<&Platform> = matrix.completed.iter().map(|r| &r.platform).collect();
    assert_eq!(completed, vec![&platforms[0], &platforms[2]]);
    assert_eq!(h.sandbox.runs(), 3);
    assert!(!dest.exists());
}
