//! Command execution against a root filesystem.
//!
//! The engine only sees the [`Sandbox`] trait. [`ProcessSandbox`] is the
//! default: it runs the command under `chroot(2)` (or a configured runner
//! program) and computes the filesystem delta by walking the tree before and
//! after the run.

use crate::builder::layer::{self, Owner, TreeSnapshot};
use crate::builder::parser::MountKind;
use crate::builder::platform::Platform;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Lines of command output kept for error reports.
const OUTPUT_TAIL_LINES: usize = 20;

/// A file made visible inside the sandbox for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxMount {
    pub kind: MountKind,
    /// Host path of the material (a private copy or an agent socket).
    pub source: PathBuf,
    /// Absolute path inside the root filesystem.
    pub target: String,
}

/// One command run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub rootfs: PathBuf,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub user: Option<String>,
    pub workdir: String,
    pub mounts: Vec<SandboxMount>,
    pub platform: Platform,
}

/// Result of a run: the filesystem delta as a tar layer, and the exit code.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub delta: Vec<u8>,
    pub exit_code: i32,
    /// Tail of the combined command output.
    pub output: String,
}

/// Error type for sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("Empty command")]
    EmptyCommand,

    #[error("Cannot resolve user {0:?} in the root filesystem")]
    UnknownUser(String),

    #[error("Cannot expose agent socket at {target}: {source}")]
    MountSocket { target: String, source: io::Error },
}

/// Runs commands against a root filesystem.
pub trait Sandbox: Send + Sync {
    fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError>;
}

/// Process-based sandbox.
///
/// With an empty runner the command is executed natively under `chroot(2)`
/// (requires root). Otherwise it is run as `<runner...> <rootfs> <argv...>`.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandbox {
    runner: Vec<String>,
}

impl ProcessSandbox {
    pub fn new(runner: Vec<String>) -> Self {
        Self { runner }
    }

    fn command(&self, request: &RunRequest) -> Result<Command, SandboxError> {
        let (program, args) = request.argv.split_first().ok_or(SandboxError::EmptyCommand)?;

        let mut env = request.env.clone();
        env.entry("PATH".to_string()).or_insert_with(|| DEFAULT_PATH.to_string());
        if let Some(agent) = request.mounts.iter().find(|m| m.kind == MountKind::Ssh && is_socket(&m.source)) {
            env.entry("SSH_AUTH_SOCK".to_string()).or_insert_with(|| agent.target.clone());
        }

        if let Some((runner, runner_args)) = self.runner.split_first() {
            let mut cmd = Command::new(runner);
            cmd.args(runner_args).arg(&request.rootfs);
            if request.workdir != "/" {
                // Runners get no working directory; enter it through the shell.
                cmd.args(["/bin/sh", "-c", "cd \"$0\" && exec \"$@\"", request.workdir.as_str()]);
            }
            if request.user.is_some() {
                warn!(runner = %runner, "USER is not applied when running through an external runner");
            }
            cmd.arg(program).args(args);
            cmd.env_clear().envs(&env);
            return Ok(cmd);
        }

        let owner = match &request.user {
            Some(user) => Some(resolve_owner(&request.rootfs, user)?),
            None => None,
        };
        let root = CString::new(request.rootfs.as_os_str().as_bytes()).map_err(io::Error::other)?;
        let workdir = CString::new(request.workdir.as_bytes()).map_err(io::Error::other)?;

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear().envs(&env);

        use std::os::unix::process::CommandExt;
        // SAFETY: the closure only calls async-signal-safe libc functions on
        // data prepared before fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::chroot(root.as_ptr()) != 0 || libc::chdir(workdir.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if let Some(owner) = owner {
                    if libc::setgroups(0, std::ptr::null()) != 0
                        || libc::setgid(owner.gid as libc::gid_t) != 0
                        || libc::setuid(owner.uid as libc::uid_t) != 0
                    {
                        return Err(io::Error::last_os_error());
                    }
                }
                Ok(())
            });
        }
        Ok(cmd)
    }
}

impl Sandbox for ProcessSandbox {
    fn run(&self, request: &RunRequest) -> Result<RunOutcome, SandboxError> {
        let before = TreeSnapshot::capture(&request.rootfs)?;

        // WORKDIR is created on demand, as part of the step's delta.
        fs::create_dir_all(request.rootfs.join(request.workdir.trim_start_matches('/')))?;

        let placed = place_mounts(&request.rootfs, &request.mounts)?;
        let result = self.command(request).and_then(|mut cmd| {
            info!(command = %request.argv.join(" "), platform = %request.platform, "Running build step");
            cmd.stdin(Stdio::null())
                .output()
                .map_err(|source| SandboxError::Spawn { program: request.argv[0].clone(), source })
        });
        placed.remove();
        let output = result?;

        let exit_code = match output.status.code() {
            Some(code) => code,
            // Killed by a signal.
            None => {
                use std::os::unix::process::ExitStatusExt;
                128 + output.status.signal().unwrap_or(0)
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        for line in combined.lines() {
            debug!(target: "img::step", "{}", line);
        }

        let delta = layer::diff(&before, &request.rootfs)?;
        Ok(RunOutcome { delta, exit_code, output: tail(&combined, OUTPUT_TAIL_LINES) })
    }
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    fs::metadata(path).map(|m| m.file_type().is_socket()).unwrap_or(false)
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

/// Mount material placed into a root filesystem; removed after the run.
#[derive(Debug, Default)]
struct PlacedMounts {
    files: Vec<PathBuf>,
    /// Entries that were at a target before the run: (moved-aside path, target).
    shadowed: Vec<(PathBuf, PathBuf)>,
    /// Directories created for targets, deepest first.
    dirs: Vec<PathBuf>,
}

impl PlacedMounts {
    /// Makes `mount` visible at its target: files are copied, agent sockets hard-linked.
    fn place(&mut self, rootfs: &Path, mount: &SandboxMount) -> Result<(), SandboxError> {
        let Some(relative) = layer::sanitize(Path::new(&mount.target)) else {
            return Ok(());
        };
        let Some(name) = relative.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return Ok(());
        };
        let target = rootfs.join(layer::resolve_parent(rootfs, &relative)?);

        let mut missing = Vec::new();
        let mut dir = target.parent();
        while let Some(d) = dir {
            if d.exists() || d == rootfs {
                break;
            }
            missing.push(d.to_path_buf());
            dir = d.parent();
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        self.dirs.extend(missing);

        // Whatever the image has at the target is moved aside and restored afterwards.
        if fs::symlink_metadata(&target).is_ok() {
            let aside = target.with_file_name(format!(".img-shadowed-{}-{}", name, uuid::Uuid::new_v4().simple()));
            fs::rename(&target, &aside)?;
            self.shadowed.push((aside, target.clone()));
        }

        if is_socket(&mount.source) {
            link_socket(&mount.source, &target, &mount.target)?;
        } else {
            fs::copy(&mount.source, &target)?;
        }
        self.files.push(target);
        Ok(())
    }

    fn remove(self) {
        for file in &self.files {
            if let Err(e) = fs::remove_file(file) {
                warn!(path = %file.display(), error = %e, "Failed to remove mount target");
            }
        }
        for (aside, target) in self.shadowed.iter().rev() {
            if let Err(e) = fs::rename(aside, target) {
                warn!(path = %target.display(), error = %e, "Failed to restore shadowed file");
            }
        }
        for dir in &self.dirs {
            // Only removes directories left empty.
            let _ = fs::remove_dir(dir);
        }
    }
}

/// Places every mount, undoing the ones already placed if one fails.
fn place_mounts(rootfs: &Path, mounts: &[SandboxMount]) -> Result<PlacedMounts, SandboxError> {
    let mut placed = PlacedMounts::default();
    for mount in mounts {
        if let Err(e) = placed.place(rootfs, mount) {
            placed.remove();
            return Err(e);
        }
    }
    Ok(placed)
}

/// Hard-links an agent socket into the root filesystem.
fn link_socket(source: &Path, target: &Path, display: &str) -> Result<(), SandboxError> {
    fs::hard_link(source, target).map_err(|source| SandboxError::MountSocket { target: display.to_string(), source })
}

/// Resolves `user[:group]` against the root filesystem's passwd and group files.
pub fn resolve_owner(rootfs: &Path, spec: &str) -> Result<Owner, SandboxError> {
    let (user, group) = match spec.split_once(':') {
        Some((u, g)) => (u, Some(g)),
        None => (spec, None),
    };

    let passwd = fs::read_to_string(rootfs.join("etc/passwd")).unwrap_or_default();
    let (uid, primary_gid) = match user.parse::<u64>() {
        Ok(uid) => {
            let gid = lookup(&passwd, 2, &uid.to_string()).and_then(|f| f[3].parse().ok()).unwrap_or(uid);
            (uid, gid)
        }
        Err(_) => {
            let fields = lookup(&passwd, 0, user).ok_or_else(|| SandboxError::UnknownUser(spec.to_string()))?;
            let uid = fields[2].parse().map_err(|_| SandboxError::UnknownUser(spec.to_string()))?;
            let gid = fields[3].parse().map_err(|_| SandboxError::UnknownUser(spec.to_string()))?;
            (uid, gid)
        }
    };

    let gid = match group {
        None => primary_gid,
        Some(group) => match group.parse::<u64>() {
            Ok(gid) => gid,
            Err(_) => {
                let groups = fs::read_to_string(rootfs.join("etc/group")).unwrap_or_default();
                lookup(&groups, 0, group)
                    .and_then(|f| f[2].parse().ok())
                    .ok_or_else(|| SandboxError::UnknownUser(spec.to_string()))?
            }
        },
    };

    Ok(Owner { uid, gid })
}

/// Finds the colon-separated record whose `column` equals `value`.
fn lookup<'a>(file: &'a str, column: usize, value: &str) -> Option<Vec<&'a str>> {
    file.lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|fields| fields.len() >= 4 && fields[column] == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs_with_accounts() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("etc")).unwrap();
        fs::write(dir.path().join("etc/passwd"), "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1001::/home/app:/bin/sh\n")
            .unwrap();
        fs::write(dir.path().join("etc/group"), "root:x:0:\nstaff:x:50:\napp:x:1001:\n").unwrap();
        dir
    }

    #[test]
    fn test_resolve_owner() {
        let root = rootfs_with_accounts();
        assert_eq!(resolve_owner(root.path(), "app").unwrap(), Owner { uid: 1000, gid: 1001 });
        assert_eq!(resolve_owner(root.path(), "app:staff").unwrap(), Owner { uid: 1000, gid: 50 });
        assert_eq!(resolve_owner(root.path(), "42:7").unwrap(), Owner { uid: 42, gid: 7 });
        assert_eq!(resolve_owner(root.path(), "1000").unwrap(), Owner { uid: 1000, gid: 1001 });
        assert!(matches!(resolve_owner(root.path(), "ghost"), Err(SandboxError::UnknownUser(_))));
    }

    #[test]
    fn test_place_and_remove_mounts() {
        let root = TempDir::new().unwrap();
        let secret_dir = TempDir::new().unwrap();
        let secret = secret_dir.path().join("s1");
        fs::write(&secret, "hunter2").unwrap();

        let mounts = vec![SandboxMount { kind: MountKind::Secret, source: secret, target: "/run/secrets/s1".into() }];
        let placed = place_mounts(root.path(), &mounts).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("run/secrets/s1")).unwrap(), "hunter2");

        placed.remove();
        assert!(!root.path().join("run").exists());
    }

    #[test]
    fn test_mount_shadows_existing_file() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("etc/app")).unwrap();
        fs::write(root.path().join("etc/app/token"), "from-image").unwrap();
        let secret_dir = TempDir::new().unwrap();
        let secret = secret_dir.path().join("token");
        fs::write(&secret, "from-secret").unwrap();

        let mounts = vec![SandboxMount { kind: MountKind::Secret, source: secret, target: "/etc/app/token".into() }];
        let placed = place_mounts(root.path(), &mounts).unwrap();
        assert_eq!(fs::read_to_string(root.path().join("etc/app/token")).unwrap(), "from-secret");

        placed.remove();
        assert_eq!(fs::read_to_string(root.path().join("etc/app/token")).unwrap(), "from-image");
        let names: Vec<_> = fs::read_dir(root.path().join("etc/app")).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(names, vec!["token"]);
    }

    #[test]
    fn test_agent_socket_mount() {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::net::UnixListener;

        let root = TempDir::new().unwrap();
        let agent_dir = TempDir::new().unwrap();
        let socket = agent_dir.path().join("agent.sock");
        let _listener = UnixListener::bind(&socket).unwrap();

        let mount = SandboxMount { kind: MountKind::Ssh, source: socket.clone(), target: "/run/ssh/agent.sock".into() };
        let request = RunRequest {
            rootfs: root.path().to_path_buf(),
            argv: vec!["true".into()],
            env: BTreeMap::new(),
            user: None,
            workdir: "/".into(),
            mounts: vec![mount.clone()],
            platform: Platform::host(),
        };
        let cmd = ProcessSandbox::new(vec!["runner".into()]).command(&request).unwrap();
        let agent_env = cmd.get_envs().find(|(k, _)| *k == "SSH_AUTH_SOCK").and_then(|(_, v)| v);
        assert_eq!(agent_env, Some(std::ffi::OsStr::new("/run/ssh/agent.sock")));

        let placed = place_mounts(root.path(), &[mount]).unwrap();
        let linked = fs::symlink_metadata(root.path().join("run/ssh/agent.sock")).unwrap();
        assert!(linked.file_type().is_socket());
        placed.remove();
        assert!(!root.path().join("run").exists());

        let err = link_socket(&socket, &root.path().join("absent/agent.sock"), "/absent/agent.sock").unwrap_err();
        assert!(matches!(err, SandboxError::MountSocket { .. }));
    }

    #[test]
    fn test_runner_command_line() {
        let sandbox = ProcessSandbox::new(vec!["runner".into(), "--flag".into()]);
        let request = RunRequest {
            rootfs: PathBuf::from("/tmp/root"),
            argv: vec!["make".into(), "all".into()],
            env: BTreeMap::new(),
            user: None,
            workdir: "/src".into(),
            mounts: Vec::new(),
            platform: Platform::host(),
        };

        let cmd = sandbox.command(&request).unwrap();
        assert_eq!(cmd.get_program(), "runner");
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec!["--flag", "/tmp/root", "/bin/sh", "-c", "cd \"$0\" && exec \"$@\"", "/src", "make", "all"]
        );

        let envs: Vec<_> = cmd.get_envs().filter_map(|(k, v)| Some((k.to_owned(), v?.to_owned()))).collect();
        assert!(envs.iter().any(|(k, v)| k == "PATH" && v == DEFAULT_PATH));
    }

    #[test]
    fn test_empty_command() {
        let sandbox = ProcessSandbox::default();
        let request = RunRequest {
            rootfs: PathBuf::from("/"),
            argv: Vec::new(),
            env: BTreeMap::new(),
            user: None,
            workdir: "/".into(),
            mounts: Vec::new(),
            platform: Platform::host(),
        };
        assert!(matches!(sandbox.command(&request), Err(SandboxError::EmptyCommand)));
    }

    #[test]
    fn test_output_tail() {
        let text = (1..=30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let t = tail(&text, 3);
        assert_eq!(t, "28\n29\n30");
    }
}
