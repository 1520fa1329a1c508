//! Scoped access to build secrets and SSH credentials.
//!
//! Secrets and SSH sources are registered once per build. A RUN step acquires
//! the ones it declares; the returned [`ScopedMounts`] guard owns private
//! copies of the material and releases everything when dropped. At most one
//! step holds a given id at a time.
//!
//! SSH ids backed by key files get an `ssh-agent` of their own for the step,
//! loaded with those keys; the step only ever sees the agent socket.

use crate::builder::options::{SecretSpec, SshSpec};
use crate::builder::parser::{MountKind, RunMount};
use crate::builder::sandbox::SandboxMount;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// How long a scoped agent gets to create its socket.
const AGENT_START_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for mount acquisition.
#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("Cannot read {kind:?} source {id:?} at {}: {source}", path.display())]
    Unreadable { kind: MountKind, id: String, path: PathBuf, source: io::Error },

    #[error("Required {kind:?} mount {id:?} was not provided")]
    MissingRequired { kind: MountKind, id: String },

    #[error("SSH id {0:?} forwards the agent, but SSH_AUTH_SOCK is not set")]
    NoAgent(String),

    #[error("Cannot start an agent for SSH id {id:?}: {reason}")]
    Agent { id: String, reason: String },

    #[error("Failed to prepare mount directory: {0}")]
    Io(#[from] io::Error),
}

/// Where an SSH id gets its credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshSource {
    /// Private key files, served by an agent started per use.
    Keys(Vec<PathBuf>),
    /// A running agent's socket, passed by path.
    Agent(PathBuf),
}

/// Registry of mount sources with per-id exclusive access.
#[derive(Debug, Default)]
pub struct MountManager {
    secrets: HashMap<String, PathBuf>,
    ssh: HashMap<String, SshSource>,
    locks: BTreeMap<(MountKind, String), Arc<Mutex<()>>>,
    /// Parent of the per-step material directories; the system temp dir if unset.
    temp_dir: Option<PathBuf>,
}

impl MountManager {
    /// Registers the build's sources. `agent_socket` backs ssh ids given without key paths.
    pub fn new(secrets: &[SecretSpec], ssh: &[SshSpec], agent_socket: Option<&Path>) -> Result<Self, MountError> {
        let mut manager = Self::default();

        for secret in secrets {
            manager.secrets.insert(secret.id.clone(), secret.source.clone());
            manager.locks.insert((MountKind::Secret, secret.id.clone()), Arc::default());
        }

        for spec in ssh {
            let source = if spec.paths.is_empty() {
                let socket = agent_socket.ok_or_else(|| MountError::NoAgent(spec.id.clone()))?;
                SshSource::Agent(socket.to_path_buf())
            } else {
                SshSource::Keys(spec.paths.clone())
            };
            manager.ssh.insert(spec.id.clone(), source);
            manager.locks.insert((MountKind::Ssh, spec.id.clone()), Arc::default());
        }

        debug!(secrets = manager.secrets.len(), ssh = manager.ssh.len(), "Registered mount sources");
        Ok(manager)
    }

    /// Keeps per-step material under `dir`, next to the root filesystems it is linked into.
    pub fn with_temp_dir(mut self, dir: PathBuf) -> Self {
        self.temp_dir = Some(dir);
        self
    }

    pub fn is_registered(&self, kind: MountKind, id: &str) -> bool {
        self.locks.contains_key(&(kind, id.to_string()))
    }

    /// Acquires the declared mounts for one step.
    ///
    /// Unregistered ids are left out (the target stays absent) unless the
    /// mount is marked required.
    pub async fn acquire(&self, mounts: &[RunMount]) -> Result<ScopedMounts, MountError> {
        // Ids are locked in sorted order so concurrent steps cannot deadlock.
        let mut ids = BTreeSet::new();
        for mount in mounts {
            let key = (mount.kind, mount.id.clone());
            if self.locks.contains_key(&key) {
                ids.insert(key);
            } else if mount.required {
                return Err(MountError::MissingRequired { kind: mount.kind, id: mount.id.clone() });
            } else {
                debug!(kind = ?mount.kind, id = %mount.id, "Mount source not provided, leaving target absent");
            }
        }

        let mut guards = Vec::with_capacity(ids.len());
        for key in &ids {
            if let Some(lock) = self.locks.get(key) {
                guards.push(lock.clone().lock_owned().await);
            }
        }

        let dir = match &self.temp_dir {
            Some(parent) => {
                fs::create_dir_all(parent)?;
                tempfile::Builder::new().prefix("img-mounts-").tempdir_in(parent)?
            }
            None => tempfile::Builder::new().prefix("img-mounts-").tempdir()?,
        };
        fs::set_permissions(dir.path(), fs::Permissions::from_mode(0o700))?;

        // Dropped on error, which stops agents already started.
        let mut scoped = ScopedMounts { mounts: Vec::new(), agents: Vec::new(), dir: None, _guards: guards };
        for (n, mount) in mounts.iter().enumerate() {
            if !ids.contains(&(mount.kind, mount.id.clone())) {
                continue;
            }
            match mount.kind {
                MountKind::Secret => {
                    let Some(source) = self.secrets.get(&mount.id) else { continue };
                    let copy = private_copy(dir.path(), &format!("secret-{}", n), source)
                        .map_err(|e| unreadable(mount, source, e))?;
                    scoped.mounts.push(SandboxMount { kind: mount.kind, source: copy, target: mount.target.clone() });
                }
                MountKind::Ssh => match self.ssh.get(&mount.id) {
                    Some(SshSource::Agent(socket)) => {
                        fs::metadata(socket).map_err(|e| unreadable(mount, socket, e))?;
                        scoped.mounts.push(SandboxMount {
                            kind: mount.kind,
                            source: socket.clone(),
                            target: mount.target.clone(),
                        });
                    }
                    Some(SshSource::Keys(keys)) => {
                        let mut copies = Vec::with_capacity(keys.len());
                        for (i, key) in keys.iter().enumerate() {
                            let copy = private_copy(dir.path(), &format!("ssh-{}-{}", n, i), key)
                                .map_err(|e| unreadable(mount, key, e))?;
                            copies.push(copy);
                        }
                        let socket = dir.path().join(format!("agent-{}.sock", n));
                        let agent = start_agent(&mount.id, &socket, &copies).await;
                        // Key copies are loaded (or useless) either way.
                        for copy in &copies {
                            let _ = fs::remove_file(copy);
                        }
                        scoped.agents.push(agent?);
                        scoped.mounts.push(SandboxMount { kind: mount.kind, source: socket, target: mount.target.clone() });
                    }
                    None => {}
                },
            }
        }

        debug!(acquired = ids.len(), mounts = scoped.mounts.len(), "Acquired mounts");
        scoped.dir = Some(dir);
        Ok(scoped)
    }
}

/// Starts `ssh-agent` listening on `socket` and loads `keys` into it.
async fn start_agent(id: &str, socket: &Path, keys: &[PathBuf]) -> Result<Child, MountError> {
    let failed = |reason: String| MountError::Agent { id: id.to_string(), reason };

    let mut agent = Command::new("ssh-agent")
        .arg("-D")
        .arg("-a")
        .arg(socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| failed(format!("ssh-agent: {}", e)))?;

    let deadline = Instant::now() + AGENT_START_TIMEOUT;
    while !socket.exists() {
        if let Some(status) = agent.try_wait()? {
            return Err(failed(format!("ssh-agent exited with {}", status)));
        }
        if Instant::now() >= deadline {
            return Err(failed("timed out waiting for the agent socket".to_string()));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let added = Command::new("ssh-add")
        .args(keys)
        .env("SSH_AUTH_SOCK", socket)
        .env("SSH_ASKPASS_REQUIRE", "never")
        .env_remove("DISPLAY")
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| failed(format!("ssh-add: {}", e)))?;
    if !added.status.success() {
        return Err(failed(format!("ssh-add: {}", String::from_utf8_lossy(&added.stderr).trim())));
    }

    info!(id = %id, keys = keys.len(), "Started scoped SSH agent");
    Ok(agent)
}

fn unreadable(mount: &RunMount, path: &Path, source: io::Error) -> MountError {
    MountError::Unreadable { kind: mount.kind, id: mount.id.clone(), path: path.to_path_buf(), source }
}

/// Copies `source` into `dir` as an owner-read-only file.
fn private_copy(dir: &Path, name: &str, source: &Path) -> io::Result<PathBuf> {
    let data = fs::read(source)?;
    let path = dir.join(name);
    let mut file = fs::OpenOptions::new().write(true).create_new(true).mode(0o400).open(&path)?;
    file.write_all(&data)?;
    Ok(path)
}

/// Mount material held for one step. Dropping it stops scoped agents,
/// deletes the private copies and releases the ids.
#[derive(Debug)]
pub struct ScopedMounts {
    mounts: Vec<SandboxMount>,
    agents: Vec<Child>,
    dir: Option<tempfile::TempDir>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl ScopedMounts {
    pub fn mounts(&self) -> &[SandboxMount] {
        &self.mounts
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

impl Drop for ScopedMounts {
    fn drop(&mut self) {
        for agent in &mut self.agents {
            if let Err(e) = agent.start_kill() {
                warn!(error = %e, "Failed to stop scoped SSH agent");
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(path = %path.display(), error = %e, "Failed to remove mount material");
            }
        }
        debug!(mounts = self.mounts.len(), "Released mounts");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn secret_mount(id: &str, required: bool) -> RunMount {
        RunMount { kind: MountKind::Secret, id: id.into(), target: format!("/run/secrets/{}", id), required }
    }

    fn setup() -> (TempDir, MountManager) {
        let dir = TempDir::new().unwrap();
        let s1 = dir.path().join("s1.txt");
        fs::write(&s1, "secret-one").unwrap();
        let key = dir.path().join("id_ed25519");
        fs::write(&key, "PRIVATE KEY").unwrap();

        let secrets = vec![SecretSpec { id: "s1".into(), source: s1 }];
        let ssh = vec![SshSpec { id: "git".into(), paths: vec![key] }];
        let manager = MountManager::new(&secrets, &ssh, None).unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_secret_copy_is_private_and_removed() {
        let (_dir, manager) = setup();
        let scoped = manager.acquire(&[secret_mount("s1", false)]).await.unwrap();

        let mount = &scoped.mounts()[0];
        assert_eq!(mount.target, "/run/secrets/s1");
        assert_eq!(fs::read_to_string(&mount.source).unwrap(), "secret-one");
        let mode = fs::metadata(&mount.source).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);

        let copy = mount.source.clone();
        drop(scoped);
        assert!(!copy.exists());
    }

    #[tokio::test]
    async fn test_unknown_id_is_absent() {
        let (_dir, manager) = setup();
        let scoped = manager.acquire(&[secret_mount("nope", false)]).await.unwrap();
        assert!(scoped.is_empty());

        let err = manager.acquire(&[secret_mount("nope", true)]).await.unwrap_err();
        assert!(matches!(err, MountError::MissingRequired { .. }));
    }

    #[tokio::test]
    async fn test_unreadable_source() {
        let secrets = vec![SecretSpec { id: "gone".into(), source: PathBuf::from("/nonexistent/secret") }];
        let manager = MountManager::new(&secrets, &[], None).unwrap();
        let err = manager.acquire(&[secret_mount("gone", false)]).await.unwrap_err();
        assert!(matches!(err, MountError::Unreadable { .. }));
    }

    fn ssh_mount(id: &str) -> RunMount {
        RunMount { kind: MountKind::Ssh, id: id.into(), target: "/run/buildkit/ssh_agent.0".into(), required: false }
    }

    fn have_openssh() -> bool {
        ["ssh-agent", "ssh-add", "ssh-keygen"].iter().all(|tool| {
            std::process::Command::new("sh")
                .arg("-c")
                .arg(format!("command -v {}", tool))
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        })
    }

    #[tokio::test]
    async fn test_ssh_keys_are_served_by_scoped_agent() {
        use std::os::unix::fs::FileTypeExt;

        if !have_openssh() {
            eprintln!("OpenSSH tools not installed, skipping");
            return;
        }
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("id_ed25519");
        let status = std::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-f"])
            .arg(&key)
            .status()
            .unwrap();
        assert!(status.success());

        let ssh = vec![SshSpec { id: "git".into(), paths: vec![key] }];
        let manager = MountManager::new(&[], &ssh, None).unwrap().with_temp_dir(dir.path().join("tmp"));
        let scoped = manager.acquire(&[ssh_mount("git")]).await.unwrap();

        assert_eq!(scoped.mounts().len(), 1);
        let mount = scoped.mounts()[0].clone();
        assert_eq!(mount.target, "/run/buildkit/ssh_agent.0");
        assert!(mount.source.starts_with(dir.path().join("tmp")));
        assert!(fs::metadata(&mount.source).unwrap().file_type().is_socket());

        let listed = std::process::Command::new("ssh-add").arg("-l").env("SSH_AUTH_SOCK", &mount.source).output().unwrap();
        assert!(listed.status.success(), "{}", String::from_utf8_lossy(&listed.stderr));
        assert!(String::from_utf8_lossy(&listed.stdout).contains("ED25519"));

        drop(scoped);
        assert!(!mount.source.exists());
    }

    #[tokio::test]
    async fn test_bad_ssh_key_fails_acquire() {
        let (dir, manager) = setup();
        if have_openssh() {
            let err = manager.acquire(&[ssh_mount("git")]).await.unwrap_err();
            assert!(matches!(err, MountError::Agent { .. }));
        }

        let ssh = vec![SshSpec { id: "git".into(), paths: vec![dir.path().join("missing_key")] }];
        let manager = MountManager::new(&[], &ssh, None).unwrap();
        let err = manager.acquire(&[ssh_mount("git")]).await.unwrap_err();
        assert!(matches!(err, MountError::Unreadable { .. }));
    }

    #[tokio::test]
    async fn test_agent_forwarding() {
        let agent_spec = vec![SshSpec { id: "default".into(), paths: Vec::new() }];
        assert!(matches!(MountManager::new(&[], &agent_spec, None), Err(MountError::NoAgent(_))));

        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("agent.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&socket).unwrap();
        let manager = MountManager::new(&[], &agent_spec, Some(&socket)).unwrap();
        assert!(manager.is_registered(MountKind::Ssh, "default"));

        let scoped = manager.acquire(&[ssh_mount("default")]).await.unwrap();
        assert_eq!(scoped.mounts()[0].source, socket);
    }

    #[tokio::test]
    async fn test_same_id_is_exclusive() {
        let (_dir, manager) = setup();
        let manager = Arc::new(manager);

        let first = manager.acquire(&[secret_mount("s1", false)]).await.unwrap();

        let contender = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.acquire(&[secret_mount("s1", false)]).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap().unwrap();
    }
}
