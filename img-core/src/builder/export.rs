//! Output sinks for finished builds.
//!
//! - `local`: unpack the filesystem into a directory
//! - `tar`: stream the filesystem as a tar archive (file or stdout)
//! - `oci`: OCI image layout, as a directory or a `.tar` of it
//! - `docker`: docker-save archive (`manifest.json` next to an OCI layout)
//! - `image`: register in the local image store
//!
//! Every output is validated before any work is done, and files and
//! directories only appear at their destination once complete.
//!
//! Directory sinks refuse a non-empty destination. File sinks (`tar`,
//! `oci` with a `.tar` dest, `docker`) atomically replace an existing file.

use crate::builder::cas::{digest_hex, digest_of, BlobStore};
use crate::builder::executor::FinalResult;
use crate::builder::image::{
    Descriptor, ImageIndex, ImageManifest, OciPlatform, ANNOTATION_REF_NAME, MEDIA_TYPE_CONFIG, MEDIA_TYPE_INDEX,
    MEDIA_TYPE_LAYER, MEDIA_TYPE_LAYER_GZIP, MEDIA_TYPE_MANIFEST,
};
use crate::builder::layer;
use crate::builder::options::{Compression, OutputKind, OutputSpec};
use crate::builder::store::{self, ImageStore, StoreError};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument};

/// Error type for exports.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Invalid output configuration: {0}")]
    InvalidConfig(String),

    #[error("Output type {kind} takes a single platform, but {count} were requested")]
    MultiPlatform { kind: OutputKind, count: usize },

    #[error("Destination {} already exists and is not empty", .0.display())]
    DestinationExists(PathBuf),

    #[error("Layer {0} is missing from the blob store")]
    MissingBlob(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image store error: {0}")]
    Store(#[from] StoreError),
}

/// What an export produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportedArtifact {
    /// Filesystem unpacked into a directory.
    Directory(PathBuf),
    /// Filesystem tar; `None` means it went to stdout.
    Archive(Option<PathBuf>),
    /// OCI layout or docker archive with the digest of its image index.
    Layout { path: PathBuf, digest: String },
    /// Names registered in the image store.
    Images { references: Vec<String>, digest: String },
}

impl fmt::Display for ExportedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExportedArtifact::Directory(path) => write!(f, "directory {}", path.display()),
            ExportedArtifact::Archive(Some(path)) => write!(f, "archive {}", path.display()),
            ExportedArtifact::Archive(None) => write!(f, "archive on stdout"),
            ExportedArtifact::Layout { path, digest } => write!(f, "{} ({})", path.display(), digest),
            ExportedArtifact::Images { references, digest } => write!(f, "{} ({})", references.join(", "), digest),
        }
    }
}

/// Checks that `spec` can take `platforms` results.
///
/// Runs before the build so that a bad output never costs a build.
pub fn validate(spec: &OutputSpec, platforms: usize) -> Result<(), ExportError> {
    let invalid = |msg: &str| Err(ExportError::InvalidConfig(format!("type={}: {}", spec.kind, msg)));

    if platforms == 0 {
        return invalid("no platforms to export");
    }

    match spec.kind {
        OutputKind::Local | OutputKind::Tar => {
            if platforms > 1 {
                return Err(ExportError::MultiPlatform { kind: spec.kind, count: platforms });
            }
            if !spec.names.is_empty() {
                return invalid("name= only applies to image, oci and docker outputs");
            }
            if spec.compression.is_some() {
                return invalid("compression= only applies to oci and docker outputs");
            }
        }
        OutputKind::Oci | OutputKind::Docker => {}
        OutputKind::Image => {
            if spec.dest.is_some() {
                return invalid("dest= is not supported; images are stored locally");
            }
            if spec.names.is_empty() {
                return invalid("at least one name is required (name=<ref> or -t)");
            }
            if spec.compression.is_some() {
                return invalid("compression= only applies to oci and docker outputs");
            }
        }
    }

    if let Some(name) = spec.names.iter().find(|n| !store::is_valid_reference(n)) {
        return invalid(&format!("invalid image name {:?}", name));
    }

    match spec.kind {
        OutputKind::Tar | OutputKind::Image => {}
        OutputKind::Local | OutputKind::Oci | OutputKind::Docker => {
            let Some(dest) = spec.dest.as_ref().filter(|_| !spec.is_stdout()) else {
                return invalid("dest=<path> is required");
            };
            let is_dir_sink = spec.kind == OutputKind::Local || (spec.kind == OutputKind::Oci && !is_tar_path(dest));
            if is_dir_sink && !is_empty_or_missing(dest)? {
                return Err(ExportError::DestinationExists(dest.clone()));
            }
        }
    }

    Ok(())
}

fn is_tar_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "tar")
}

fn is_empty_or_missing(path: &Path) -> io::Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotADirectory => Ok(false),
        Err(e) => Err(e),
    }
}

/// `docker load` entry of `manifest.json`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct DockerManifestEntry {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Blobs written for one export.
struct WrittenIndex {
    index: Descriptor,
    /// Config and layer digests per platform, in result order.
    images: Vec<(String, Vec<String>)>,
}

/// Blob directory of an OCI layout (`blobs/sha256/<hex>`).
struct LayoutBlobs {
    dir: PathBuf,
}

impl LayoutBlobs {
    fn create(root: &Path) -> io::Result<Self> {
        let dir = root.join("blobs").join("sha256");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, digest: &str) -> io::Result<PathBuf> {
        let hex = digest_hex(digest)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid digest {}", digest)))?;
        Ok(self.dir.join(hex))
    }
}

impl BlobStore for LayoutBlobs {
    fn get(&self, digest: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(digest)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, data: &[u8]) -> io::Result<String> {
        let digest = digest_of(data);
        let path = self.path(&digest)?;
        if !path.exists() {
            fs::write(path, data)?;
        }
        Ok(digest)
    }

    fn contains(&self, digest: &str) -> bool {
        self.path(digest).map(|p| p.exists()).unwrap_or(false)
    }
}

/// Where `dest=-` archives are written.
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// Writes finished builds to sinks.
pub struct Exporter {
    blobs: Arc<dyn BlobStore>,
    images: Arc<ImageStore>,
    scratch_dir: PathBuf,
    stdout: SharedWriter,
}

impl Exporter {
    pub fn new(blobs: Arc<dyn BlobStore>, images: Arc<ImageStore>, scratch_dir: PathBuf) -> Self {
        Self { blobs, images, scratch_dir, stdout: Arc::new(Mutex::new(io::stdout())) }
    }

    /// Sends stdout archives to `writer` instead of the process stdout.
    pub fn with_stdout(mut self, writer: SharedWriter) -> Self {
        self.stdout = writer;
        self
    }

    /// Exports `results` (one per platform) as described by `spec`.
    #[instrument(skip_all, fields(kind = %spec.kind, platforms = results.len()))]
    pub fn export(&self, results: &[FinalResult], spec: &OutputSpec) -> Result<ExportedArtifact, ExportError> {
        validate(spec, results.len())?;
        self.check_blobs(results)?;

        let artifact = match spec.kind {
            OutputKind::Local => self.export_local(&results[0], require_dest(spec)?)?,
            OutputKind::Tar => self.export_tar(&results[0], spec)?,
            OutputKind::Oci | OutputKind::Docker => self.export_layout(results, spec)?,
            OutputKind::Image => self.export_image(results, &spec.names)?,
        };

        info!(artifact = %artifact, "Export complete");
        Ok(artifact)
    }

    /// Fails before any output exists if a layer is not available.
    fn check_blobs(&self, results: &[FinalResult]) -> Result<(), ExportError> {
        for layer in results.iter().flat_map(|r| &r.rootfs.layers) {
            if !self.blobs.contains(&layer.digest) {
                return Err(ExportError::MissingBlob(layer.digest.clone()));
            }
        }
        Ok(())
    }

    fn scratch(&self) -> io::Result<tempfile::TempDir> {
        fs::create_dir_all(&self.scratch_dir)?;
        tempfile::Builder::new().prefix("img-export-").tempdir_in(&self.scratch_dir)
    }

    fn layer(&self, digest: &str) -> Result<Vec<u8>, ExportError> {
        self.blobs.get(digest)?.ok_or_else(|| ExportError::MissingBlob(digest.to_string()))
    }

    /// Unpacks every layer of `result` into `dir`.
    fn materialize(&self, result: &FinalResult, dir: &Path) -> Result<(), ExportError> {
        for layer in &result.rootfs.layers {
            layer::apply_layer(dir, self.layer(&layer.digest)?.as_slice())?;
        }
        Ok(())
    }

    fn export_local(&self, result: &FinalResult, dest: &Path) -> Result<ExportedArtifact, ExportError> {
        let staging = tempfile::Builder::new().prefix(".img-export-").tempdir_in(parent_of(dest))?;
        let root = staging.path().join("rootfs");
        fs::create_dir(&root)?;
        self.materialize(result, &root)?;

        move_into_place(&root, dest)?;
        debug!(dest = %dest.display(), "Unpacked filesystem");
        Ok(ExportedArtifact::Directory(dest.to_path_buf()))
    }

    fn export_tar(&self, result: &FinalResult, spec: &OutputSpec) -> Result<ExportedArtifact, ExportError> {
        let scratch = self.scratch()?;
        self.materialize(result, scratch.path())?;

        if spec.is_stdout() {
            let mut out = self.stdout.lock().map_err(|_| io::Error::other("stdout writer poisoned"))?;
            let out = layer::pack_dir(scratch.path(), &mut *out)?;
            out.flush()?;
            return Ok(ExportedArtifact::Archive(None));
        }

        let dest = require_dest(spec)?;
        let file = tempfile::NamedTempFile::new_in(parent_of(dest))?;
        let mut file = layer::pack_dir(scratch.path(), file)?;
        file.flush()?;
        file.persist(dest).map_err(|e| e.error)?;
        Ok(ExportedArtifact::Archive(Some(dest.to_path_buf())))
    }

    fn export_layout(&self, results: &[FinalResult], spec: &OutputSpec) -> Result<ExportedArtifact, ExportError> {
        let dest = require_dest(spec)?;
        let staging = tempfile::Builder::new().prefix(".img-export-").tempdir_in(parent_of(dest))?;
        let root = staging.path().join("layout");
        fs::create_dir(&root)?;

        let blobs = LayoutBlobs::create(&root)?;
        let written = self.write_index(results, spec.compression.unwrap_or_default(), &blobs)?;

        let mut entries = Vec::new();
        if spec.names.is_empty() {
            entries.push(written.index.clone());
        }
        for name in &spec.names {
            let mut entry = written.index.clone();
            entry.annotations.get_or_insert_with(Default::default).insert(ANNOTATION_REF_NAME.to_string(), name.clone());
            entries.push(entry);
        }
        fs::write(root.join("index.json"), serde_json::to_vec_pretty(&ImageIndex::new(entries))?)?;
        fs::write(root.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)?;

        if spec.kind == OutputKind::Docker {
            let manifest: Vec<DockerManifestEntry> = written
                .images
                .iter()
                .map(|(config, layers)| DockerManifestEntry {
                    config: blob_member(config),
                    repo_tags: spec.names.clone(),
                    layers: layers.iter().map(|l| blob_member(l)).collect(),
                })
                .collect();
            fs::write(root.join("manifest.json"), serde_json::to_vec_pretty(&manifest)?)?;
        }

        if spec.kind == OutputKind::Oci && !is_tar_path(dest) {
            move_into_place(&root, dest)?;
        } else {
            let file = tempfile::NamedTempFile::new_in(parent_of(dest))?;
            let mut file = layer::pack_dir(&root, file)?;
            file.flush()?;
            file.persist(dest).map_err(|e| e.error)?;
        }

        Ok(ExportedArtifact::Layout { path: dest.to_path_buf(), digest: written.index.digest })
    }

    fn export_image(&self, results: &[FinalResult], names: &[String]) -> Result<ExportedArtifact, ExportError> {
        // Stored layers stay uncompressed so the image can serve as a base.
        let written = self.write_index(results, Compression::Uncompressed, self.images.blobs().as_ref())?;

        let references = self.images.tag_all(names, &written.index)?;
        Ok(ExportedArtifact::Images { references, digest: written.index.digest })
    }

    /// Writes layers, configs, manifests and the image index into `target`.
    fn write_index(
        &self,
        results: &[FinalResult],
        compression: Compression,
        target: &dyn BlobStore,
    ) -> Result<WrittenIndex, ExportError> {
        let created = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let mut manifests = Vec::with_capacity(results.len());
        let mut images = Vec::with_capacity(results.len());

        for result in results {
            let mut layers = Vec::with_capacity(result.rootfs.layers.len());
            for layer in &result.rootfs.layers {
                let data = self.layer(&layer.digest)?;
                let (media_type, data) = match compression {
                    Compression::Gzip => (MEDIA_TYPE_LAYER_GZIP, gzip(&data)?),
                    Compression::Uncompressed => (MEDIA_TYPE_LAYER, data),
                };
                let digest = target.put(&data)?;
                layers.push(Descriptor::new(media_type, digest, data.len() as u64));
            }

            let config = serde_json::to_vec(&result.config.to_oci(&result.platform, &result.rootfs, &created))?;
            let config = Descriptor::new(MEDIA_TYPE_CONFIG, target.put(&config)?, config.len() as u64);
            images.push((config.digest.clone(), layers.iter().map(|l| l.digest.clone()).collect()));

            let manifest = serde_json::to_vec(&ImageManifest::new(config, layers))?;
            let mut descriptor = Descriptor::new(MEDIA_TYPE_MANIFEST, target.put(&manifest)?, manifest.len() as u64);
            descriptor.platform = Some(OciPlatform::from(&result.platform));
            manifests.push(descriptor);
        }

        let index = serde_json::to_vec(&ImageIndex::new(manifests))?;
        let index = Descriptor::new(MEDIA_TYPE_INDEX, target.put(&index)?, index.len() as u64);
        debug!(digest = %index.digest, platforms = results.len(), "Wrote image index");
        Ok(WrittenIndex { index, images })
    }
}

fn require_dest(spec: &OutputSpec) -> Result<&Path, ExportError> {
    spec.dest
        .as_deref()
        .ok_or_else(|| ExportError::InvalidConfig(format!("type={}: dest=<path> is required", spec.kind)))
}

fn parent_of(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Renames a staged directory to `dest`, replacing an empty directory.
fn move_into_place(staged: &Path, dest: &Path) -> Result<(), ExportError> {
    if dest.exists() {
        if !is_empty_or_missing(dest)? {
            return Err(ExportError::DestinationExists(dest.to_path_buf()));
        }
        fs::remove_dir(dest)?;
    }
    fs::rename(staged, dest)?;
    Ok(())
}

fn blob_member(digest: &str) -> String {
    format!("blobs/sha256/{}", digest.trim_start_matches("sha256:"))
}

fn gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::cas::CasStore;
    use crate::builder::executor::BuildStats;
    use crate::builder::image::{ImageConfig, LayerRef, RootFs};
    use crate::builder::parser::ImageRef;
    use crate::builder::platform::Platform;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        exporter: Exporter,
        images: Arc<ImageStore>,
        blobs: Arc<CasStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let blobs = Arc::new(CasStore::new(dir.path()).unwrap());
        let images = Arc::new(ImageStore::open(dir.path(), blobs.clone()).unwrap());
        let exporter = Exporter::new(blobs.clone(), images.clone(), dir.path().join("tmp"));
        Fixture { dir, exporter, images, blobs }
    }

    fn layer_with(files: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn result(fx: &Fixture, platform: &str, files: &[(&str, &str)]) -> FinalResult {
        let data = layer_with(files);
        let digest = fx.blobs.put(&data).unwrap();
        let mut config = ImageConfig::default();
        config.labels.insert("stage".into(), "final".into());
        FinalResult {
            platform: platform.parse().unwrap(),
            rootfs: RootFs { layers: vec![LayerRef { digest, size: data.len() as u64 }] },
            config,
            stats: BuildStats::default(),
        }
    }

    fn spec(kind: OutputKind, dest: Option<PathBuf>, names: &[&str]) -> OutputSpec {
        OutputSpec { kind, dest, names: names.iter().map(|s| s.to_string()).collect(), compression: None }
    }

    #[test]
    fn test_validation_happens_first() {
        let fx = fixture();
        let one = vec![result(&fx, "linux/amd64", &[("a", "1")])];
        let two = vec![result(&fx, "linux/amd64", &[("a", "1")]), result(&fx, "linux/arm64", &[("a", "1")])];

        let with_dest = spec(OutputKind::Image, Some(fx.dir.path().join("x")), &["app"]);
        assert!(matches!(fx.exporter.export(&one, &with_dest), Err(ExportError::InvalidConfig(_))));
        assert!(!fx.dir.path().join("x").exists());
        assert!(fx.images.list().unwrap().is_empty());

        let unnamed = spec(OutputKind::Image, None, &[]);
        assert!(matches!(validate(&unnamed, 1), Err(ExportError::InvalidConfig(_))));

        let local = spec(OutputKind::Local, Some(fx.dir.path().join("out")), &[]);
        assert!(matches!(fx.exporter.export(&two, &local), Err(ExportError::MultiPlatform { count: 2, .. })));
        assert!(matches!(validate(&spec(OutputKind::Tar, None, &[]), 2), Err(ExportError::MultiPlatform { .. })));
        assert!(validate(&spec(OutputKind::Oci, None, &[]), 1).is_err());
        assert!(validate(&spec(OutputKind::Oci, Some("out.tar".into()), &[]), 2).is_ok());
    }

    #[test]
    fn test_local_export() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("etc/motd", "hi"), ("app/run.sh", "#!/bin/sh")])];
        let dest = fx.dir.path().join("out");

        let artifact = fx.exporter.export(&results, &spec(OutputKind::Local, Some(dest.clone()), &[])).unwrap();
        assert_eq!(artifact, ExportedArtifact::Directory(dest.clone()));
        assert_eq!(fs::read_to_string(dest.join("etc/motd")).unwrap(), "hi");
        assert!(dest.join("app/run.sh").exists());

        // A second export into the now non-empty directory is refused.
        let err = fx.exporter.export(&results, &spec(OutputKind::Local, Some(dest.clone()), &[])).unwrap_err();
        assert!(matches!(err, ExportError::DestinationExists(_)));
    }

    #[test]
    fn test_tar_export_to_file() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("hello.txt", "hello")])];
        let dest = fx.dir.path().join("rootfs.tar");

        fx.exporter.export(&results, &spec(OutputKind::Tar, Some(dest.clone()), &[])).unwrap();

        let data = fs::read(&dest).unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        let mut entries = archive.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        assert_eq!(first.path().unwrap().to_str(), Some("./"));
        assert!(layer::entry_paths(&data).unwrap().contains(&PathBuf::from("hello.txt")));
    }

    #[test]
    fn test_tar_export_to_stdout() {
        let fx = fixture();
        let captured = Arc::new(Mutex::new(Vec::<u8>::new()));
        let exporter = Exporter::new(fx.blobs.clone(), fx.images.clone(), fx.dir.path().join("tmp"))
            .with_stdout(captured.clone());
        let results = vec![result(&fx, "linux/amd64", &[("hello.txt", "hello")])];

        let artifact = exporter.export(&results, &spec(OutputKind::Tar, Some("-".into()), &[])).unwrap();
        assert_eq!(artifact, ExportedArtifact::Archive(None));
        assert!(!fx.dir.path().join("-").exists());

        let data = captured.lock().unwrap().clone();
        let paths = layer::entry_paths(&data).unwrap();
        assert_eq!(paths[0], PathBuf::from("./"));
        assert!(paths.contains(&PathBuf::from("hello.txt")));
    }

    #[test]
    fn test_file_sink_replaces_existing_file() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("new.txt", "new")])];
        let dest = fx.dir.path().join("rootfs.tar");
        fs::write(&dest, "stale").unwrap();

        fx.exporter.export(&results, &spec(OutputKind::Tar, Some(dest.clone()), &[])).unwrap();
        assert!(layer::entry_paths(&fs::read(&dest).unwrap()).unwrap().contains(&PathBuf::from("new.txt")));
    }

    #[test]
    fn test_bad_name_registers_nothing() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("a", "1")])];

        let output = spec(OutputKind::Image, None, &["good:1", "Not A Name"]);
        let err = fx.exporter.export(&results, &output).unwrap_err();
        assert!(matches!(err, ExportError::InvalidConfig(_)));
        assert!(fx.images.list().unwrap().is_empty());

        let output = spec(OutputKind::Oci, Some(fx.dir.path().join("layout")), &["bad name"]);
        assert!(matches!(validate(&output, 1), Err(ExportError::InvalidConfig(_))));
    }

    #[test]
    fn test_oci_layout_multi_platform() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("a", "amd")]), result(&fx, "linux/arm64", &[("a", "arm")])];
        let dest = fx.dir.path().join("layout");

        let artifact = fx.exporter.export(&results, &spec(OutputKind::Oci, Some(dest.clone()), &["app:1"])).unwrap();
        let ExportedArtifact::Layout { digest, .. } = artifact else { panic!("expected layout") };

        assert!(dest.join("oci-layout").exists());
        let top: ImageIndex = serde_json::from_slice(&fs::read(dest.join("index.json")).unwrap()).unwrap();
        assert_eq!(top.manifests.len(), 1);
        assert_eq!(top.manifests[0].digest, digest);
        assert_eq!(
            top.manifests[0].annotations.as_ref().unwrap().get(ANNOTATION_REF_NAME).map(String::as_str),
            Some("app:1")
        );

        let blob = |d: &str| fs::read(dest.join("blobs/sha256").join(d.trim_start_matches("sha256:"))).unwrap();
        let index: ImageIndex = serde_json::from_slice(&blob(&digest)).unwrap();
        assert_eq!(index.manifests.len(), 2);
        for descriptor in &index.manifests {
            let manifest: ImageManifest = serde_json::from_slice(&blob(&descriptor.digest)).unwrap();
            assert_eq!(manifest.layers[0].media_type, MEDIA_TYPE_LAYER_GZIP);
            assert_eq!(digest_of(&blob(&manifest.layers[0].digest)), manifest.layers[0].digest);
        }
    }

    #[test]
    fn test_docker_archive() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("a", "1")])];
        let dest = fx.dir.path().join("image.tar");
        let mut output = spec(OutputKind::Docker, Some(dest.clone()), &["app:latest"]);
        output.compression = Some(Compression::Uncompressed);

        fx.exporter.export(&results, &output).unwrap();

        let data = fs::read(&dest).unwrap();
        let paths = layer::entry_paths(&data).unwrap();
        assert!(paths.contains(&PathBuf::from("manifest.json")));
        assert!(paths.contains(&PathBuf::from("index.json")));

        let mut archive = tar::Archive::new(data.as_slice());
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            if entry.path().unwrap().to_str() == Some("manifest.json") {
                let mut json = String::new();
                io::Read::read_to_string(&mut entry, &mut json).unwrap();
                let value: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(value[0]["RepoTags"][0], "app:latest");
                assert!(value[0]["Config"].as_str().unwrap().starts_with("blobs/sha256/"));
            }
        }
    }

    #[test]
    fn test_image_export_is_usable_as_base() {
        let fx = fixture();
        let results = vec![result(&fx, "linux/amd64", &[("bin/tool", "x")])];

        let artifact = fx.exporter.export(&results, &spec(OutputKind::Image, None, &["tools:1", "tools:latest"])).unwrap();
        let ExportedArtifact::Images { references, .. } = artifact else { panic!("expected images") };
        assert_eq!(references, vec!["docker.io/library/tools:1", "docker.io/library/tools:latest"]);

        let resolved = fx
            .images
            .resolve_blocking(&ImageRef::parse("tools:1"), &"linux/amd64".parse().unwrap())
            .unwrap();
        assert_eq!(resolved.rootfs, results[0].rootfs);
        assert_eq!(resolved.config.labels, BTreeMap::from([("stage".to_string(), "final".to_string())]));

        let missing: Platform = "linux/arm64".parse().unwrap();
        assert!(fx.images.resolve_blocking(&ImageRef::parse("tools:1"), &missing).is_err());
    }
}
