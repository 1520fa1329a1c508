//! Local named-image store.
//!
//! Images registered by the `image` sink live in the state directory as an
//! OCI index (`images/index.json`) whose entries point at per-name image
//! indexes in the shared blob store. The same store serves as the base image
//! source for `FROM <image>`.

use crate::builder::cas::{BlobStore, CasStore};
use crate::builder::image::{
    Descriptor, ImageConfig, ImageIndex, ImageManifest, LayerRef, OciImageConfig, RootFs, ANNOTATION_REF_NAME,
    MEDIA_TYPE_LAYER_GZIP,
};
use crate::builder::parser::ImageRef;
use crate::builder::platform::Platform;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Error type for image store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid image document: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Image {reference} has no variant for platform {platform}")]
    PlatformNotFound { reference: String, platform: String },

    #[error("Blob {0} referenced by an image is missing")]
    MissingBlob(String),
}

/// A base image resolved for one platform.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    /// Digest of the platform manifest.
    pub digest: String,
    pub rootfs: RootFs,
    pub config: ImageConfig,
}

/// Resolves `FROM <image>` references.
#[async_trait]
pub trait BaseImageSource: Send + Sync {
    async fn resolve(&self, reference: &ImageRef, platform: &Platform) -> Result<ResolvedImage, StoreError>;
}

/// A named image as listed by `img ls`.
#[derive(Debug, Clone)]
pub struct StoredImage {
    pub reference: String,
    pub digest: String,
    pub platforms: Vec<Platform>,
    pub size: u64,
}

/// Normalizes an image name into a fully qualified reference.
///
/// Handles:
/// - Short names: "nginx" → "docker.io/library/nginx:latest"
/// - Tagged names: "nginx:1.25" → "docker.io/library/nginx:1.25"
/// - Fully qualified: "ghcr.io/org/repo:tag"
pub fn normalize_reference(image: &str) -> String {
    let image = image.trim();
    let first = image.split('/').next().unwrap_or_default();
    let has_registry = image.contains('/') && (first.contains('.') || first.contains(':') || first == "localhost");

    let normalized = if has_registry {
        image.to_string()
    } else if image.contains('/') {
        format!("docker.io/{}", image)
    } else {
        format!("docker.io/library/{}", image)
    };

    // Add :latest if no tag specified
    let parsed = ImageRef::parse(&normalized);
    if parsed.tag.is_none() && parsed.digest.is_none() {
        format!("{}:latest", normalized)
    } else {
        normalized
    }
}

/// Checks that `name` can be used as an image reference.
///
/// Accepts `[registry/]repo[:tag][@sha256:<hex>]` with a lowercase repository.
pub fn is_valid_reference(name: &str) -> bool {
    let (rest, digest) = match name.split_once('@') {
        Some((rest, digest)) => (rest, Some(digest)),
        None => (name, None),
    };
    if digest.is_some_and(|d| crate::builder::cas::digest_hex(d).is_none()) {
        return false;
    }

    // A colon after the last slash starts the tag.
    let slash = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (repo, tag) = match rest[slash..].split_once(':') {
        Some((last, tag)) => (&rest[..slash + last.len()], Some(tag)),
        None => (rest, None),
    };

    let tag_ok = tag.map_or(true, |t| {
        !t.is_empty()
            && t.len() <= 128
            && !t.starts_with(['.', '-'])
            && t.chars().all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
    });

    let mut components = repo.split('/').peekable();
    let registry = components.peek().copied().filter(|first| {
        repo.contains('/') && (first.contains('.') || first.contains(':') || *first == "localhost")
    });
    if registry.is_some() {
        components.next();
    }
    let registry_ok = registry.map_or(true, |r| r.chars().all(|c| c.is_ascii_alphanumeric() || ".:-".contains(c)));
    let path: Vec<&str> = components.collect();
    let path_ok = !path.is_empty()
        && path.iter().all(|c| {
            !c.is_empty()
                && c.chars().all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || "._-".contains(ch))
                && c.starts_with(|ch: char| ch.is_ascii_alphanumeric())
        });

    tag_ok && registry_ok && path_ok
}

/// Named images backed by a [`CasStore`].
#[derive(Debug, Clone)]
pub struct ImageStore {
    index_path: PathBuf,
    blobs: Arc<CasStore>,
}

impl ImageStore {
    pub fn open(state_dir: &Path, blobs: Arc<CasStore>) -> io::Result<Self> {
        let dir = state_dir.join("images");
        fs::create_dir_all(&dir)?;
        Ok(Self { index_path: dir.join("index.json"), blobs })
    }

    pub fn blobs(&self) -> &Arc<CasStore> {
        &self.blobs
    }

    fn load_index(&self) -> Result<ImageIndex, StoreError> {
        match fs::read_to_string(&self.index_path) {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(ImageIndex::new(Vec::new())),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, index: &ImageIndex) -> Result<(), StoreError> {
        let dir = self.index_path.parent().unwrap_or(Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&serde_json::to_vec_pretty(index)?)?;
        file.persist(&self.index_path).map_err(|e| e.error)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, digest: &str) -> Result<T, StoreError> {
        let data = self.blobs.get(digest)?.ok_or_else(|| StoreError::MissingBlob(digest.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Points `name` at an image index blob, replacing any previous target.
    pub fn tag(&self, name: &str, index: &Descriptor) -> Result<String, StoreError> {
        let mut references = self.tag_all(&[name.to_string()], index)?;
        references.pop().ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Points every name at `index` with a single index update.
    ///
    /// Either all names are registered or none are.
    pub fn tag_all(&self, names: &[String], index: &Descriptor) -> Result<Vec<String>, StoreError> {
        let references: Vec<String> = names.iter().map(|n| normalize_reference(n)).collect();
        let mut root = self.load_index()?;

        root.manifests.retain(|d| !ref_name(d).is_some_and(|r| references.iter().any(|n| n == r)));
        for reference in &references {
            let mut entry = index.clone();
            entry
                .annotations
                .get_or_insert_with(Default::default)
                .insert(ANNOTATION_REF_NAME.to_string(), reference.clone());
            root.manifests.push(entry);
        }
        root.manifests.sort_by(|a, b| ref_name(a).cmp(&ref_name(b)));

        self.save_index(&root)?;
        for reference in &references {
            info!(reference = %reference, digest = %index.digest, "Tagged image");
        }
        Ok(references)
    }

    /// Removes a name. Returns false if it was not registered.
    pub fn untag(&self, name: &str) -> Result<bool, StoreError> {
        let reference = normalize_reference(name);
        let mut root = self.load_index()?;
        let before = root.manifests.len();
        root.manifests.retain(|d| ref_name(d) != Some(reference.as_str()));
        let removed = root.manifests.len() != before;
        if removed {
            self.save_index(&root)?;
        }
        Ok(removed)
    }

    /// Registered images, sorted by reference.
    pub fn list(&self) -> Result<Vec<StoredImage>, StoreError> {
        let root = self.load_index()?;
        let mut images = Vec::with_capacity(root.manifests.len());

        for entry in &root.manifests {
            let Some(reference) = ref_name(entry) else { continue };
            let index: ImageIndex = self.read_json(&entry.digest)?;
            let mut platforms = Vec::new();
            let mut size = 0;
            for manifest_desc in &index.manifests {
                if let Some(p) = &manifest_desc.platform {
                    platforms.push(Platform::from(p));
                }
                let manifest: ImageManifest = self.read_json(&manifest_desc.digest)?;
                size += manifest.layers.iter().map(|l| l.size).sum::<u64>();
            }
            images.push(StoredImage { reference: reference.to_string(), digest: entry.digest.clone(), platforms, size });
        }

        Ok(images)
    }

    /// Every blob reachable from a registered name.
    pub fn referenced_blobs(&self) -> Result<HashSet<String>, StoreError> {
        let root = self.load_index()?;
        let mut referenced = HashSet::new();

        for entry in &root.manifests {
            referenced.insert(entry.digest.clone());
            let index: ImageIndex = self.read_json(&entry.digest)?;
            for manifest_desc in &index.manifests {
                referenced.insert(manifest_desc.digest.clone());
                let manifest: ImageManifest = self.read_json(&manifest_desc.digest)?;
                referenced.insert(manifest.config.digest.clone());
                referenced.extend(manifest.layers.iter().map(|l| l.digest.clone()));
            }
        }

        Ok(referenced)
    }

    /// Looks up an image for one platform.
    pub fn resolve_blocking(&self, reference: &ImageRef, platform: &Platform) -> Result<ResolvedImage, StoreError> {
        let wanted = normalize_reference(&reference.to_string());
        let root = self.load_index()?;
        let entry = root
            .manifests
            .iter()
            .find(|d| ref_name(d) == Some(wanted.as_str()))
            .ok_or_else(|| StoreError::NotFound(wanted.clone()))?;

        let index: ImageIndex = self.read_json(&entry.digest)?;
        let manifest_desc = index
            .manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| platform.matches(&Platform::from(p))))
            .ok_or_else(|| StoreError::PlatformNotFound { reference: wanted.clone(), platform: platform.to_string() })?;

        let manifest: ImageManifest = self.read_json(&manifest_desc.digest)?;
        let oci_config: OciImageConfig = self.read_json(&manifest.config.digest)?;

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for layer in &manifest.layers {
            layers.push(self.uncompressed_layer(layer)?);
        }

        debug!(reference = %wanted, platform = %platform, layers = layers.len(), "Resolved base image");
        Ok(ResolvedImage {
            digest: manifest_desc.digest.clone(),
            rootfs: RootFs { layers },
            config: ImageConfig::from_oci(&oci_config),
        })
    }

    /// Returns the uncompressed form of a layer, decompressing gzip layers into the store.
    fn uncompressed_layer(&self, layer: &Descriptor) -> Result<LayerRef, StoreError> {
        if !self.blobs.contains(&layer.digest) {
            return Err(StoreError::MissingBlob(layer.digest.clone()));
        }
        if layer.media_type != MEDIA_TYPE_LAYER_GZIP {
            return Ok(LayerRef { digest: layer.digest.clone(), size: layer.size });
        }

        let compressed =
            self.blobs.get(&layer.digest)?.ok_or_else(|| StoreError::MissingBlob(layer.digest.clone()))?;
        let mut data = Vec::new();
        flate2::read::GzDecoder::new(compressed.as_slice()).read_to_end(&mut data)?;
        let digest = self.blobs.put(&data)?;
        Ok(LayerRef { digest, size: data.len() as u64 })
    }
}

#[async_trait]
impl BaseImageSource for ImageStore {
    async fn resolve(&self, reference: &ImageRef, platform: &Platform) -> Result<ResolvedImage, StoreError> {
        let store = self.clone();
        let reference = reference.clone();
        let platform = platform.clone();
        tokio::task::spawn_blocking(move || store.resolve_blocking(&reference, &platform))
            .await
            .map_err(|e| StoreError::Io(io::Error::other(e)))?
    }
}

fn ref_name(descriptor: &Descriptor) -> Option<&str> {
    descriptor.annotations.as_ref()?.get(ANNOTATION_REF_NAME).map(String::as_str)
}
