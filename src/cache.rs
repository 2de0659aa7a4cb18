// Compiled artifact cache
//
// Entries are keyed by a digest over the full ancestor chain of a template, so
// editing a parent invalidates every child that extends it. A chain manifest per
// template root and name remembers which files made up the chain and their
// mtimes; while none of them changed the recorded digest is reused without
// reading any source.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Result, TemplateError};
use crate::template::{ExecutableUnit, ResolvedTemplate, SourceMap};

/// A compiled template. Immutable for a given digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub unit: ExecutableUnit,
    pub source_map: SourceMap,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainLink {
    pub name: String,
    /// File name the compiled unit attributes lines to.
    pub file: String,
    pub path: Option<PathBuf>,
    /// Modification time in nanoseconds since the epoch.
    pub modified: Option<u128>,
    pub len: Option<u64>,
}

/// The ancestor chain a template name resolved to, root first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainManifest {
    /// Template name, prefixed with the cache namespace if there is one.
    pub key: String,
    pub links: Vec<ChainLink>,
    pub digest: String,
}

/// SHA-256 over `file \0 source \0` for each template, root first.
pub fn digest_chain<'a>(chain: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut hasher = Sha256::new();
    for (file, source) in chain {
        hasher.update(file.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn resolved_digest(resolved: &ResolvedTemplate) -> String {
    digest_chain(
        resolved
            .chain
            .iter()
            .map(|t| (t.file.as_str(), t.source.as_str())),
    )
}

/// Modification time and length of a file, if it can be read.
fn file_stamp(path: &Path) -> (Option<u128>, Option<u64>) {
    match fs::metadata(path) {
        Ok(meta) => (
            meta.modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos()),
            Some(meta.len()),
        ),
        Err(_) => (None, None),
    }
}

/// Durable storage for entries and manifests.
pub trait ArtifactStore: Send + Sync {
    fn load_entry(&self, digest: &str) -> Result<Option<CacheEntry>>;
    fn store_entry(&self, entry: &CacheEntry) -> Result<()>;
    fn load_manifest(&self, key: &str) -> Result<Option<ChainManifest>>;
    fn store_manifest(&self, manifest: &ChainManifest) -> Result<()>;
    fn remove_manifest(&self, key: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Keeps everything in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    manifests: RwLock<HashMap<String, ChainManifest>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ArtifactStore for MemoryStore {
    fn load_entry(&self, digest: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(digest).cloned())
    }

    fn store_entry(&self, entry: &CacheEntry) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(entry.digest.clone(), entry.clone());
        Ok(())
    }

    fn load_manifest(&self, key: &str) -> Result<Option<ChainManifest>> {
        let manifests = self.manifests.read().unwrap_or_else(|e| e.into_inner());
        Ok(manifests.get(key).cloned())
    }

    fn store_manifest(&self, manifest: &ChainManifest) -> Result<()> {
        let mut manifests = self.manifests.write().unwrap_or_else(|e| e.into_inner());
        manifests.insert(manifest.key.clone(), manifest.clone());
        Ok(())
    }

    fn remove_manifest(&self, key: &str) -> Result<()> {
        let mut manifests = self.manifests.write().unwrap_or_else(|e| e.into_inner());
        manifests.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.manifests.write().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }
}

/// JSON files under a cache root:
///
/// ```text
/// <root>/<digest>.json              compiled entries
/// <root>/manifests/<sha256(key)>.json
/// ```
///
/// Files are written to a unique temporary name and renamed into place, so
/// concurrent writers of the same digest never leave a torn file behind.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create the directory layout if needed and check it is writable.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("manifests"))
            .map_err(|e| TemplateError::setup(&root, format!("cannot create cache directory: {}", e)))?;

        let check = root.join(format!(".write-check-{}", Uuid::new_v4()));
        fs::write(&check, b"")
            .and_then(|_| fs::remove_file(&check))
            .map_err(|e| TemplateError::setup(&root, format!("cache directory is not writable: {}", e)))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, digest: &str) -> PathBuf {
        self.root.join(format!("{}.json", digest))
    }

    fn manifest_path(&self, key: &str) -> PathBuf {
        let hashed = hex::encode(Sha256::digest(key.as_bytes()));
        self.root.join("manifests").join(format!("{}.json", hashed))
    }

    fn write_atomic(&self, path: &Path, value: &impl Serialize) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        let dir = path.parent().unwrap_or(&self.root);
        let tmp = dir.join(format!(".{}.tmp", Uuid::new_v4()));

        fs::write(&tmp, json).map_err(|e| TemplateError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(TemplateError::io(path, e));
        }
        Ok(())
    }

    /// A missing or unreadable-as-JSON file is a miss.
    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TemplateError::io(path, e)),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt cache file");
                Ok(None)
            }
        }
    }

    fn clear_dir(dir: &Path) -> Result<()> {
        let listing = match fs::read_dir(dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(TemplateError::io(dir, e)),
        };
        for item in listing {
            let path = item.map_err(|e| TemplateError::io(dir, e))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).map_err(|e| TemplateError::io(&path, e))?;
            }
        }
        Ok(())
    }
}

impl ArtifactStore for FileStore {
    fn load_entry(&self, digest: &str) -> Result<Option<CacheEntry>> {
        self.read_json(&self.entry_path(digest))
    }

    fn store_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.write_atomic(&self.entry_path(&entry.digest), entry)
    }

    fn load_manifest(&self, key: &str) -> Result<Option<ChainManifest>> {
        let manifest: Option<ChainManifest> = self.read_json(&self.manifest_path(key))?;
        // a hash collision on the file name is a miss
        Ok(manifest.filter(|m| m.key == key))
    }

    fn store_manifest(&self, manifest: &ChainManifest) -> Result<()> {
        self.write_atomic(&self.manifest_path(&manifest.key), manifest)
    }

    fn remove_manifest(&self, key: &str) -> Result<()> {
        let path = self.manifest_path(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TemplateError::io(&path, e)),
        }
    }

    fn clear(&self) -> Result<()> {
        Self::clear_dir(&self.root)?;
        Self::clear_dir(&self.root.join("manifests"))
    }
}

pub struct CompiledArtifactCache {
    store: Box<dyn ArtifactStore>,
    namespace: Option<String>,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    manifests: RwLock<HashMap<String, ChainManifest>>,
}

impl CompiledArtifactCache {
    pub fn new(store: Box<dyn ArtifactStore>) -> Self {
        Self {
            store,
            namespace: None,
            entries: RwLock::new(HashMap::new()),
            manifests: RwLock::new(HashMap::new()),
        }
    }

    /// Keep manifests apart from those of other template roots sharing the
    /// same store. Compiled entries are shared, they are keyed by content.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()))
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(Box::new(FileStore::new(root)?)))
    }

    /// Return the entry for `name`, resolving and compiling only on a miss.
    ///
    /// `leaf` is the file `name` currently locates to, if known; a manifest
    /// recorded for a different file is a miss. Concurrent misses for the same
    /// template may both compile; the results are identical and the last
    /// write wins.
    pub fn get_or_compile<R, C>(
        &self,
        name: &str,
        leaf: Option<&Path>,
        resolve: R,
        compile: C,
    ) -> Result<Arc<CacheEntry>>
    where
        R: FnOnce() -> Result<ResolvedTemplate>,
        C: FnOnce(&ResolvedTemplate) -> Result<(ExecutableUnit, SourceMap)>,
    {
        let key = self.manifest_key(name);
        if let Some(digest) = self.current_digest(&key, leaf)? {
            if let Some(entry) = self.lookup(&digest)? {
                tracing::debug!(template = name, digest = %digest, "compiled template cache hit");
                return Ok(entry);
            }
        }

        tracing::debug!(template = name, "compiled template cache miss");
        let resolved = resolve()?;
        let digest = resolved_digest(&resolved);

        let entry = match self.lookup(&digest)? {
            Some(entry) => entry,
            None => {
                let (unit, source_map) = compile(&resolved)?;
                let entry = CacheEntry {
                    unit,
                    source_map,
                    digest: digest.clone(),
                };
                self.store.store_entry(&entry)?;
                let entry = Arc::new(entry);
                self.entries
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(digest.clone(), Arc::clone(&entry));
                entry
            }
        };

        self.remember_chain(key, &resolved, digest)?;
        Ok(entry)
    }

    /// Forget which chain `name` resolved to. Compiled entries are kept.
    pub fn invalidate(&self, name: &str) -> Result<()> {
        let key = self.manifest_key(name);
        self.manifests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        self.store.remove_manifest(&key)
    }

    /// Drop everything, locally and in the store.
    pub fn clear(&self) -> Result<()> {
        self.entries.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.manifests.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.store.clear()
    }

    /// Number of entries held in this process.
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, digest: &str) -> Result<Option<Arc<CacheEntry>>> {
        if let Some(entry) = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(digest)
        {
            return Ok(Some(Arc::clone(entry)));
        }

        let Some(entry) = self.store.load_entry(digest)? else {
            return Ok(None);
        };
        if entry.digest != digest {
            tracing::warn!(digest, stored = %entry.digest, "stored entry digest mismatch");
            return Ok(None);
        }
        let entry = Arc::new(entry);
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(digest.to_string(), Arc::clone(&entry));
        Ok(Some(entry))
    }

    fn manifest_key(&self, name: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}\0{}", namespace, name),
            None => name.to_string(),
        }
    }

    fn manifest(&self, key: &str) -> Result<Option<ChainManifest>> {
        if let Some(manifest) = self
            .manifests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
        {
            return Ok(Some(manifest.clone()));
        }
        self.store.load_manifest(key)
    }

    /// Digest of the chain `key` last resolved to, if its files still exist.
    fn current_digest(&self, key: &str, leaf: Option<&Path>) -> Result<Option<String>> {
        let Some(manifest) = self.manifest(key)? else {
            return Ok(None);
        };

        if let Some(leaf) = leaf {
            let recorded = manifest.links.last().and_then(|link| link.path.as_deref());
            if recorded != Some(leaf) {
                tracing::debug!(template = key, leaf = %leaf.display(), "manifest recorded for another file");
                return Ok(None);
            }
        }

        let mut unchanged = true;
        let mut sources = Vec::with_capacity(manifest.links.len());
        for link in &manifest.links {
            // templates that did not come from a file cannot be checked
            let Some(path) = &link.path else {
                return Ok(None);
            };
            let stamp = file_stamp(path);
            if stamp.0.is_none() || stamp != (link.modified, link.len) {
                unchanged = false;
            }
            sources.push((link.file.as_str(), path));
        }

        if unchanged {
            return Ok(Some(manifest.digest));
        }

        let mut texts = Vec::with_capacity(sources.len());
        for (_, path) in &sources {
            match fs::read_to_string(path) {
                Ok(text) => texts.push(text),
                Err(_) => return Ok(None),
            }
        }
        let digest = digest_chain(
            sources
                .iter()
                .zip(&texts)
                .map(|((file, _), text)| (*file, text.as_str())),
        );
        tracing::trace!(template = key, digest = %digest, "chain re-digested");
        Ok(Some(digest))
    }

    fn remember_chain(&self, key: String, resolved: &ResolvedTemplate, digest: String) -> Result<()> {
        let links = resolved
            .chain
            .iter()
            .map(|t| {
                let (modified, len) = t.path.as_deref().map(file_stamp).unwrap_or((None, None));
                ChainLink {
                    name: t.name.clone(),
                    file: t.file.clone(),
                    path: t.path.clone(),
                    modified,
                    len,
                }
            })
            .collect();
        let manifest = ChainManifest {
            key: key.clone(),
            links,
            digest,
        };
        self.store.store_manifest(&manifest)?;
        self.manifests
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, manifest);
        Ok(())
    }
}
