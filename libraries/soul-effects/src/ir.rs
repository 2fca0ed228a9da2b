//! Impulse response catalog
//!
//! A catalog lists the impulse responses available to the convolution
//! reverb and serves their raw WAV bytes. Listing happens during session
//! initialization; fetching and decoding only once the convolver is enabled
//! with a selection.

use crate::config::CatalogSettings;
use crate::error::{EffectsError, Result};
use async_trait::async_trait;
use lru::LruCache;
use reqwest::Client;
use soul_audio::AudioBuffer;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Listing path on an HTTP catalog
pub const LIST_PATH: &str = "/api/irs";

/// File extension of impulse responses in a directory catalog
pub const IR_EXTENSION: &str = "irs";

/// Source of impulse responses
#[async_trait]
pub trait IrCatalog: Send + Sync {
    /// Identifiers of every available impulse response
    async fn list(&self) -> Result<Vec<String>>;

    /// Raw audio bytes of one impulse response
    async fn fetch(&self, id: &str) -> Result<Vec<u8>>;
}

/// Catalog served over HTTP
///
/// `GET {base}/api/irs` returns a JSON array of identifiers; each identifier
/// is a path (or absolute URL) resolved against the base for the download.
#[derive(Debug, Clone)]
pub struct HttpIrCatalog {
    http: Client,
    base: Url,
}

impl HttpIrCatalog {
    pub fn new(base_url: &str) -> Result<Self> {
        let base = Url::parse(base_url)?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(EffectsError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                base.scheme()
            )));
        }

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .user_agent(format!("SoulPlayer/{} (Effects)", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { http, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        debug!(url = %url, "Requesting impulse response catalog");
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(EffectsError::Catalog {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl IrCatalog for HttpIrCatalog {
    async fn list(&self) -> Result<Vec<String>> {
        let response = self.get(self.base.join(LIST_PATH)?).await?;
        let ids: Vec<String> = response.json().await?;
        info!(count = ids.len(), "Fetched impulse response list");
        Ok(ids)
    }

    async fn fetch(&self, id: &str) -> Result<Vec<u8>> {
        let response = self.get(self.base.join(id)?).await?;
        let bytes = response.bytes().await?;
        debug!(id, bytes = bytes.len(), "Fetched impulse response");
        Ok(bytes.to_vec())
    }
}

/// `*.irs` files of a local directory, published under a URL prefix
#[derive(Debug, Clone)]
pub struct DirectoryIrCatalog {
    directory: PathBuf,
    prefix: String,
}

impl DirectoryIrCatalog {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
        }
    }

    fn file_name<'a>(&self, id: &'a str) -> Result<&'a str> {
        let name = id.strip_prefix(self.prefix.as_str()).unwrap_or(id);
        if name.is_empty() || name.contains(['/', '\\']) || name == ".." {
            return Err(EffectsError::UnknownImpulseResponse(id.to_string()));
        }
        Ok(name)
    }
}

#[async_trait]
impl IrCatalog for DirectoryIrCatalog {
    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.directory).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_ir = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(IR_EXTENSION));
            if !is_ir || !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
        names.sort();

        debug!(
            directory = %self.directory.display(),
            count = names.len(),
            "Listed impulse response directory"
        );
        Ok(names
            .into_iter()
            .map(|name| format!("{}{name}", self.prefix))
            .collect())
    }

    async fn fetch(&self, id: &str) -> Result<Vec<u8>> {
        let name = self.file_name(id)?;
        match tokio::fs::read(self.directory.join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EffectsError::UnknownImpulseResponse(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// In-process catalog, mostly for hosts that bundle their impulse responses
#[derive(Debug, Default)]
pub struct MemoryIrCatalog {
    entries: Mutex<Vec<(String, Arc<[u8]>)>>,
}

impl MemoryIrCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, bytes: Vec<u8>) {
        let id = id.into();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|(existing, _)| *existing != id);
        entries.push((id, bytes.into()));
    }
}

#[async_trait]
impl IrCatalog for MemoryIrCatalog {
    async fn list(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn fetch(&self, id: &str) -> Result<Vec<u8>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, bytes)| bytes.to_vec())
            .ok_or_else(|| EffectsError::UnknownImpulseResponse(id.to_string()))
    }
}

/// Build the catalog named by the configuration
///
/// An HTTP base URL wins over a directory. `None` when neither is set.
pub fn catalog_from_config(settings: &CatalogSettings) -> Result<Option<Arc<dyn IrCatalog>>> {
    if let Some(base_url) = &settings.base_url {
        return Ok(Some(Arc::new(HttpIrCatalog::new(base_url)?)));
    }
    if let Some(directory) = &settings.directory {
        return Ok(Some(Arc::new(DirectoryIrCatalog::new(
            directory,
            settings.public_prefix.clone(),
        ))));
    }
    Ok(None)
}

/// Outcome of matching a selection against a fresh listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    pub available: Vec<String>,
    pub selected: Option<String>,
}

/// Fit the current selection to a catalog listing
///
/// A selection missing from the listing is cleared; with nothing selected
/// the first entry is picked. A failed listing leaves no choices at all.
pub fn reconcile_selection(listing: Result<Vec<String>>, selected: Option<&str>) -> Reconciled {
    let available = match listing {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!(error = %e, "Failed to fetch impulse response list");
            return Reconciled {
                available: Vec::new(),
                selected: None,
            };
        }
    };

    let selected = match selected {
        Some(id) if available.iter().any(|a| a == id) => Some(id.to_string()),
        Some(id) => {
            warn!(id, "Selected impulse response no longer available, clearing");
            None
        }
        None => available.first().cloned(),
    };

    Reconciled {
        available,
        selected,
    }
}

/// Decoded impulse responses keyed by id and sample rate
pub struct ImpulseResponseCache {
    entries: Mutex<LruCache<(String, u32), Arc<AudioBuffer>>>,
}

impl std::fmt::Debug for ImpulseResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ImpulseResponseCache")
            .field("len", &entries.len())
            .field("cap", &entries.cap())
            .finish()
    }
}

impl ImpulseResponseCache {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, id: &str, sample_rate: u32) -> Option<Arc<AudioBuffer>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(id.to_string(), sample_rate))
            .cloned()
    }

    pub fn insert(&self, id: &str, sample_rate: u32, buffer: Arc<AudioBuffer>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put((id.to_string(), sample_rate), buffer);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fetch and decode an impulse response at the context rate
///
/// Decoding runs on the blocking pool; results are cached.
pub async fn load_impulse_response(
    catalog: &dyn IrCatalog,
    cache: &ImpulseResponseCache,
    id: &str,
    sample_rate: u32,
) -> Result<Arc<AudioBuffer>> {
    if let Some(buffer) = cache.get(id, sample_rate) {
        debug!(id, "Impulse response served from cache");
        return Ok(buffer);
    }

    let bytes = catalog.fetch(id).await?;
    let buffer = tokio::task::spawn_blocking(move || AudioBuffer::decode_at_rate(&bytes, sample_rate))
        .await
        .map_err(|e| EffectsError::Task(e.to_string()))??;
    let buffer = Arc::new(buffer);

    info!(
        id,
        channels = buffer.number_of_channels(),
        frames = buffer.length(),
        "Decoded impulse response"
    );
    cache.insert(id, sample_rate, Arc::clone(&buffer));
    Ok(buffer)
}
