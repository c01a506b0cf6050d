//! Obtaining a layout engine: fetch the asset, compile it, remember it.
//!
//! An [`EngineLoader`] is cheap to clone and every clone shares one cache, so
//! handing the same loader to several bridges means the asset is fetched and
//! compiled once for all of them. Concurrent first loads wait on the same
//! initialisation. Failures are not cached; the next job tries again.

use std::{fmt::Debug, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::engine::{LayoutEngine, native::NativeLayoutEngine, wasm::WasmLayoutEngine};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum LoadError {
    #[error("fetching {location} returned HTTP {status}")]
    Status { location: String, status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("could not compile layout engine: {0}")]
    Compile(String),
    #[error("unsupported engine location `{0}`")]
    UnsupportedLocation(String),
}

/// Where engine bytes come from.
#[async_trait]
pub trait AssetSource: Send + Sync + Debug {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError>;
}

#[derive(Debug, Clone)]
pub struct HttpAssetSource {
    client: reqwest::Client,
}

impl HttpAssetSource {
    pub fn new(timeout: Option<Duration>) -> Result<Self, LoadError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| LoadError::Network(format!("reqwest client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetSource for HttpAssetSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError> {
        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|e| LoadError::Network(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Status {
                location: location.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| LoadError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FileAssetSource;

#[async_trait]
impl AssetSource for FileAssetSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, LoadError> {
        let path = file_path(location)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| LoadError::Io(format!("{}: {e}", path.display())))
    }
}

/// Resolves a `file://` URL or plain path to a filesystem path.
pub fn file_path(location: &str) -> Result<PathBuf, LoadError> {
    match Url::parse(location) {
        Ok(url) if url.scheme() == "file" => url
            .to_file_path()
            .map_err(|_| LoadError::UnsupportedLocation(location.to_string())),
        Ok(url) if url.scheme().len() > 1 => Err(LoadError::UnsupportedLocation(location.to_string())),
        // relative paths, and drive letters that parse as one-letter schemes
        _ => Ok(PathBuf::from(location)),
    }
}

/// Picks the asset source for `location` by its scheme.
pub fn source_for(location: &str) -> Result<Arc<dyn AssetSource>, LoadError> {
    match Url::parse(location) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Arc::new(HttpAssetSource::new(None)?)),
        _ => {
            file_path(location)?;
            Ok(Arc::new(FileAssetSource))
        }
    }
}

/// Turns fetched bytes into a runnable engine.
pub trait EngineCompiler: Send + Sync + Debug {
    fn compile(&self, bytes: &[u8], location: &str) -> Result<Arc<dyn LayoutEngine>, LoadError>;
}

#[derive(Debug, Clone, Default)]
pub struct WasmCompiler {
    pub fuel: Option<u64>,
}

impl EngineCompiler for WasmCompiler {
    fn compile(&self, bytes: &[u8], location: &str) -> Result<Arc<dyn LayoutEngine>, LoadError> {
        let engine = WasmLayoutEngine::compile(bytes, location, self.fuel)
            .map_err(|e| LoadError::Compile(format!("{e:#}")))?;
        Ok(Arc::new(engine))
    }
}

#[derive(Clone, Debug)]
pub struct EngineLoader {
    location: Option<String>,
    source: Option<Arc<dyn AssetSource>>,
    compiler: Arc<dyn EngineCompiler>,
    cache: Cache<String, Arc<dyn LayoutEngine>>,
}

impl EngineLoader {
    /// A loader for the asset at `location`, or for the built-in engine when
    /// `location` is `None`.
    pub fn new(location: Option<String>, fuel: Option<u64>) -> Result<Self, LoadError> {
        let source = match &location {
            Some(loc) => Some(source_for(loc)?),
            None => None,
        };
        Ok(Self::build(location, source, Arc::new(WasmCompiler { fuel })))
    }

    pub fn with_source(
        location: impl Into<String>,
        source: Arc<dyn AssetSource>,
        compiler: Arc<dyn EngineCompiler>,
    ) -> Self {
        Self::build(Some(location.into()), Some(source), compiler)
    }

    pub fn native() -> Self {
        Self::build(None, None, Arc::new(WasmCompiler::default()))
    }

    fn build(
        location: Option<String>,
        source: Option<Arc<dyn AssetSource>>,
        compiler: Arc<dyn EngineCompiler>,
    ) -> Self {
        let cache = Cache::builder().max_capacity(4).build();
        Self {
            location,
            source,
            compiler,
            cache,
        }
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    /// Returns the engine, fetching and compiling it on first use.
    #[tracing::instrument(name = "engine_load", skip(self), fields(location = ?self.location))]
    pub async fn load(&self) -> Result<Arc<dyn LayoutEngine>, LoadError> {
        let (Some(location), Some(source)) = (&self.location, &self.source) else {
            return Ok(Arc::new(NativeLayoutEngine::new()));
        };

        let compiler = self.compiler.clone();
        let source = source.clone();
        let loc = location.clone();
        self.cache
            .try_get_with(location.clone(), async move {
                info!(location = %loc, "fetching layout engine");
                let bytes = source.fetch(&loc).await?;
                debug!(location = %loc, size = bytes.len(), "fetched layout engine");
                let loc_inner = loc.clone();
                tokio::task::spawn_blocking(move || compiler.compile(&bytes, &loc_inner))
                    .await
                    .map_err(|e| LoadError::Compile(e.to_string()))?
            })
            .await
            .map_err(|e: Arc<LoadError>| (*e).clone())
    }

    pub fn is_loaded(&self) -> bool {
        match &self.location {
            Some(location) => self.cache.contains_key(location),
            None => true,
        }
    }

    /// Drops the cached engine; the next job fetches it again.
    pub async fn invalidate(&self) {
        if let Some(location) = &self.location {
            info!(%location, "invalidating layout engine");
            self.cache.invalidate(location).await;
        }
    }
}
