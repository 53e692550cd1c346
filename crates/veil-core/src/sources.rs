//! Where list text, prebuilt snapshots and the fixes rules come from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use veil_engine::psl::{init_psl, PublicSuffixes};

use crate::error::{Error, Result};

/// File name of a leaf engine's list text.
pub fn list_file(name: &str) -> String {
    format!("{name}.txt")
}

/// File name of a leaf engine's prebuilt snapshot.
pub fn snapshot_file(name: &str) -> String {
    format!("{name}.veil")
}

/// Remote rules for the fixes family.
pub const FIXES_FILE: &str = "fixes.json";

/// Public Suffix List data.
pub const PSL_FILE: &str = "public_suffix_list.dat";

#[async_trait]
pub trait ListSource: Send + Sync {
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>>;

    async fn fetch_text(&self, path: &str) -> Result<String> {
        let bytes = self.fetch_bytes(path).await?;
        String::from_utf8(bytes).map_err(|e| Error::Fetch {
            resource: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Install the Public Suffix List `source` carries. Without one the
/// engine keeps its built-in heuristic.
pub async fn load_public_suffixes(source: &dyn ListSource) -> bool {
    let text = match source.fetch_text(PSL_FILE).await {
        Ok(text) => text,
        Err(e) => {
            log::info!("no public suffix list, using heuristic: {e}");
            return false;
        }
    };
    match PublicSuffixes::parse(&text) {
        Ok(suffixes) => {
            init_psl(suffixes);
            log::info!("public suffix list loaded");
            true
        }
        Err(e) => {
            log::warn!("{e}");
            false
        }
    }
}

/// Files shipped with the extension.
pub struct BundledListSource {
    dir: PathBuf,
}

impl BundledListSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ListSource for BundledListSource {
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(path)).await.map_err(|e| Error::Fetch {
            resource: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Plain HTTP GET below a base URL.
pub struct HttpListSource {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpListSource {
    /// Every request gives up after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        // a base without a trailing slash would lose its last segment on join
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base)
            .map_err(|e| Error::Settings(format!("invalid list base URL '{base_url}': {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Settings(format!("http client: {e}")))?;
        Ok(Self { base_url, client })
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Fetch {
                resource: path.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ListSource for HttpListSource {
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let url = self.url(path)?;
        let fetch_error = |reason: String| Error::Fetch {
            resource: url.to_string(),
            reason,
        };

        log::debug!("fetching {url}");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;
        let response = response.error_for_status().map_err(|e| fetch_error(e.to_string()))?;
        let bytes = response.bytes().await.map_err(|e| fetch_error(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// In-memory files, for embedding and tests.
#[derive(Default)]
pub struct StaticListSource {
    files: HashMap<String, Vec<u8>>,
}

impl StaticListSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, contents: impl Into<Vec<u8>>) -> Self {
        self.files.insert(path.to_string(), contents.into());
        self
    }

    /// Shorthand for `with_file(list_file(name), text)`.
    pub fn with_list(self, name: &str, text: &str) -> Self {
        self.with_file(&list_file(name), text)
    }
}

#[async_trait]
impl ListSource for StaticListSource {
    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.files.get(path).cloned().ok_or_else(|| Error::Fetch {
            resource: path.to_string(),
            reason: "not found".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_source_serves_lists() {
        let source = StaticListSource::new().with_list("ads", "||ads.com^");
        assert_eq!(source.fetch_text("ads.txt").await.unwrap(), "||ads.com^");
        assert!(matches!(source.fetch_text("tracking.txt").await, Err(Error::Fetch { .. })));
    }

    #[tokio::test]
    async fn bundled_source_reads_directory() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("ads.txt"), "||ads.com^").await.unwrap();
        let source = BundledListSource::new(dir.path());
        assert_eq!(source.fetch_text(&list_file("ads")).await.unwrap(), "||ads.com^");
        assert!(source.fetch_bytes(&snapshot_file("ads")).await.is_err());
    }

    #[test]
    fn http_urls_join_below_base() {
        let timeout = Duration::from_secs(5);
        for base in ["https://lists.example/v1", "https://lists.example/v1/"] {
            let source = HttpListSource::new(base, timeout).unwrap();
            assert_eq!(source.url("ads.txt").unwrap().as_str(), "https://lists.example/v1/ads.txt");
            assert_eq!(
                source.url(FIXES_FILE).unwrap().as_str(),
                "https://lists.example/v1/fixes.json"
            );
        }
        assert!(HttpListSource::new("lists.example", timeout).is_err());
    }
}
