//! Browser session capability + side-channel artifact storage for scholar crawls.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::element::Element;
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scholar-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub file_name: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Writes raw page bodies that could not be parsed, for manual inspection.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn warning_file_name(id: Uuid) -> String {
        format!("warning_{id}.html")
    }

    /// Store a page body under a fresh random name using an atomic temp-file rename.
    pub async fn store_warning_page(&self, body: &str) -> anyhow::Result<StoredArtifact> {
        let bytes = body.as_bytes();
        let content_hash = Self::sha256_hex(bytes);
        let file_name = Self::warning_file_name(Uuid::new_v4());
        let absolute_path = self.root.join(&file_name);

        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating artifact directory {}", self.root.display()))?;

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredArtifact {
            content_hash,
            file_name,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("launching browser: {0}")]
    Launch(String),
    #[error("devtools protocol: {0}")]
    Cdp(#[from] CdpError),
    #[error("navigation to {url} timed out after {secs}s")]
    NavigationTimeout { url: String, secs: u64 },
    #[error("element #{0} not found")]
    ElementNotFound(String),
}

/// The slice of browser automation the crawler relies on.
///
/// Elements are addressed by their DOM id; a session owns exactly one page.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Navigate and block until the load completes.
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    async fn title(&self) -> Result<Option<String>, BrowserError>;

    /// Serialised HTML of the live document, including script-rendered content.
    async fn page_source(&self) -> Result<String, BrowserError>;

    async fn has_element(&self, element_id: &str) -> Result<bool, BrowserError>;

    /// `Ok(None)` when either the element or the attribute is missing.
    async fn element_attribute(
        &self,
        element_id: &str,
        attribute: &str,
    ) -> Result<Option<String>, BrowserError>;

    async fn click_element(&self, element_id: &str) -> Result<(), BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[derive(Debug, Clone)]
pub struct BrowserSessionConfig {
    pub headless: bool,
    pub chrome_executable: Option<PathBuf>,
    pub navigation_timeout: Duration,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_executable: None,
            navigation_timeout: Duration::from_secs(30),
        }
    }
}

/// A single-page Chromium session driven over the DevTools protocol.
pub struct ChromeSession {
    browser: Mutex<Browser>,
    page: Page,
    handler: Mutex<Option<JoinHandle<()>>>,
    navigation_timeout: Duration,
}

impl ChromeSession {
    pub async fn launch(config: &BrowserSessionConfig) -> Result<Self, BrowserError> {
        let mut builder = BrowserConfig::builder();
        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!("browser handler stopped: {err}");
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        Ok(Self {
            browser: Mutex::new(browser),
            page,
            handler: Mutex::new(Some(handler)),
            navigation_timeout: config.navigation_timeout,
        })
    }

    async fn find_by_id(&self, element_id: &str) -> Result<Option<Element>, BrowserError> {
        let mut found = self.page.find_elements(format!("#{element_id}")).await?;
        if found.is_empty() {
            return Ok(None);
        }
        Ok(Some(found.swap_remove(0)))
    }
}

#[async_trait]
impl BrowserSession for ChromeSession {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        debug!(url, "navigating");
        match tokio::time::timeout(self.navigation_timeout, self.page.goto(url)).await {
            Ok(result) => {
                result?;
                Ok(())
            }
            Err(_) => Err(BrowserError::NavigationTimeout {
                url: url.to_string(),
                secs: self.navigation_timeout.as_secs(),
            }),
        }
    }

    async fn title(&self) -> Result<Option<String>, BrowserError> {
        Ok(self.page.get_title().await?)
    }

    async fn page_source(&self) -> Result<String, BrowserError> {
        Ok(self.page.content().await?)
    }

    async fn has_element(&self, element_id: &str) -> Result<bool, BrowserError> {
        Ok(self.find_by_id(element_id).await?.is_some())
    }

    async fn element_attribute(
        &self,
        element_id: &str,
        attribute: &str,
    ) -> Result<Option<String>, BrowserError> {
        match self.find_by_id(element_id).await? {
            Some(element) => Ok(element.attribute(attribute).await?),
            None => Ok(None),
        }
    }

    async fn click_element(&self, element_id: &str) -> Result<(), BrowserError> {
        let element = self
            .find_by_id(element_id)
            .await?
            .ok_or_else(|| BrowserError::ElementNotFound(element_id.to_string()))?;
        element.click().await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let closed = shut_down(&mut *self.browser.lock().await).await;
        if let Some(handler) = self.handler.lock().await.take() {
            handler.abort();
        }
        closed
    }
}

/// Process-level controls used when tearing a browser down.
#[async_trait]
trait BrowserProcess: Send {
    async fn request_close(&mut self) -> Result<(), CdpError>;

    async fn wait_exit(&mut self) -> std::io::Result<()>;

    async fn force_kill(&mut self) -> Option<std::io::Result<()>>;
}

#[async_trait]
impl BrowserProcess for Browser {
    async fn request_close(&mut self) -> Result<(), CdpError> {
        self.close().await.map(|_| ())
    }

    async fn wait_exit(&mut self) -> std::io::Result<()> {
        self.wait().await.map(|_| ())
    }

    async fn force_kill(&mut self) -> Option<std::io::Result<()>> {
        self.kill().await
    }
}

/// Waits for a clean exit only after the close request succeeded; a browser
/// that refused to close is killed instead.
async fn shut_down<P: BrowserProcess + ?Sized>(process: &mut P) -> Result<(), BrowserError> {
    match process.request_close().await {
        Ok(()) => {
            if let Err(err) = process.wait_exit().await {
                warn!("waiting for browser process to exit: {err}");
            }
            Ok(())
        }
        Err(err) => {
            warn!("browser did not close cleanly, killing it: {err}");
            if let Some(Err(kill_err)) = process.force_kill().await {
                warn!("killing browser process: {kill_err}");
            }
            Err(err.into())
        }
    }
}
