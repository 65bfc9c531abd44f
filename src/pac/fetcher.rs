use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

enum FetchState {
    Unfetched,
    Loaded(Arc<str>),
    Failed,
}

/// Downloads and caches the PAC script body.
///
/// The script is fetched on first use and kept until [`invalidate`] is
/// called. A fetch failure is also remembered (with a single warning) so a
/// missing PAC server does not add a download attempt to every request.
///
/// [`invalidate`]: PacFetcher::invalidate
pub struct PacFetcher {
    url: Option<String>,
    state: Mutex<FetchState>,
    client: reqwest::Client,
}

impl PacFetcher {
    /// `url` may be an http(s) URL or a local file path; `None` means no PAC
    /// is configured and every request goes DIRECT.
    pub fn new(url: Option<String>) -> Self {
        let url = url.filter(|u| !u.trim().is_empty());
        PacFetcher {
            url,
            state: Mutex::new(FetchState::Unfetched),
            client: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    #[cfg(test)]
    pub fn preloaded(script: &str) -> Self {
        PacFetcher {
            url: Some("preloaded".to_string()),
            state: Mutex::new(FetchState::Loaded(Arc::from(script))),
            client: reqwest::Client::new(),
        }
    }

    pub fn configured(&self) -> bool {
        self.url.is_some()
    }

    /// Returns the PAC script body, fetching it on the first call. `None`
    /// means no PAC is configured or the last fetch failed.
    pub async fn script(&self) -> Option<Arc<str>> {
        let url = self.url.as_deref()?;
        let mut state = self.state.lock().await;
        match &*state {
            FetchState::Loaded(script) => Some(script.clone()),
            FetchState::Failed => None,
            FetchState::Unfetched => match self.fetch(url).await {
                Ok(body) => {
                    info!("loaded PAC script ({} bytes) from {url}", body.len());
                    let script: Arc<str> = Arc::from(body.as_str());
                    *state = FetchState::Loaded(script.clone());
                    Some(script)
                }
                Err(err) => {
                    warn!("failed to load PAC script from {url}, falling back to DIRECT: {err}");
                    *state = FetchState::Failed;
                    None
                }
            },
        }
    }

    /// Drops the cached script (or cached failure) so the next call fetches
    /// again.
    pub async fn invalidate(&self) {
        *self.state.lock().await = FetchState::Unfetched;
    }

    async fn fetch(&self, url: &str) -> anyhow::Result<String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self.client.get(url).send().await?.error_for_status()?;
            Ok(response.text().await?)
        } else {
            // A bare path or file:// URL points at a local PAC file.
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(tokio::fs::read_to_string(path).await?)
        }
    }
}
