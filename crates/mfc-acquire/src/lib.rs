//! Layered acquisition of raw match data: structured API probe first,
//! headless-browser rendering of the club pages as fallback.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use mfc_core::RawFragment;
use mfc_extract::{discover_sub_links, extract_fragments, extract_team_names, fragments_from_json};
use mfc_storage::{ArtifactDumpStore, HttpClientConfig, HttpFetcher};
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "mfc-acquire";

/// Candidate structured-data endpoints for a club, probed in order.
/// `{club_id}` is substituted with the configured club identifier.
pub const DEFAULT_API_ENDPOINTS: &[&str] = &[
    "https://api-dofa.fff.fr/api/clubs/{club_id}/equipes",
    "https://api-dofa.fff.fr/api/clubs/{club_id}/matchs",
];

const DEFAULT_MAX_SUB_LINKS: usize = 10;

#[derive(Debug, Clone)]
pub struct AcquireConfig {
    pub club_id: String,
    pub club_name: String,
    /// Canonical club page, the root of the browser fallback.
    pub club_url: String,
    pub api_endpoints: Vec<String>,
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    pub browser_timeout: Duration,
    pub max_sub_links: usize,
}

impl AcquireConfig {
    pub fn new(
        club_id: impl Into<String>,
        club_name: impl Into<String>,
        club_url: impl Into<String>,
        browserless_url: impl Into<String>,
    ) -> Self {
        Self {
            club_id: club_id.into(),
            club_name: club_name.into(),
            club_url: club_url.into(),
            api_endpoints: DEFAULT_API_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            browserless_url: browserless_url.into(),
            browserless_token: None,
            browser_timeout: Duration::from_secs(30),
            max_sub_links: DEFAULT_MAX_SUB_LINKS,
        }
    }
}

/// Everything one acquisition pass produced, whichever channel won.
#[derive(Debug, Clone, Default)]
pub struct Acquisition {
    pub fragments: Vec<RawFragment>,
    pub team_names: Vec<String>,
    /// True when the structured API probe answered; false for the browser
    /// fallback path.
    pub via_api: bool,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("browserless returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Thin client for a browserless `/content` endpoint: posts a navigation
/// request, gets the fully rendered HTML back.
#[derive(Debug, Clone)]
pub struct BrowserlessClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    navigation_timeout_ms: u64,
}

impl BrowserlessClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        navigation_timeout: Duration,
    ) -> anyhow::Result<Self> {
        // The outer HTTP timeout must outlive the in-browser navigation one.
        let http = reqwest::Client::builder()
            .timeout(navigation_timeout + Duration::from_secs(10))
            .build()
            .context("building browserless http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            navigation_timeout_ms: navigation_timeout.as_millis() as u64,
        })
    }

    pub async fn content(&self, url: &str) -> Result<String, AcquireError> {
        let endpoint = match &self.token {
            Some(token) => format!("{}/content?token={token}", self.base_url),
            None => format!("{}/content", self.base_url),
        };
        let body = serde_json::json!({
            "url": url,
            "gotoOptions": {
                "waitUntil": "networkidle2",
                "timeout": self.navigation_timeout_ms,
            },
            "rejectResourceTypes": ["image", "stylesheet", "font", "media"],
        });

        let resp = self.http.post(&endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AcquireError::Api {
                status: status.as_u16(),
                message: clip_message(&body, 300),
            });
        }
        Ok(resp.text().await?)
    }
}

/// Error bodies can be whole HTML pages, often non-ASCII; keep a readable
/// prefix without splitting a multi-byte character.
fn clip_message(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

/// Substitutes the club identifier into an endpoint template.
pub fn render_endpoint(template: &str, club_id: &str) -> String {
    template.replace("{club_id}", club_id)
}

/// Resolves discovered hrefs against the club page, keeping only same-host
/// targets and dropping duplicates, capped at `max`.
pub fn resolve_sub_links(base: &Url, hrefs: &[String], max: usize) -> Vec<Url> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for href in hrefs {
        if out.len() >= max {
            break;
        }
        let Ok(resolved) = base.join(href) else {
            debug!(%href, "unparseable sub-link, skipping");
            continue;
        };
        if resolved.host_str() != base.host_str() {
            continue;
        }
        if resolved.as_str() == base.as_str() {
            continue;
        }
        if seen.insert(resolved.to_string()) {
            out.push(resolved);
        }
    }
    out
}

pub struct Acquirer {
    config: AcquireConfig,
    fetcher: HttpFetcher,
    browser: BrowserlessClient,
    dumps: Option<ArtifactDumpStore>,
}

impl Acquirer {
    pub fn new(config: AcquireConfig, dumps: Option<ArtifactDumpStore>) -> anyhow::Result<Self> {
        // Federation endpoints answer differently to obvious bot agents.
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                         Chrome/120.0 Safari/537.36"
                .to_string(),
            ..HttpClientConfig::default()
        })?;
        let browser = BrowserlessClient::new(
            &config.browserless_url,
            config.browserless_token.clone(),
            config.browser_timeout,
        )?;
        Ok(Self {
            config,
            fetcher,
            browser,
            dumps,
        })
    }

    /// Runs the layered strategy: the first channel that answers wins, with
    /// no merge between them. Only a failed initial browser navigation is a
    /// hard error; everything below that is logged and skipped.
    pub async fn acquire(&self) -> anyhow::Result<Acquisition> {
        if let Some(acquisition) = self.probe_api().await {
            return Ok(acquisition);
        }
        info!("no structured endpoint answered, falling back to browser rendering");
        self.browse().await
    }

    async fn probe_api(&self) -> Option<Acquisition> {
        for template in &self.config.api_endpoints {
            let url = render_endpoint(template, &self.config.club_id);
            match self.fetcher.fetch(&url, Some("application/json")).await {
                Ok(resp) => {
                    let body = resp.body_text();
                    if body.trim().is_empty() {
                        debug!(%url, "endpoint answered with an empty body");
                        continue;
                    }
                    self.dump("api-response", "json", body.as_bytes()).await;
                    let fragments = fragments_from_json(&body, &url);
                    info!(%url, fragments = fragments.len(), "structured endpoint answered");
                    return Some(Acquisition {
                        fragments,
                        team_names: Vec::new(),
                        via_api: true,
                    });
                }
                Err(err) => {
                    warn!(%url, error = %err, "endpoint probe failed, trying next");
                }
            }
        }
        None
    }

    async fn browse(&self) -> anyhow::Result<Acquisition> {
        let html = self
            .browser
            .content(&self.config.club_url)
            .await
            .with_context(|| format!("rendering club page {}", self.config.club_url))?;
        self.dump("club-page", "html", html.as_bytes()).await;

        let mut fragments = extract_fragments(&html, &self.config.club_url);
        let mut team_names = extract_team_names(&html);

        let base = Url::parse(&self.config.club_url)
            .with_context(|| format!("parsing club url {}", self.config.club_url))?;
        let hrefs = discover_sub_links(&html);
        let links = resolve_sub_links(&base, &hrefs, self.config.max_sub_links);
        info!(candidates = hrefs.len(), followed = links.len(), "exploring sub-links");

        for link in links {
            match self.browser.content(link.as_str()).await {
                Ok(page) => {
                    self.dump("sub-page", "html", page.as_bytes()).await;
                    fragments.extend(extract_fragments(&page, link.as_str()));
                    team_names.extend(extract_team_names(&page));
                }
                Err(err) => {
                    warn!(url = %link, error = %err, "sub-link rendering failed, skipping");
                }
            }
        }

        dedup_in_order(&mut fragments, |f| f.text.clone());
        dedup_in_order(&mut team_names, |n| n.to_lowercase());

        Ok(Acquisition {
            fragments,
            team_names,
            via_api: false,
        })
    }

    async fn dump(&self, label: &str, ext: &str, bytes: &[u8]) {
        let Some(store) = &self.dumps else { return };
        match store.store_bytes(label, ext, bytes).await {
            Ok(path) => debug!(path = %path.display(), "raw artifact dumped"),
            Err(err) => warn!(error = %err, "artifact dump failed"),
        }
    }
}

fn dedup_in_order<T, K, F>(items: &mut Vec<T>, mut key: F)
where
    K: std::hash::Hash + Eq,
    F: FnMut(&T) -> K,
{
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(key(item)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_templates_substitute_club_id() {
        assert_eq!(
            render_endpoint("https://api-dofa.fff.fr/api/clubs/{club_id}/matchs", "563920"),
            "https://api-dofa.fff.fr/api/clubs/563920/matchs"
        );
        assert_eq!(render_endpoint("https://example.org/static", "563920"), "https://example.org/static");
    }

    #[test]
    fn sub_links_stay_on_host_and_are_capped() {
        let base = Url::parse("https://magnyfc78.fr/club").expect("base url");
        let hrefs = vec![
            "/calendrier".to_string(),
            "https://magnyfc78.fr/resultats".to_string(),
            "https://elsewhere.example/calendrier".to_string(),
            "/calendrier".to_string(),
            "/equipes/seniors".to_string(),
        ];
        let links = resolve_sub_links(&base, &hrefs, 2);
        let rendered: Vec<_> = links.iter().map(Url::as_str).collect();
        assert_eq!(
            rendered,
            vec!["https://magnyfc78.fr/calendrier", "https://magnyfc78.fr/resultats"]
        );
    }

    #[test]
    fn sub_link_resolution_skips_the_base_page_itself() {
        let base = Url::parse("https://magnyfc78.fr/club").expect("base url");
        let hrefs = vec![
            "https://magnyfc78.fr/club".to_string(),
            "https://[not-a-host/calendrier".to_string(),
        ];
        assert!(resolve_sub_links(&base, &hrefs, 10).is_empty());
    }

    #[test]
    fn error_messages_clip_on_char_boundaries() {
        let body = format!("x{}", "€".repeat(150));
        assert_eq!(clip_message(&body, 300), body);

        let page = "é".repeat(400);
        let clipped = clip_message(&page, 300);
        assert_eq!(clipped.chars().count(), 300);
        assert!(page.starts_with(&clipped));
    }

    #[test]
    fn default_config_carries_the_probe_list() {
        let config = AcquireConfig::new("563920", "Magny FC 78", "https://magnyfc78.fr", "http://localhost:3000");
        assert_eq!(config.api_endpoints.len(), DEFAULT_API_ENDPOINTS.len());
        assert_eq!(config.max_sub_links, 10);
    }
}
