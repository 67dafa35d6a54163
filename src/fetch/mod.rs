//! Fetch engine: a plain HTTP client and a headless browser behind one trait.

mod http;
mod render;

pub use http::HttpFetcher;
pub use render::BrowserRenderer;

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use reqwest::header::{HeaderMap, CONTENT_TYPE, LAST_MODIFIED};
use url::Url;

use crate::crawl::classify::FetchStrategy;
use crate::error::FetchError;
use crate::settings::Settings;

/// One fetched document as seen by the crawl handlers.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: Url,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FetchedPage {
    /// Body decoded by the Content-Type charset. Missing or unknown labels fall back
    /// to UTF-8; a byte order mark overrides the header.
    pub fn text(&self) -> String {
        let encoding = self
            .charset()
            .and_then(|label| Encoding::for_label(label.as_bytes()))
            .unwrap_or(UTF_8);
        let (text, _, _) = encoding.decode(&self.body);
        text.into_owned()
    }

    pub fn charset(&self) -> Option<&str> {
        self.content_type()?
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, value)| value.trim().trim_matches('"'))
    }

    pub fn header(&self, name: reqwest::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header(LAST_MODIFIED)
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// `Static` is a plain GET. `Rendered` loads the page in a browser, runs the
    /// scroll sequence and returns the resulting DOM as the body.
    async fn fetch(&self, url: &Url, strategy: FetchStrategy) -> Result<FetchedPage, FetchError>;
}

/// Production fetcher: reqwest for static pages, Chrome for rendered ones.
pub struct EngineFetcher {
    http: HttpFetcher,
    renderer: BrowserRenderer,
}

impl EngineFetcher {
    pub fn new(settings: &Settings) -> Result<Self, FetchError> {
        Ok(Self {
            http: HttpFetcher::new(
                &settings.user_agent,
                settings.request_timeout(),
                settings.obey_robots_txt,
            )?,
            renderer: BrowserRenderer::new(settings.render()),
        })
    }

    pub async fn shutdown(&self) {
        self.renderer.close().await;
    }
}

#[async_trait]
impl Fetcher for EngineFetcher {
    async fn fetch(&self, url: &Url, strategy: FetchStrategy) -> Result<FetchedPage, FetchError> {
        match strategy {
            FetchStrategy::Static => self.http.get(url).await,
            FetchStrategy::Rendered => {
                self.http.check_robots(url).await?;
                let html = self.renderer.render(url).await?;
                Ok(FetchedPage {
                    url: url.clone(),
                    status: 200,
                    headers: HeaderMap::new(),
                    body: html.into_bytes(),
                })
            }
        }
    }
}
