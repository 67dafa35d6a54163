use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use texting_robots::Robot;
use tracing::{debug, warn};
use url::Url;

use super::FetchedPage;
use crate::error::FetchError;

/// Plain GET client. robots.txt is fetched once per origin and cached for the
/// lifetime of the fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agent: String,
    timeout: Duration,
    obey_robots: bool,
    // None: no usable robots.txt, everything allowed
    robots: DashMap<String, Option<Arc<Robot>>>,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration, obey_robots: bool) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            timeout,
            obey_robots,
            robots: DashMap::new(),
        })
    }

    pub async fn get(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        self.check_robots(url).await?;

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        let status = resp.status().as_u16();
        let final_url = resp.url().clone();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(|e| self.transport(e))?.to_vec();
        debug!(url = %url, status, bytes = body.len(), "Fetched");

        Ok(FetchedPage {
            url: final_url,
            status,
            headers,
            body,
        })
    }

    pub async fn check_robots(&self, url: &Url) -> Result<(), FetchError> {
        if !self.obey_robots {
            return Ok(());
        }
        let robot = self.robots_for(url).await?;
        match robot {
            Some(robot) if !robot.allowed(url.as_str()) => {
                Err(FetchError::Disallowed(url.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn robots_for(&self, url: &Url) -> Result<Option<Arc<Robot>>, FetchError> {
        let origin = url.origin().ascii_serialization();
        if let Some(cached) = self.robots.get(&origin) {
            return Ok(cached.clone());
        }

        let robots_url = url
            .join("/robots.txt")
            .map_err(|e| FetchError::InvalidUrl(format!("{url}: {e}")))?;
        let robot = match self.client.get(robots_url.clone()).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.bytes().await.unwrap_or_default();
                match Robot::new(&self.user_agent, &body) {
                    Ok(robot) => Some(Arc::new(robot)),
                    Err(e) => {
                        warn!(url = %robots_url, error = %e, "Unparsable robots.txt, allowing all");
                        None
                    }
                }
            }
            Ok(resp) => {
                debug!(url = %robots_url, status = resp.status().as_u16(), "No robots.txt");
                None
            }
            Err(e) => {
                warn!(url = %robots_url, error = %e, "robots.txt unreachable, allowing all");
                None
            }
        };

        self.robots.insert(origin, robot.clone());
        Ok(robot)
    }

    fn transport(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Transport(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::CONTENT_TYPE;

    fn fetcher(obey_robots: bool) -> HttpFetcher {
        HttpFetcher::new("site_scraper-test", Duration::from_secs(5), obey_robots).unwrap()
    }

    #[tokio::test]
    async fn returns_status_headers_and_body() {
        let mut server = mockito::Server::new_async().await;
        let _robots = server.mock("GET", "/robots.txt").with_status(404).create_async().await;
        let page = server
            .mock("GET", "/doc.pdf")
            .with_status(200)
            .with_header("content-type", "application/pdf")
            .with_header("last-modified", "Wed, 21 Oct 2015 07:28:00 GMT")
            .with_body("%PDF-1.4")
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/doc.pdf", server.url())).unwrap();
        let fetched = fetcher(true).get(&url).await.unwrap();
        page.assert_async().await;
        assert_eq!(fetched.status, 200);
        assert_eq!(fetched.headers[CONTENT_TYPE], "application/pdf");
        assert_eq!(fetched.last_modified(), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(fetched.body, b"%PDF-1.4");
    }

    #[tokio::test]
    async fn error_statuses_are_pages_not_errors() {
        let mut server = mockito::Server::new_async().await;
        let _m = server.mock("GET", "/missing").with_status(404).create_async().await;
        let url = Url::parse(&format!("{}/missing", server.url())).unwrap();
        let fetched = fetcher(false).get(&url).await.unwrap();
        assert_eq!(fetched.status, 404);
    }

    #[tokio::test]
    async fn robots_disallow_is_enforced_and_cached() {
        let mut server = mockito::Server::new_async().await;
        let robots = server
            .mock("GET", "/robots.txt")
            .with_status(200)
            .with_body("User-agent: *\nDisallow: /private\n")
            .expect(1)
            .create_async()
            .await;
        let _open = server.mock("GET", "/open").with_status(200).create_async().await;

        let fetcher = fetcher(true);
        let private = Url::parse(&format!("{}/private/x", server.url())).unwrap();
        let open = Url::parse(&format!("{}/open", server.url())).unwrap();

        assert!(matches!(
            fetcher.get(&private).await,
            Err(FetchError::Disallowed(_))
        ));
        assert_eq!(fetcher.get(&open).await.unwrap().status, 200);
        robots.assert_async().await;
    }

    #[tokio::test]
    async fn robots_ignored_when_not_obeyed() {
        let mut server = mockito::Server::new_async().await;
        let robots = server
            .mock("GET", "/robots.txt")
            .with_body("User-agent: *\nDisallow: /\n")
            .expect(0)
            .create_async()
            .await;
        let _page = server.mock("GET", "/").with_status(200).create_async().await;

        let url = Url::parse(&format!("{}/", server.url())).unwrap();
        assert_eq!(fetcher(false).get(&url).await.unwrap().status, 200);
        robots.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let url = Url::parse("http://127.0.0.1:1/").unwrap();
        assert!(matches!(
            fetcher(false).get(&url).await,
            Err(FetchError::Transport(_))
        ));
    }
}
