use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::error::FetchError;
use crate::settings::RenderSettings;

const SCROLL_TO_BOTTOM: &str = "window.scrollTo(0, document.body.scrollHeight)";

struct LaunchedBrowser {
    browser: Arc<Browser>,
    handler: JoinHandle<()>,
}

/// Headless Chrome, launched on the first rendered request and shared afterwards.
pub struct BrowserRenderer {
    settings: RenderSettings,
    browser: Mutex<Option<LaunchedBrowser>>,
}

impl BrowserRenderer {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            settings,
            browser: Mutex::new(None),
        }
    }

    /// Load the page, scroll to the bottom `scroll_iterations` times with a pause
    /// after each, then return the DOM. The whole sequence is bounded by the render
    /// timeout, and the tab is closed whether it succeeds, fails or times out.
    pub async fn render(&self, url: &Url) -> Result<String, FetchError> {
        let browser = self.browser().await?;
        let limit = self.settings.timeout;
        let deadline = Instant::now() + limit;

        let page = tokio::time::timeout_at(deadline, browser.new_page(url.as_str()))
            .await
            .map_err(|_| {
                warn!(url = %url, ?limit, "Render timed out opening a tab");
                FetchError::Timeout(limit)
            })?
            .map_err(render_error)?;

        let html = run_then_close(deadline, limit, self.scroll_page(&page), close_page(page.clone(), url))
            .await
            .inspect_err(|e| warn!(url = %url, error = %e, "Render failed"))?;
        debug!(url = %url, bytes = html.len(), "Rendered");
        Ok(html)
    }

    async fn scroll_page(&self, page: &Page) -> Result<String, FetchError> {
        page.wait_for_navigation().await.map_err(render_error)?;
        for _ in 0..self.settings.scroll_iterations {
            page.evaluate(SCROLL_TO_BOTTOM).await.map_err(render_error)?;
            tokio::time::sleep(self.settings.scroll_pause).await;
        }
        page.content().await.map_err(render_error)
    }

    async fn browser(&self) -> Result<Arc<Browser>, FetchError> {
        let mut slot = self.browser.lock().await;
        if let Some(launched) = slot.as_ref() {
            return Ok(Arc::clone(&launched.browser));
        }

        let mut builder = BrowserConfig::builder()
            .request_timeout(self.settings.timeout)
            .arg("--no-sandbox")
            .arg("--disable-gpu")
            .arg("--mute-audio");
        if let Some(path) = &self.settings.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let config = builder.build().map_err(FetchError::Render)?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(render_error)?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!(error = %e, "Browser handler error");
                }
            }
        });
        info!("Launched headless browser");

        let browser = Arc::new(browser);
        *slot = Some(LaunchedBrowser {
            browser: Arc::clone(&browser),
            handler,
        });
        Ok(browser)
    }

    /// Close the browser if one was launched. Renders still in flight keep their handle.
    pub async fn close(&self) {
        let Some(launched) = self.browser.lock().await.take() else {
            return;
        };
        match Arc::try_unwrap(launched.browser) {
            Ok(mut browser) => {
                if let Err(e) = browser.close().await {
                    warn!(error = %e, "Failed to close browser");
                }
                let _ = browser.wait().await;
            }
            Err(_) => warn!("Browser still in use at shutdown"),
        }
        launched.handler.abort();
        info!("Closed headless browser");
    }
}

/// Drive `work` until `deadline`, then always await `cleanup` before returning.
async fn run_then_close<T>(
    deadline: Instant,
    limit: Duration,
    work: impl Future<Output = Result<T, FetchError>>,
    cleanup: impl Future<Output = ()>,
) -> Result<T, FetchError> {
    let result = match tokio::time::timeout_at(deadline, work).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(limit)),
    };
    cleanup.await;
    result
}

async fn close_page(page: Page, url: &Url) {
    if let Err(e) = page.close().await {
        debug!(url = %url, error = %e, "Failed to close page");
    }
}

fn render_error(e: chromiumoxide::error::CdpError) -> FetchError {
    FetchError::Render(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn mark(closed: &AtomicBool) {
        closed.store(true, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn tab_is_closed_after_success() {
        let closed = AtomicBool::new(false);
        let limit = Duration::from_secs(5);
        let html = run_then_close(
            Instant::now() + limit,
            limit,
            async { Ok::<_, FetchError>("<html></html>".to_string()) },
            mark(&closed),
        )
        .await
        .unwrap();
        assert_eq!(html, "<html></html>");
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tab_is_closed_after_failed_step() {
        let closed = AtomicBool::new(false);
        let limit = Duration::from_secs(5);
        let result = run_then_close(
            Instant::now() + limit,
            limit,
            async { Err::<String, _>(FetchError::Render("navigation failed".into())) },
            mark(&closed),
        )
        .await;
        assert!(matches!(result, Err(FetchError::Render(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tab_is_closed_after_timeout() {
        let closed = AtomicBool::new(false);
        let limit = Duration::from_millis(20);
        let result = run_then_close(
            Instant::now() + limit,
            limit,
            std::future::pending::<Result<String, FetchError>>(),
            mark(&closed),
        )
        .await;
        assert!(matches!(result, Err(FetchError::Timeout(d)) if d == limit));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn close_without_launch_is_noop() {
        let renderer = BrowserRenderer::new(RenderSettings::default());
        renderer.close().await;
        assert!(renderer.browser.lock().await.is_none());
    }

    // Needs a local Chrome. Run with: cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn renders_script_built_dom() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/")
            .with_header("content-type", "text/html")
            .with_body(
                r#"<html lang="et"><body><div id="app"></div>
                <script>document.getElementById('app').innerHTML = '<h1>Tere</h1>';</script>
                </body></html>"#,
            )
            .create_async()
            .await;

        let renderer = BrowserRenderer::new(RenderSettings {
            scroll_iterations: 1,
            scroll_pause: Duration::from_millis(50),
            ..RenderSettings::default()
        });
        let url = Url::parse(&format!("{}/", server.url())).unwrap();
        let html = renderer.render(&url).await.unwrap();
        renderer.close().await;
        assert!(html.contains("<h1>Tere</h1>"));
    }
}
