// Headless Chrome sessions, one per worker.

use crate::error::{Result, ScanError};
use crate::fetcher::{FetchMode, Target, Transport};
use crate::identity::Identity;
use crate::outcome::{FetchOutcome, is_rate_limited_body};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{Headers, SetExtraHttpHeadersParams};
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Markers of the upstream's "page does not exist" template.
const NOT_FOUND_MARKERS: &[&str] = &["Page Not Found", "404 Not Found", "Introuvable"];

/// The DOM operations the harvester needs from a driven browser.
///
/// Every wait is a bounded poll; nothing sleeps on the assumption that the
/// page "should be loaded by now".
#[async_trait]
pub trait DomDriver: Send {
    async fn navigate(&mut self, url: &str) -> Result<()>;

    /// Poll until `selector` matches or `timeout` elapses. Returns whether the
    /// element showed up.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool>;

    /// Click the first element matching `selector` through script, so overlays
    /// cannot intercept it. Returns false when nothing matched.
    async fn click(&mut self, selector: &str) -> Result<bool>;

    async fn scroll_to_bottom(&mut self) -> Result<()>;

    /// Page growth metric used by the scroll loop.
    async fn page_height(&mut self) -> Result<i64>;

    async fn content(&mut self) -> Result<String>;

    async fn outer_html(&mut self, selector: &str) -> Result<Option<String>>;

    async fn is_alive(&mut self) -> bool;

    /// Tear the session down and start a fresh one.
    async fn restart(&mut self) -> Result<()>;

    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    /// Root under which each worker gets its own Chrome profile directory.
    pub profile_root: PathBuf,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: true,
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
            profile_root: std::env::temp_dir().join("canopy-profiles"),
        }
    }
}

struct ChromeSession {
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

/// [`DomDriver`] backed by a chromiumoxide-controlled Chrome process.
pub struct ChromeDriver {
    worker_id: usize,
    identity: Identity,
    options: BrowserOptions,
    session: Option<ChromeSession>,
}

impl ChromeDriver {
    pub async fn launch(worker_id: usize, identity: Identity, options: BrowserOptions) -> Result<Self> {
        let session = Self::open_session(worker_id, &identity, &options).await?;
        Ok(Self {
            worker_id,
            identity,
            options,
            session: Some(session),
        })
    }

    async fn open_session(
        worker_id: usize,
        identity: &Identity,
        options: &BrowserOptions,
    ) -> Result<ChromeSession> {
        let profile_dir = options
            .profile_root
            .join(format!("worker-{}-{}", worker_id, std::process::id()));

        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .request_timeout(options.request_timeout)
            .user_data_dir(profile_dir)
            .window_size(1920, 1080)
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            // Only the markup matters; skip image decoding entirely.
            .arg("--blink-settings=imagesEnabled=false");
        if !options.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(ScanError::Browser)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| ScanError::Browser(format!("Failed to launch Chrome: {}", e)))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| ScanError::Browser(e.to_string()))?;

        page.set_user_agent(identity.user_agent.as_str())
            .await
            .map_err(|e| ScanError::Browser(e.to_string()))?;
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(
            identity.browser_headers(),
        )))
        .await
        .map_err(|e| ScanError::Browser(e.to_string()))?;

        info!("[Worker {}] Chrome session started", worker_id);

        Ok(ChromeSession {
            browser,
            page,
            handler,
        })
    }

    fn page(&self) -> Result<&Page> {
        self.session
            .as_ref()
            .map(|s| &s.page)
            .ok_or_else(|| ScanError::SessionLost("browser session is closed".to_string()))
    }

    async fn eval_json(&mut self, script: &str) -> Result<serde_json::Value> {
        let page = self.page()?;
        let result = page
            .evaluate(script)
            .await
            .map_err(|e| ScanError::Browser(e.to_string()))?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }
}

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[async_trait]
impl DomDriver for ChromeDriver {
    async fn navigate(&mut self, url: &str) -> Result<()> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| ScanError::Browser(format!("Navigation to {} failed: {}", url, e)))?;
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<bool> {
        let script = format!("document.querySelector({}) !== null", js_string(selector));
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.eval_json(&script).await?.as_bool().unwrap_or(false) {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn click(&mut self, selector: &str) -> Result<bool> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return false; el.click(); return true; }})()",
            js_string(selector)
        );
        Ok(self.eval_json(&script).await?.as_bool().unwrap_or(false))
    }

    async fn scroll_to_bottom(&mut self) -> Result<()> {
        self.eval_json("window.scrollTo(0, document.body.scrollHeight); true")
            .await?;
        Ok(())
    }

    async fn page_height(&mut self) -> Result<i64> {
        Ok(self
            .eval_json("document.body.scrollHeight")
            .await?
            .as_i64()
            .unwrap_or(0))
    }

    async fn content(&mut self) -> Result<String> {
        let page = self.page()?;
        page.content()
            .await
            .map_err(|e| ScanError::Browser(e.to_string()))
    }

    async fn outer_html(&mut self, selector: &str) -> Result<Option<String>> {
        let script = format!(
            "(() => {{ const el = document.querySelector({}); return el ? el.outerHTML : null; }})()",
            js_string(selector)
        );
        Ok(self
            .eval_json(&script)
            .await?
            .as_str()
            .map(|s| s.to_string()))
    }

    async fn is_alive(&mut self) -> bool {
        let probe = self.eval_json("1");
        matches!(
            tokio::time::timeout(Duration::from_secs(5), probe).await,
            Ok(Ok(_))
        )
    }

    async fn restart(&mut self) -> Result<()> {
        warn!("[Worker {}] Restarting Chrome session", self.worker_id);
        self.close().await;
        let session = Self::open_session(self.worker_id, &self.identity, &self.options).await?;
        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.browser.close().await {
                debug!("[Worker {}] Chrome close: {}", self.worker_id, e);
            }
            let _ = session.browser.wait().await;
            session.handler.abort();
            debug!("[Worker {}] Chrome session closed", self.worker_id);
        }
    }
}

/// Fetch detail pages through a [`DomDriver`]. Captures the outer HTML of the
/// ready selector rather than the whole document.
pub struct BrowserTransport<D: DomDriver> {
    driver: D,
    ready_timeout: Duration,
}

impl<D: DomDriver> BrowserTransport<D> {
    pub fn new(driver: D, ready_timeout: Duration) -> Self {
        Self {
            driver,
            ready_timeout,
        }
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    /// After a driver error, check whether the browser itself died and bring
    /// up a fresh one if so.
    async fn recover(&mut self) {
        if self.driver.is_alive().await {
            return;
        }
        if let Err(e) = self.driver.restart().await {
            warn!("Browser restart failed: {}", e);
        }
    }

    async fn capture(&mut self, target: &Target, ready_selector: &str) -> Result<FetchOutcome> {
        self.driver.navigate(&target.url).await?;

        if !self
            .driver
            .wait_for(ready_selector, self.ready_timeout)
            .await?
        {
            let page = self.driver.content().await.unwrap_or_default();
            return Ok(classify_missing_container(&page));
        }

        match self.driver.outer_html(ready_selector).await? {
            Some(html) if is_rate_limited_body(&html) => Ok(FetchOutcome::RateLimited),
            Some(html) => Ok(FetchOutcome::success(html)),
            None => Ok(FetchOutcome::Timeout),
        }
    }
}

/// Rendered page without the detail container: throttled, missing, or slow.
pub fn classify_missing_container(page: &str) -> FetchOutcome {
    if is_rate_limited_body(page) {
        FetchOutcome::RateLimited
    } else if NOT_FOUND_MARKERS.iter().any(|m| page.contains(m)) {
        FetchOutcome::NotFound
    } else {
        FetchOutcome::Timeout
    }
}

#[async_trait]
impl<D: DomDriver> Transport for BrowserTransport<D> {
    async fn attempt(&mut self, target: &Target) -> FetchOutcome {
        let ready_selector = match &target.mode {
            FetchMode::Rendered { ready_selector } => ready_selector.clone(),
            FetchMode::Http => "body".to_string(),
        };

        match self.capture(target, &ready_selector).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Browser fetch of {} failed: {}", target.url, e);
                self.recover().await;
                FetchOutcome::NetworkError(e.to_string())
            }
        }
    }

    async fn close(&mut self) {
        self.driver.close().await;
    }
}
