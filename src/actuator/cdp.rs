//! Chrome DevTools Protocol actuator.
//!
//! Attaches to a Chrome/Chromium started with remote debugging enabled:
//! `google-chrome --remote-debugging-port=9222`

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{Actuator, ActuatorError, PageState, Viewport, WaitUntil};
use crate::config::BrowserConfig;

/// Live DevTools session.
struct BrowserSession {
    #[allow(dead_code)]
    browser: Browser,
    page: Page,
    handler: JoinHandle<()>,
}

/// Actuator backed by a remote Chrome instance.
pub struct CdpActuator {
    config: BrowserConfig,
    session: Mutex<Option<BrowserSession>>,
}

impl CdpActuator {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
        }
    }

    async fn page(&self) -> Result<Page, ActuatorError> {
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .map(|session| session.page.clone())
            .ok_or(ActuatorError::NotInitialized)
    }
}

async fn with_timeout<F, T>(operation: &str, after: Duration, fut: F) -> Result<T, ActuatorError>
where
    F: Future<Output = Result<T, ActuatorError>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(ActuatorError::Timeout {
            operation: operation.to_string(),
            after,
        }),
    }
}

fn op_err(e: impl std::fmt::Display) -> ActuatorError {
    ActuatorError::Operation(e.to_string())
}

/// How long the resource count must stay flat for the network to count as idle.
const NETWORK_IDLE_WINDOW: Duration = Duration::from_millis(500);
const NETWORK_IDLE_POLL: Duration = Duration::from_millis(100);

async fn ready_state(page: &Page) -> Result<String, ActuatorError> {
    page.evaluate("document.readyState")
        .await
        .map_err(op_err)?
        .into_value::<String>()
        .map_err(op_err)
}

async fn wait_for_dom_content(page: &Page) -> Result<(), ActuatorError> {
    while ready_state(page).await? == "loading" {
        tokio::time::sleep(NETWORK_IDLE_POLL).await;
    }
    Ok(())
}

async fn resource_count(page: &Page) -> Result<u64, ActuatorError> {
    page.evaluate("performance.getEntriesByType('resource').length")
        .await
        .map_err(op_err)?
        .into_value::<u64>()
        .map_err(op_err)
}

async fn wait_for_network_idle(page: &Page) -> Result<(), ActuatorError> {
    let mut last = resource_count(page).await?;
    let mut quiet = Duration::ZERO;
    while quiet < NETWORK_IDLE_WINDOW {
        tokio::time::sleep(NETWORK_IDLE_POLL).await;
        let now = resource_count(page).await?;
        if now == last {
            quiet += NETWORK_IDLE_POLL;
        } else {
            last = now;
            quiet = Duration::ZERO;
        }
    }
    Ok(())
}

#[async_trait]
impl Actuator for CdpActuator {
    async fn is_initialized(&self) -> bool {
        self.session.lock().await.is_some()
    }

    async fn initialize(&self) -> Result<(), ActuatorError> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let endpoint = self.config.cdp_url.clone();
        let (browser, mut handler) =
            Browser::connect(&endpoint)
                .await
                .map_err(|e| ActuatorError::Connection {
                    endpoint: endpoint.clone(),
                    message: e.to_string(),
                })?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!("Browser event error: {}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                handler.abort();
                return Err(op_err(e));
            }
        };

        tracing::info!(endpoint = %endpoint, "Browser session started");
        *guard = Some(BrowserSession {
            browser,
            page,
            handler,
        });
        Ok(())
    }

    async fn navigate(
        &self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<String, ActuatorError> {
        let page = self.page().await?;
        with_timeout("navigate", timeout, async {
            page.goto(url).await.map_err(op_err)?;
            match wait_until {
                WaitUntil::Commit => {}
                WaitUntil::DomContentLoaded => wait_for_dom_content(&page).await?,
                WaitUntil::Load => {
                    page.wait_for_navigation().await.map_err(op_err)?;
                }
                WaitUntil::NetworkIdle => {
                    page.wait_for_navigation().await.map_err(op_err)?;
                    wait_for_network_idle(&page).await?;
                }
            }
            page.content().await.map_err(op_err)
        })
        .await
    }

    async fn content(&self) -> Result<String, ActuatorError> {
        let page = self.page().await?;
        with_timeout("get_dom", self.config.default_timeout, async {
            page.content().await.map_err(op_err)
        })
        .await
    }

    async fn capture_screenshot(&self, full_page: bool) -> Result<Vec<u8>, ActuatorError> {
        let page = self.page().await?;
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(full_page)
            .build();
        with_timeout("capture_screenshot", self.config.default_timeout, async {
            page.screenshot(params).await.map_err(op_err)
        })
        .await
    }

    async fn page_state(&self) -> Result<PageState, ActuatorError> {
        let page = self.page().await?;
        with_timeout("page_state", self.config.default_timeout, async {
            let url = page.url().await.map_err(op_err)?.unwrap_or_default();
            let title = page.get_title().await.map_err(op_err)?.unwrap_or_default();
            let viewport = page
                .evaluate("({ width: window.innerWidth, height: window.innerHeight })")
                .await
                .ok()
                .and_then(|v| v.into_value::<Viewport>().ok());
            let ready_state = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|v| v.into_value::<String>().ok());
            Ok(PageState {
                url,
                title,
                viewport,
                ready_state,
            })
        })
        .await
    }

    async fn click(&self, selector: &str, timeout: Duration) -> Result<(), ActuatorError> {
        let page = self.page().await?;
        with_timeout("click_element", timeout, async {
            let element = page
                .find_element(selector)
                .await
                .map_err(|_| ActuatorError::ElementNotFound(selector.to_string()))?;
            element.click().await.map_err(op_err)?;
            Ok(())
        })
        .await
    }

    async fn type_text(
        &self,
        selector: &str,
        text: &str,
        delay: Duration,
    ) -> Result<(), ActuatorError> {
        let page = self.page().await?;
        // Typing time scales with the text length, on top of the lookup budget.
        let budget = self.config.default_timeout + delay.saturating_mul(text.chars().count() as u32);
        with_timeout("input_text", budget, async {
            let element = page
                .find_element(selector)
                .await
                .map_err(|_| ActuatorError::ElementNotFound(selector.to_string()))?;

            element.click().await.map_err(op_err)?;
            page.evaluate("document.activeElement.value = ''")
                .await
                .map_err(op_err)?;

            if delay.is_zero() {
                element.type_str(text).await.map_err(op_err)?;
            } else {
                for ch in text.chars() {
                    element.type_str(ch.to_string()).await.map_err(op_err)?;
                    tokio::time::sleep(delay).await;
                }
            }
            Ok(())
        })
        .await
    }

    async fn close(&self) -> Result<(), ActuatorError> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            let result = session.page.close().await.map_err(op_err);
            session.handler.abort();
            tracing::info!("Browser session closed");
            result?;
        }
        Ok(())
    }
}
