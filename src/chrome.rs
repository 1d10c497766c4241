//! Chrome implementation of the renderer traits
//!
//! Each [`ChromeBrowser`] owns one headless Chrome process plus the task that
//! drives its DevTools connection. Pages are plain chromiumoxide pages with
//! the job's viewport applied through device-metrics emulation.

use crate::renderer::{Browser, BrowserLauncher, ClickableElement, ElementQuery, PageHandle};
use crate::{create_browser_config, BrowserKind, CaptureError, Config, Viewport};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const LINKS_SCRIPT: &str = r#"(() => Array.from(document.querySelectorAll('a[href]'))
    .map(a => a.getAttribute('href'))
    .filter(h => typeof h === 'string'))()"#;

/// Collects visible clickable elements; `__INCLUDE__` and `__EXCLUDE__` are
/// replaced with JSON arrays of selectors.
const CLICKABLES_SCRIPT: &str = r#"(() => {
    const include = __INCLUDE__;
    const exclude = __EXCLUDE__;
    const base = 'a[href], button, [role=button], input[type=button], input[type=submit], [onclick]';
    const matches = (el, sel) => { try { return el.matches(sel); } catch (_) { return false; } };
    const inside = (el, sel) => { try { return el.closest(sel) !== null; } catch (_) { return false; } };
    const cssPath = (el) => {
        const parts = [];
        while (el && el.nodeType === 1 && el !== document.documentElement) {
            if (el.id) { parts.unshift('#' + CSS.escape(el.id)); break; }
            let idx = 1, sib = el;
            while ((sib = sib.previousElementSibling)) { if (sib.tagName === el.tagName) idx++; }
            parts.unshift(el.tagName.toLowerCase() + ':nth-of-type(' + idx + ')');
            el = el.parentElement;
        }
        return parts.join(' > ');
    };
    const visible = (el) => {
        const r = el.getBoundingClientRect();
        const s = getComputedStyle(el);
        return r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
    };
    const kindOf = (el) => {
        const tag = el.tagName.toLowerCase();
        if (tag === 'a') return 'link';
        if (tag === 'button' || tag === 'input' || el.getAttribute('role') === 'button') return 'button';
        return 'other';
    };
    return Array.from(document.querySelectorAll(base))
        .filter(el => include.length === 0 || include.some(sel => matches(el, sel)))
        .filter(el => !exclude.some(sel => inside(el, sel)))
        .filter(visible)
        .map(el => ({
            tag: el.tagName.toLowerCase(),
            selector: cssPath(el),
            text: (el.innerText || el.value || el.getAttribute('aria-label') || '')
                .replace(/\s+/g, ' ').trim().slice(0, 120),
            kind: kindOf(el),
            href: el.tagName.toLowerCase() === 'a' ? el.getAttribute('href') : null,
        }));
})()"#;

/// Launches Chrome processes configured from [`Config`].
pub struct ChromeLauncher {
    config: Arc<Config>,
}

impl ChromeLauncher {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, id: usize, kind: BrowserKind) -> Result<Arc<dyn Browser>, CaptureError> {
        let profile_dir = format!("/tmp/page-capture-profile-{}-{}", std::process::id(), id);
        let temp_dir = format!("/tmp/page-capture-temp-{}-{}", std::process::id(), id);
        for dir in [&profile_dir, &temp_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                CaptureError::BrowserLaunchFailed(format!("Failed to create {dir}: {e}"))
            })?;
        }

        let browser_config = create_browser_config(&self.config, id, kind)?;
        let (browser, mut handler) = chromiumoxide::Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(e.to_string()))?;

        // The handler is a stream that must be polled for the connection to make progress.
        let handler_task = tokio::spawn(async move {
            loop {
                match handler.next().await {
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        error!("Browser {} handler error: {}", id, e);
                        break;
                    }
                    None => {
                        debug!("Browser {} handler stream ended", id);
                        break;
                    }
                }
            }
        });

        info!("Launched {} browser instance {}", kind, id);
        Ok(Arc::new(ChromeBrowser {
            id,
            browser: Mutex::new(browser),
            handler: handler_task,
            dirs: vec![profile_dir, temp_dir],
        }))
    }
}

pub struct ChromeBrowser {
    id: usize,
    browser: Mutex<chromiumoxide::Browser>,
    handler: JoinHandle<()>,
    dirs: Vec<String>,
}

#[async_trait]
impl Browser for ChromeBrowser {
    async fn new_page(&self, viewport: &Viewport) -> Result<Box<dyn PageHandle>, CaptureError> {
        let page = self
            .browser
            .lock()
            .await
            .new_page("about:blank")
            .await
            .map_err(|e| CaptureError::BrowserLaunchFailed(format!("Failed to open page: {e}")))?;

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(viewport.device_scale_factor)
            .mobile(viewport.mobile)
            .build()
            .map_err(CaptureError::CaptureFailure)?;
        page.execute(metrics)
            .await
            .map_err(|e| CaptureError::CaptureFailure(format!("Failed to set viewport: {e}")))?;

        if viewport.mobile {
            page.execute(SetTouchEmulationEnabledParams::new(true))
                .await
                .map_err(|e| CaptureError::CaptureFailure(format!("Failed to enable touch: {e}")))?;
        }

        Ok(Box::new(ChromePage { page }))
    }

    async fn close(&self) -> Result<(), CaptureError> {
        let result = self.browser.lock().await.close().await;
        self.handler.abort();
        for dir in &self.dirs {
            let _ = tokio::fs::remove_dir_all(dir).await;
        }
        debug!("Closed browser instance {}", self.id);

        result
            .map(|_| ())
            .map_err(|e| CaptureError::Io(format!("Failed to close browser {}: {e}", self.id)))
    }

    fn is_alive(&self) -> bool {
        !self.handler.is_finished()
    }
}

pub struct ChromePage {
    page: Page,
}

impl ChromePage {
    async fn eval<T: DeserializeOwned>(&self, script: &str) -> Result<T, CaptureError> {
        let params = EvaluateParams::builder()
            .expression(script)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(|e| CaptureError::interaction("the page", e))?;

        self.page
            .evaluate_expression(params)
            .await
            .map_err(|e| CaptureError::interaction("the page", e.to_string()))?
            .into_value()
            .map_err(|e| CaptureError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl PageHandle for ChromePage {
    async fn navigate(&self, url: &str) -> Result<(), CaptureError> {
        self.page
            .goto(url)
            .await
            .map_err(|e| CaptureError::navigation(url, e.to_string()))?;
        self.page
            .wait_for_navigation()
            .await
            .map_err(|e| CaptureError::navigation(url, e.to_string()))?;
        Ok(())
    }

    async fn title(&self) -> Result<String, CaptureError> {
        self.page
            .get_title()
            .await
            .map_err(|e| CaptureError::CaptureFailure(e.to_string()))?
            .ok_or_else(|| CaptureError::CaptureFailure("page has no title".to_string()))
    }

    async fn current_url(&self) -> Result<String, CaptureError> {
        self.page
            .url()
            .await
            .map_err(|e| CaptureError::CaptureFailure(e.to_string()))?
            .ok_or_else(|| CaptureError::CaptureFailure("page has no url".to_string()))
    }

    async fn screenshot(&self) -> Result<Vec<u8>, CaptureError> {
        let params = ScreenshotParams::builder()
            .format(CaptureScreenshotFormat::Png)
            .full_page(true)
            .build();

        self.page
            .screenshot(params)
            .await
            .map_err(|e| CaptureError::CaptureFailure(e.to_string()))
    }

    async fn extract_links(&self) -> Result<Vec<String>, CaptureError> {
        self.eval(LINKS_SCRIPT).await
    }

    async fn clickable_elements(
        &self,
        query: &ElementQuery,
    ) -> Result<Vec<ClickableElement>, CaptureError> {
        let script = CLICKABLES_SCRIPT
            .replace("__INCLUDE__", &serde_json::to_string(&query.include)?)
            .replace("__EXCLUDE__", &serde_json::to_string(&query.exclude)?);
        self.eval(&script).await
    }

    async fn click(&self, selector: &str) -> Result<(), CaptureError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| CaptureError::interaction(selector, e.to_string()))?;
        element
            .click()
            .await
            .map_err(|e| CaptureError::interaction(selector, e.to_string()))?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), CaptureError> {
        self.page
            .close()
            .await
            .map_err(|e| CaptureError::Io(format!("Failed to close page: {e}")))
    }
}
