/// Scripted in-memory renderer used to drive the pool, traversal, service and
/// HTTP layers without a real browser.
pub(crate) mod fake {
    use crate::renderer::{
        Browser, BrowserLauncher, ClickableElement, ElementKind, ElementQuery, PageHandle,
    };
    use crate::packaging::ArchiveBuilder;
    use crate::service::CaptureService;
    use crate::session::SessionRecord;
    use crate::store::{DurableStore, SessionStore};
    use crate::{utils, BrowserKind, BrowserPool, CaptureError, Config, Metrics, Viewport};
    use async_trait::async_trait;
    use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Navigation {
        Loads,
        /// Every attempt fails with a DNS error
        Unreachable,
        /// First attempt fails with a non-retryable error
        Broken,
    }

    #[derive(Debug, Clone)]
    enum Shot {
        Png,
        Empty,
        Raw(Vec<u8>),
        Hang,
    }

    #[derive(Debug, Clone)]
    struct ScriptedElement {
        element: ClickableElement,
        /// Where clicking it navigates, relative to the current page
        target: Option<String>,
        broken: bool,
    }

    /// Behaviour of one URL on the fake site.
    #[derive(Debug, Clone)]
    pub struct PageScript {
        title: String,
        links: Vec<String>,
        elements: Vec<ScriptedElement>,
        navigation: Navigation,
        flaky: usize,
        redirect: Option<String>,
        shot: Shot,
    }

    impl PageScript {
        pub fn titled(title: &str) -> Self {
            Self {
                title: title.to_string(),
                links: Vec::new(),
                elements: Vec::new(),
                navigation: Navigation::Loads,
                flaky: 0,
                redirect: None,
                shot: Shot::Png,
            }
        }

        pub fn unreachable() -> Self {
            Self {
                navigation: Navigation::Unreachable,
                ..Self::titled("")
            }
        }

        pub fn broken() -> Self {
            Self {
                navigation: Navigation::Broken,
                ..Self::titled("")
            }
        }

        /// The first `failures` navigations fail with a connection reset.
        pub fn flaky(mut self, failures: usize) -> Self {
            self.flaky = failures;
            self
        }

        pub fn empty_screenshot(mut self) -> Self {
            self.shot = Shot::Empty;
            self
        }

        pub fn raw_screenshot(mut self, bytes: Vec<u8>) -> Self {
            self.shot = Shot::Raw(bytes);
            self
        }

        pub fn hang_screenshot(mut self) -> Self {
            self.shot = Shot::Hang;
            self
        }

        pub fn redirect_to(mut self, url: &str) -> Self {
            self.redirect = Some(url.to_string());
            self
        }

        pub fn links(mut self, hrefs: &[&str]) -> Self {
            self.links.extend(hrefs.iter().map(|h| h.to_string()));
            self
        }

        /// An anchor that is both a link and a clickable element.
        pub fn link_to(mut self, text: &str, href: &str) -> Self {
            self.links.push(href.to_string());
            self.elements.push(ScriptedElement {
                element: element("a", ElementKind::Link, text, Some(href)),
                target: Some(href.to_string()),
                broken: false,
            });
            self
        }

        pub fn button(mut self, text: &str) -> Self {
            self.elements.push(ScriptedElement {
                element: element("button", ElementKind::Button, text, None),
                target: None,
                broken: false,
            });
            self
        }

        pub fn buttons(self, count: usize) -> Self {
            (0..count).fold(self, |script, i| script.button(&format!("Action {i}")))
        }

        pub fn broken_button(mut self, text: &str) -> Self {
            self.elements.push(ScriptedElement {
                element: element("button", ElementKind::Button, text, None),
                target: None,
                broken: true,
            });
            self
        }
    }

    fn element(tag: &str, kind: ElementKind, text: &str, href: Option<&str>) -> ClickableElement {
        ClickableElement {
            tag: tag.to_string(),
            selector: format!("{}#{}", tag, text.to_lowercase().replace(' ', "-")),
            text: text.to_string(),
            kind,
            href: href.map(str::to_string),
        }
    }

    fn key(url: &str) -> String {
        Url::parse(url)
            .map(|u| utils::visit_key(&u))
            .unwrap_or_else(|_| url.to_string())
    }

    pub fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_pixel(width, height, Rgba([40, 90, 200, 255]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    #[derive(Default)]
    struct SiteState {
        pages: Mutex<HashMap<String, PageScript>>,
        navigations: Mutex<HashMap<String, usize>>,
        clicks: Mutex<Vec<String>>,
        pages_opened: AtomicUsize,
        pages_closed: AtomicUsize,
    }

    /// A set of scripted pages shared by every fake page and browser.
    #[derive(Clone, Default)]
    pub struct FakeSite {
        state: Arc<SiteState>,
    }

    impl FakeSite {
        pub fn page(self, url: &str, script: PageScript) -> Self {
            self.state.pages.lock().insert(key(url), script);
            self
        }

        /// Unscripted URLs load as a plain "Not Found" page.
        fn script(&self, url: &str) -> PageScript {
            self.state
                .pages
                .lock()
                .get(&key(url))
                .cloned()
                .unwrap_or_else(|| PageScript::titled("Not Found"))
        }

        pub fn navigations(&self, url: &str) -> usize {
            self.state
                .navigations
                .lock()
                .get(&key(url))
                .copied()
                .unwrap_or(0)
        }

        pub fn total_navigations(&self) -> usize {
            self.state.navigations.lock().values().sum()
        }

        /// Selectors clicked so far, in order.
        pub fn clicks(&self) -> Vec<String> {
            self.state.clicks.lock().clone()
        }

        /// Pages opened through a browser and not closed yet.
        pub fn open_pages(&self) -> usize {
            self.state
                .pages_opened
                .load(Ordering::SeqCst)
                .saturating_sub(self.state.pages_closed.load(Ordering::SeqCst))
        }
    }

    pub struct FakePage {
        site: FakeSite,
        current: Mutex<Option<String>>,
    }

    impl FakePage {
        pub fn new(site: FakeSite) -> Self {
            Self {
                site,
                current: Mutex::new(None),
            }
        }

        fn current_script(&self) -> Option<PageScript> {
            let current = self.current.lock().clone()?;
            Some(self.site.script(&current))
        }
    }

    #[async_trait]
    impl PageHandle for FakePage {
        async fn navigate(&self, url: &str) -> Result<(), CaptureError> {
            let attempt = {
                let mut navigations = self.site.state.navigations.lock();
                let count = navigations.entry(key(url)).or_insert(0);
                *count += 1;
                *count
            };

            let script = self.site.script(url);
            match script.navigation {
                Navigation::Unreachable => {
                    return Err(CaptureError::navigation(url, "net::ERR_NAME_NOT_RESOLVED"))
                }
                Navigation::Broken => return Err(CaptureError::navigation(url, "net::ERR_ABORTED")),
                Navigation::Loads if attempt <= script.flaky => {
                    return Err(CaptureError::navigation(url, "net::ERR_CONNECTION_RESET"))
                }
                Navigation::Loads => {}
            }

            let landed = script.redirect.unwrap_or_else(|| url.to_string());
            *self.current.lock() = Some(landed);
            Ok(())
        }

        async fn title(&self) -> Result<String, CaptureError> {
            self.current_script()
                .map(|s| s.title)
                .ok_or_else(|| CaptureError::CaptureFailure("no page loaded".into()))
        }

        async fn current_url(&self) -> Result<String, CaptureError> {
            Ok(self
                .current
                .lock()
                .clone()
                .unwrap_or_else(|| "about:blank".to_string()))
        }

        async fn screenshot(&self) -> Result<Vec<u8>, CaptureError> {
            let script = self
                .current_script()
                .ok_or_else(|| CaptureError::CaptureFailure("no page loaded".into()))?;
            match script.shot {
                Shot::Png => Ok(png(64, 48)),
                Shot::Empty => Ok(Vec::new()),
                Shot::Raw(bytes) => Ok(bytes),
                Shot::Hang => futures::future::pending().await,
            }
        }

        async fn extract_links(&self) -> Result<Vec<String>, CaptureError> {
            Ok(self.current_script().map(|s| s.links).unwrap_or_default())
        }

        async fn clickable_elements(
            &self,
            query: &ElementQuery,
        ) -> Result<Vec<ClickableElement>, CaptureError> {
            let elements = self
                .current_script()
                .map(|s| s.elements)
                .unwrap_or_default();
            Ok(elements
                .into_iter()
                .map(|scripted| scripted.element)
                .filter(|el| !query.exclude.contains(&el.selector))
                .filter(|el| query.include.is_empty() || query.include.contains(&el.selector))
                .collect())
        }

        async fn click(&self, selector: &str) -> Result<(), CaptureError> {
            self.site.state.clicks.lock().push(selector.to_string());

            let script = self
                .current_script()
                .ok_or_else(|| CaptureError::interaction(selector, "no page loaded"))?;
            let scripted = script
                .elements
                .into_iter()
                .find(|s| s.element.selector == selector)
                .ok_or_else(|| CaptureError::interaction(selector, "no element matches"))?;

            if scripted.broken {
                return Err(CaptureError::interaction(
                    selector,
                    "Node is detached from document",
                ));
            }
            if let Some(target) = scripted.target {
                let mut current = self.current.lock();
                let base = current.as_deref().and_then(|c| Url::parse(c).ok());
                let next = match base {
                    Some(base) => base
                        .join(&target)
                        .map(|u| u.to_string())
                        .unwrap_or(target),
                    None => target,
                };
                *current = Some(next);
            }
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<(), CaptureError> {
            self.site.state.pages_closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct LauncherState {
        launched: AtomicUsize,
        live: AtomicUsize,
        max_live: AtomicUsize,
        closed: Mutex<Vec<usize>>,
        fail_next_launch: AtomicBool,
        fail_closes: AtomicBool,
        launch_delay: Mutex<Duration>,
    }

    pub struct FakeBrowser {
        id: usize,
        site: FakeSite,
        alive: AtomicBool,
        state: Arc<LauncherState>,
    }

    #[async_trait]
    impl Browser for FakeBrowser {
        async fn new_page(&self, _viewport: &Viewport) -> Result<Box<dyn PageHandle>, CaptureError> {
            self.site.state.pages_opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakePage::new(self.site.clone())))
        }

        async fn close(&self) -> Result<(), CaptureError> {
            if self.alive.swap(false, Ordering::SeqCst) {
                self.state.live.fetch_sub(1, Ordering::SeqCst);
            }
            self.state.closed.lock().push(self.id);
            if self.state.fail_closes.load(Ordering::SeqCst) {
                return Err(CaptureError::Io(format!("browser {} refused to exit", self.id)));
            }
            Ok(())
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
    }

    pub struct FakeLauncher {
        site: FakeSite,
        state: Arc<LauncherState>,
    }

    impl FakeLauncher {
        pub fn new(site: FakeSite) -> Self {
            Self {
                site,
                state: Arc::new(LauncherState::default()),
            }
        }

        pub fn launched(&self) -> usize {
            self.state.launched.load(Ordering::SeqCst)
        }

        pub fn closed_ids(&self) -> Vec<usize> {
            self.state.closed.lock().clone()
        }

        /// Highest number of simultaneously running browsers seen.
        pub fn max_live(&self) -> usize {
            self.state.max_live.load(Ordering::SeqCst)
        }

        pub fn fail_next_launch(&self) {
            self.state.fail_next_launch.store(true, Ordering::SeqCst);
        }

        pub fn fail_closes(&self) {
            self.state.fail_closes.store(true, Ordering::SeqCst);
        }

        pub fn set_launch_delay(&self, delay: Duration) {
            *self.state.launch_delay.lock() = delay;
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(&self, id: usize, _kind: BrowserKind) -> Result<Arc<dyn Browser>, CaptureError> {
            let delay = *self.state.launch_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.state.fail_next_launch.swap(false, Ordering::SeqCst) {
                return Err(CaptureError::BrowserLaunchFailed(
                    "chrome exited with status 1".into(),
                ));
            }

            self.state.launched.fetch_add(1, Ordering::SeqCst);
            let live = self.state.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.state.max_live.fetch_max(live, Ordering::SeqCst);

            Ok(Arc::new(FakeBrowser {
                id,
                site: self.site.clone(),
                alive: AtomicBool::new(true),
                state: self.state.clone(),
            }))
        }
    }

    /// Durable store kept in a map, so tests never touch the blocking pool.
    #[derive(Default)]
    pub struct MemoryStore {
        records: Mutex<HashMap<String, SessionRecord>>,
    }

    #[async_trait]
    impl DurableStore for MemoryStore {
        async fn put(&self, record: SessionRecord) -> Result<(), CaptureError> {
            self.records.lock().insert(record.id.clone(), record);
            Ok(())
        }

        async fn get(&self, id: &str) -> Result<Option<SessionRecord>, CaptureError> {
            Ok(self.records.lock().get(id).cloned())
        }

        async fn delete(&self, id: &str) -> Result<(), CaptureError> {
            self.records.lock().remove(id);
            Ok(())
        }

        async fn list(&self) -> Result<Vec<SessionRecord>, CaptureError> {
            Ok(self.records.lock().values().cloned().collect())
        }
    }

    /// A service over `site` whose pool waits up to a minute for a free
    /// browser.
    pub fn service_with(site: FakeSite, max_browsers: usize) -> (Arc<CaptureService>, Arc<FakeLauncher>) {
        let (service, launcher) = build_service(site, max_browsers);
        (Arc::new(service), launcher)
    }

    /// Like [`service_with`], packaging through `archiver`.
    pub fn service_with_archiver(
        site: FakeSite,
        max_browsers: usize,
        archiver: Arc<dyn ArchiveBuilder>,
    ) -> (Arc<CaptureService>, Arc<FakeLauncher>) {
        let (service, launcher) = build_service(site, max_browsers);
        (Arc::new(service.with_archive_builder(archiver)), launcher)
    }

    fn build_service(site: FakeSite, max_browsers: usize) -> (CaptureService, Arc<FakeLauncher>) {
        let mut config = Config::default();
        config.pool.max_instances = max_browsers;
        config.pool.acquire_timeout = Duration::from_secs(60);
        let config = Arc::new(config);

        let metrics = Arc::new(Metrics::new());
        let launcher = Arc::new(FakeLauncher::new(site));
        let pool = BrowserPool::new(config.pool.clone(), launcher.clone(), metrics.clone());
        let store = Arc::new(SessionStore::new(
            &config.store,
            Arc::new(MemoryStore::default()),
            metrics.clone(),
        ));

        (CaptureService::new(config, pool, store, metrics), launcher)
    }
}

#[cfg(test)]
mod integration_tests {
    use super::fake::{service_with, FakePage, FakeSite, PageScript};
    use crate::capture::PageCapturer;
    use crate::explorer::InteractiveExplorer;
    use crate::frontier::CaptureJob;
    use crate::link_crawl::LinkCrawl;
    use crate::traversal::{traverse, FrontierStrategy};
    use crate::{
        CaptureAction, CaptureError, CaptureMode, CaptureOptions, CaptureRequest,
        CaptureSettings, Metrics, RequestOptions, SessionStatus,
    };
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use url::Url;

    fn capturer() -> Arc<PageCapturer> {
        Arc::new(PageCapturer::new(
            CaptureSettings::default(),
            Arc::new(Metrics::new()),
        ))
    }

    fn options(mode: CaptureMode) -> CaptureOptions {
        CaptureOptions {
            mode,
            wait_after_load: Duration::ZERO,
            click_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn run(
        strategy: &dyn FrontierStrategy,
        site: &FakeSite,
        options: CaptureOptions,
    ) -> Result<CaptureJob, CaptureError> {
        let page = FakePage::new(site.clone());
        let mut job = CaptureJob::new(
            "job",
            Url::parse("https://a.test/").unwrap(),
            Arc::new(options),
        );
        traverse(strategy, &page, &mut job, &|| {}).await?;
        Ok(job)
    }

    fn assert_orders_are_sequential(job: &CaptureJob) {
        for (i, capture) in job.captures().iter().enumerate() {
            assert_eq!(capture.order, i + 1);
        }
    }

    #[tokio::test]
    async fn test_depth_zero_never_expands_the_frontier() {
        let site = FakeSite::default().page(
            "https://a.test/",
            PageScript::titled("Home").links(&["/1", "/2", "/3", "/4", "/5"]),
        );
        let opts = CaptureOptions {
            max_depth: 0,
            max_pages: 1,
            ..options(CaptureMode::Links)
        };

        let job = run(&LinkCrawl::new(capturer()), &site, opts).await.unwrap();

        assert_eq!(job.captures().len(), 1);
        assert_eq!(job.queued(), 0);
        assert_eq!(site.total_navigations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_failure_records_nothing() {
        let site = FakeSite::default().page("https://a.test/", PageScript::unreachable());

        let err = run(&LinkCrawl::new(capturer()), &site, options(CaptureMode::Links))
            .await
            .err()
            .unwrap();

        assert!(matches!(err, CaptureError::SeedPageFailed(_)));
        assert_eq!(site.navigations("https://a.test/"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interactive_seed_failure_is_fatal_too() {
        let site = FakeSite::default().page("https://a.test/", PageScript::broken());

        let err = run(
            &InteractiveExplorer::new(capturer()),
            &site,
            options(CaptureMode::Interactive),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(err, CaptureError::SeedPageFailed(_)));
    }

    #[tokio::test]
    async fn test_link_crawl_visits_each_url_once() {
        let site = FakeSite::default()
            .page(
                "https://a.test/",
                PageScript::titled("Home").links(&["/b", "/b#top", "/", "https://a.test/c", "mailto:x@a.test"]),
            )
            .page("https://a.test/b", PageScript::titled("B").links(&["/", "/c", "/d"]))
            .page("https://a.test/c", PageScript::titled("C").links(&["/b", "https://other.test/"]))
            .page("https://a.test/d", PageScript::titled("D"));
        let opts = CaptureOptions {
            max_depth: 3,
            max_pages: 20,
            ..options(CaptureMode::Links)
        };

        let job = run(&LinkCrawl::new(capturer()), &site, opts).await.unwrap();

        let urls: Vec<&str> = job.captures().iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://a.test/", "https://a.test/b", "https://a.test/c", "https://a.test/d"]
        );
        for url in &urls {
            assert_eq!(site.navigations(url), 1, "{url}");
        }
        assert_eq!(site.navigations("https://other.test/"), 0);
        assert_orders_are_sequential(&job);
    }

    #[tokio::test]
    async fn test_link_crawl_respects_page_and_depth_caps() {
        let site = FakeSite::default()
            .page(
                "https://a.test/",
                PageScript::titled("Home").links(&["/1", "/2", "/3", "/4", "/5", "/6"]),
            )
            .page("https://a.test/1", PageScript::titled("One").links(&["/deeper"]));

        let capped = CaptureOptions {
            max_depth: 2,
            max_pages: 3,
            ..options(CaptureMode::Links)
        };
        let job = run(&LinkCrawl::new(capturer()), &site, capped).await.unwrap();
        assert_eq!(job.captures().len(), 3);

        let shallow = CaptureOptions {
            max_depth: 1,
            max_pages: 50,
            ..options(CaptureMode::Links)
        };
        let job = run(&LinkCrawl::new(capturer()), &site, shallow).await.unwrap();
        assert_eq!(job.captures().len(), 7);
        assert!(job.captures().iter().all(|c| c.depth <= 1));
        assert_eq!(site.navigations("https://a.test/deeper"), 0);
    }

    #[tokio::test]
    async fn test_redirect_target_is_not_captured_twice() {
        let site = FakeSite::default()
            .page(
                "https://a.test/",
                PageScript::titled("Home").links(&["/old", "/new"]),
            )
            .page(
                "https://a.test/old",
                PageScript::titled("New").redirect_to("https://a.test/new"),
            )
            .page("https://a.test/new", PageScript::titled("New"));

        let job = run(&LinkCrawl::new(capturer()), &site, options(CaptureMode::Links))
            .await
            .unwrap();

        assert_eq!(job.captures().len(), 2);
        assert_eq!(site.navigations("https://a.test/new"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_page_is_recorded_and_crawl_continues() {
        let site = FakeSite::default()
            .page("https://a.test/", PageScript::titled("Home").links(&["/down", "/up"]))
            .page("https://a.test/down", PageScript::unreachable())
            .page("https://a.test/up", PageScript::titled("Up"));

        let job = run(&LinkCrawl::new(capturer()), &site, options(CaptureMode::Links))
            .await
            .unwrap();

        let outcomes: Vec<bool> = job.captures().iter().map(|c| c.success).collect();
        assert_eq!(outcomes, vec![true, false, true]);
        assert_eq!(
            job.captures()[1].error.as_deref(),
            Some("Could not reach https://a.test/down")
        );
    }

    #[tokio::test]
    async fn test_interactive_budget_is_max_elements_plus_seed() {
        let site = FakeSite::default().page("https://a.test/", PageScript::titled("Home").buttons(10));
        let opts = CaptureOptions {
            max_elements: 3,
            ..options(CaptureMode::Interactive)
        };

        let job = run(&InteractiveExplorer::new(capturer()), &site, opts)
            .await
            .unwrap();

        assert_eq!(job.captures().len(), 4);
        assert_eq!(job.captures()[0].action, CaptureAction::InitialLoad);
        assert!(job.captures()[1..]
            .iter()
            .all(|c| c.action == CaptureAction::Click));

        let clicks = site.clicks();
        assert_eq!(clicks.len(), 3);
        assert_eq!(clicks.iter().collect::<HashSet<_>>().len(), 3);
        assert_orders_are_sequential(&job);
    }

    #[tokio::test]
    async fn test_interactive_depth_zero_still_clicks_the_seed() {
        let site = FakeSite::default().page("https://a.test/", PageScript::titled("Home").buttons(5));
        let opts = CaptureOptions {
            max_depth: 0,
            max_elements: 3,
            ..options(CaptureMode::Interactive)
        };

        let job = run(&InteractiveExplorer::new(capturer()), &site, opts)
            .await
            .unwrap();

        assert_eq!(job.captures().len(), 4);
        assert_eq!(site.clicks().len(), 3);
        assert_orders_are_sequential(&job);
    }

    #[tokio::test]
    async fn test_interactive_depth_zero_does_not_explore_reached_pages() {
        let site = FakeSite::default()
            .page(
                "https://a.test/",
                PageScript::titled("Home").link_to("About", "/about").button("Menu"),
            )
            .page("https://a.test/about", PageScript::titled("About").button("Team"));
        let opts = CaptureOptions {
            max_depth: 0,
            max_elements: 10,
            ..options(CaptureMode::Interactive)
        };

        let job = run(&InteractiveExplorer::new(capturer()), &site, opts)
            .await
            .unwrap();

        assert_eq!(site.clicks(), vec!["a#about", "button#menu"]);
        assert_eq!(job.captures().len(), 3);
        assert_eq!(job.queued(), 0);
    }

    #[tokio::test]
    async fn test_interactive_never_clicks_an_element_twice() {
        let site = FakeSite::default()
            .page(
                "https://a.test/",
                PageScript::titled("Home").link_to("About", "/about").button("Menu"),
            )
            .page(
                "https://a.test/about",
                PageScript::titled("About")
                    .link_to("About", "/about")
                    .button("Menu")
                    .button("Team"),
            );
        let opts = CaptureOptions {
            max_depth: 2,
            max_elements: 20,
            ..options(CaptureMode::Interactive)
        };

        let explorer = InteractiveExplorer::new(capturer());
        let job = run(&explorer, &site, opts).await.unwrap();

        let clicks = site.clicks();
        assert_eq!(clicks, vec!["a#about", "button#menu", "button#team"]);

        let triggers: Vec<_> = job
            .captures()
            .iter()
            .filter_map(|c| c.triggering_element.clone())
            .collect();
        assert_eq!(triggers.len(), 3);
        assert_eq!(triggers.iter().collect::<HashSet<_>>().len(), 3);

        // The click on "About" navigated; the seed was reloaded before "Menu".
        assert_eq!(site.navigations("https://a.test/"), 2);
        assert_eq!(job.captures()[1].url, "https://a.test/about");
        assert_eq!(job.captures()[1].depth, 1);
        assert_eq!(job.captures()[2].depth, 0);
    }

    #[tokio::test]
    async fn test_interactive_click_failure_is_isolated() {
        let site = FakeSite::default().page(
            "https://a.test/",
            PageScript::titled("Home").broken_button("Ad").button("Help"),
        );

        let job = run(
            &InteractiveExplorer::new(capturer()),
            &site,
            options(CaptureMode::Interactive),
        )
        .await
        .unwrap();

        let outcomes: Vec<(bool, Option<&str>)> = job
            .captures()
            .iter()
            .map(|c| (c.success, c.triggering_element.as_deref()))
            .collect();
        assert_eq!(
            outcomes,
            vec![
                (true, None),
                (false, Some("button \"Ad\"")),
                (true, Some("button \"Help\"")),
            ]
        );
        assert!(!job.captures()[1].thumbnail.is_empty());
        assert_eq!(
            job.captures()[1].error.as_deref(),
            Some("Could not interact with button \"Ad\"")
        );
    }

    #[tokio::test]
    async fn test_interactive_skips_external_and_script_targets() {
        let site = FakeSite::default().page(
            "https://a.test/",
            PageScript::titled("Home")
                .link_to("Partner", "https://other.test/")
                .link_to("Mail", "mailto:team@a.test")
                .button("Open"),
        );

        let job = run(
            &InteractiveExplorer::new(capturer()),
            &site,
            options(CaptureMode::Interactive),
        )
        .await
        .unwrap();

        assert_eq!(site.clicks(), vec!["button#open"]);
        assert_eq!(job.captures().len(), 2);
        assert_eq!(job.clicked_count(), 1);
    }

    #[tokio::test]
    async fn test_undecodable_screenshot_keeps_success_with_placeholder() {
        let site = FakeSite::default().page(
            "https://a.test/",
            PageScript::titled("Odd").raw_screenshot(vec![0xde, 0xad, 0xbe, 0xef]),
        );

        let job = run(&LinkCrawl::new(capturer()), &site, options(CaptureMode::Links))
            .await
            .unwrap();

        let artifact = &job.captures()[0];
        assert!(artifact.success);
        assert!(!artifact.thumbnail.is_empty());
        assert!(image::load_from_memory(&artifact.thumbnail).is_ok());
    }

    fn quick_request(url: &str) -> CaptureRequest {
        CaptureRequest {
            url: url.to_string(),
            options: Some(RequestOptions {
                wait_after_load: Some(0),
                ..Default::default()
            }),
        }
    }

    #[tokio::test]
    async fn test_single_browser_pool_serves_concurrent_jobs() {
        let site = FakeSite::default()
            .page("https://a.test/", PageScript::titled("A").links(&["/x"]))
            .page("https://b.test/", PageScript::titled("B").links(&["/y"]));
        let (service, launcher) = service_with(site, 1);

        let first = service.submit(quick_request("https://a.test/")).await.unwrap();
        let second = service.submit(quick_request("https://b.test/")).await.unwrap();

        let (a, b) = tokio::join!(
            service.wait(&first.session_id),
            service.wait(&second.session_id)
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.status, SessionStatus::Completed, "{:?}", a.error);
        assert_eq!(b.status, SessionStatus::Completed, "{:?}", b.error);
        assert_eq!(launcher.max_live(), 1);
        assert_eq!(launcher.launched(), 1);
        assert!(service.pool_stats().active <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_navigation_failure_fails_the_session() {
        let site = FakeSite::default().page("https://a.test/", PageScript::unreachable());
        let (service, _) = service_with(site.clone(), 1);

        let session = service.submit(quick_request("https://a.test/")).await.unwrap();
        let done = service.wait(&session.session_id).await.unwrap();

        assert_eq!(done.status, SessionStatus::Failed);
        assert!(done.error.is_some());
        assert!(done.result.is_none());
        assert_eq!(site.navigations("https://a.test/"), 3);
        assert!(done.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_progress_disappears_once_finished() {
        let site = FakeSite::default().page("https://a.test/", PageScript::titled("Home"));
        let (service, _) = service_with(site, 1);

        let session = service.submit(quick_request("https://a.test/")).await.unwrap();
        service.wait(&session.session_id).await.unwrap();

        assert!(service.progress(&session.session_id).is_none());
        assert_eq!(service.running_jobs(), 0);
    }
}
