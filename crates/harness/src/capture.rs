//! Render capture - embedding a spec in the browser under one backend and
//! extracting a raster screenshot of the output element

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use rendiff_common::{Backend, RasterImage, SpecDocument};
use serde::{Deserialize, Serialize};
use tokio::process::Command as TokioCommand;
use tracing::{debug, info, warn};

use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl Browser {
    fn as_str(&self) -> &'static str {
        match self {
            Browser::Chromium => "chromium",
            Browser::Firefox => "firefox",
            Browser::Webkit => "webkit",
        }
    }
}

impl FromStr for Browser {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chromium" => Ok(Browser::Chromium),
            "firefox" => Ok(Browser::Firefox),
            "webkit" => Ok(Browser::Webkit),
            other => Err(format!("unknown browser: {}", other)),
        }
    }
}

/// Configuration for browser captures
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// node executable used to run the Playwright script
    pub node: PathBuf,

    /// Arguments placed before the script path
    pub node_args: Vec<String>,

    /// Extra module search path (where `playwright` is installed)
    pub node_path: Option<PathBuf>,

    pub browser: Browser,
    pub headless: bool,
    pub viewport_width: u32,
    pub viewport_height: u32,

    /// Global embedding function on the page
    pub embed_function: String,

    /// Container selector passed to the embedding function
    pub container: String,

    /// Bound on waiting for the embed function and output element
    pub ready_timeout_ms: u64,

    /// Extra wait after the render promise resolves
    pub settle_ms: u64,

    /// Hard bound on a whole capture, including browser startup
    pub capture_timeout_ms: u64,

    /// Re-captures attempted after a blank frame (0 = fail fast)
    pub blank_retries: u32,

    pub blank_retry_delay_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            node: PathBuf::from("node"),
            node_args: Vec::new(),
            node_path: None,
            browser: Browser::Chromium,
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            embed_function: "vegaEmbed".to_string(),
            container: "#plot-container".to_string(),
            ready_timeout_ms: 10_000,
            settle_ms: 1_000,
            capture_timeout_ms: 60_000,
            blank_retries: 0,
            blank_retry_delay_ms: 500,
        }
    }
}

/// One render of one spec under one backend
#[derive(Debug, Clone)]
pub struct RenderRequest<'a> {
    pub base_url: &'a str,
    pub spec: &'a SpecDocument,
    pub backend: Backend,
    /// Element to screenshot
    pub selector: &'static str,
}

/// What the browser handed back for a render
#[derive(Debug, Clone, Default)]
pub struct PageCapture {
    /// PNG screenshot of the output element
    pub png: Vec<u8>,

    /// Uncaught page errors raised while rendering, in arrival order
    pub page_errors: Vec<String>,
}

/// Browser automation seam
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn render(&self, request: &RenderRequest<'_>) -> Result<PageCapture, CaptureError>;
}

/// Drives Playwright through a generated node script, one fresh page per
/// render
#[derive(Debug, Clone)]
pub struct PlaywrightDriver {
    config: CaptureConfig,
}

#[derive(Debug, Deserialize)]
struct ScriptOutcome {
    ok: bool,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

impl PlaywrightDriver {
    pub fn new(config: CaptureConfig) -> Self {
        Self { config }
    }

    /// Build the Playwright script for a render writing its screenshot to
    /// `screenshot_path`
    pub fn build_script(
        &self,
        request: &RenderRequest<'_>,
        screenshot_path: &Path,
    ) -> Result<String, serde_json::Error> {
        let options = serde_json::json!({
            "renderer": request.backend.as_str(),
            "actions": false,
        });

        Ok(format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');

const describe = (e) => String(e && e.message ? e.message : e);

(async () => {{
  const errors = [];
  const browser = await {browser}.launch({{ headless: {headless} }});
  try {{
    const page = await browser.newPage({{
      viewport: {{ width: {width}, height: {height} }}
    }});
    page.on('pageerror', (e) => errors.push(describe(e)));

    await page.goto({base_url});
    await page.waitForFunction(
      (fn) => typeof window[fn] === 'function',
      {embed_fn},
      {{ timeout: {ready_timeout} }}
    );

    try {{
      await page.evaluate(
        async ([fn, container, spec, opts]) => {{ await window[fn](container, spec, opts); }},
        [{embed_fn}, {container}, {spec}, {options}]
      );
    }} catch (e) {{
      errors.push(describe(e));
    }}

    const output = page.locator({selector}).first();
    await output.waitFor({{ state: 'visible', timeout: {ready_timeout} }});
    await page.waitForTimeout({settle});
    await output.screenshot({{ path: {screenshot} }});

    console.log(JSON.stringify({{ ok: true, errors }}));
  }} catch (error) {{
    console.log(JSON.stringify({{ ok: false, errors, error: describe(error) }}));
    process.exitCode = 1;
  }} finally {{
    await browser.close();
  }}
}})();
"#,
            browser = self.config.browser.as_str(),
            headless = self.config.headless,
            width = self.config.viewport_width,
            height = self.config.viewport_height,
            base_url = serde_json::to_string(request.base_url)?,
            embed_fn = serde_json::to_string(&self.config.embed_function)?,
            container = serde_json::to_string(&self.config.container)?,
            spec = serde_json::to_string(request.spec)?,
            options = options,
            selector = serde_json::to_string(request.selector)?,
            ready_timeout = self.config.ready_timeout_ms,
            settle = self.config.settle_ms,
            screenshot = serde_json::to_string(&screenshot_path.to_string_lossy())?,
        ))
    }
}

#[async_trait]
impl PageDriver for PlaywrightDriver {
    async fn render(&self, request: &RenderRequest<'_>) -> Result<PageCapture, CaptureError> {
        let backend = request.backend;
        let driver_err = |reason: String| CaptureError::Driver { backend, reason };

        let temp_dir = tempfile::tempdir().map_err(|e| driver_err(e.to_string()))?;
        let script_path = temp_dir.path().join("capture.js");
        let screenshot_path = temp_dir.path().join("capture.png");

        let script = self
            .build_script(request, &screenshot_path)
            .map_err(|e| driver_err(e.to_string()))?;
        std::fs::write(&script_path, script).map_err(|e| driver_err(e.to_string()))?;

        debug!("Running Playwright capture script: {}", script_path.display());

        let mut cmd = TokioCommand::new(&self.config.node);
        cmd.args(&self.config.node_args)
            .arg(&script_path)
            .current_dir(temp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(node_path) = &self.config.node_path {
            cmd.env("NODE_PATH", node_path);
        }

        let child = cmd.spawn().map_err(|e| {
            driver_err(format!(
                "failed to run {}: {}",
                self.config.node.display(),
                e
            ))
        })?;
        // Outlives the wait below, so a timed out capture takes the
        // browser down with node
        let mut group = ProcessGroupGuard::new(child.id());

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| driver_err(e.to_string()))?;
        if output.status.success() {
            group.disarm();
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let outcome = stdout
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<ScriptOutcome>(line.trim()).ok());

        let Some(outcome) = outcome else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(driver_err(format!(
                "script exited with {} without a result:\nstdout: {}\nstderr: {}",
                output.status, stdout, stderr
            )));
        };

        // Page errors win over the navigation/locator failure they usually cause
        if !outcome.ok && outcome.errors.is_empty() {
            return Err(driver_err(
                outcome.error.unwrap_or_else(|| "unknown failure".to_string()),
            ));
        }

        let png = if outcome.ok {
            std::fs::read(&screenshot_path).map_err(|e| driver_err(e.to_string()))?
        } else {
            Vec::new()
        };

        Ok(PageCapture {
            png,
            page_errors: outcome.errors,
        })
    }
}

/// SIGKILLs a capture's process group (node and the browser it launched)
/// on drop unless disarmed
struct ProcessGroupGuard {
    group: Option<Pid>,
}

impl ProcessGroupGuard {
    fn new(leader: Option<u32>) -> Self {
        Self {
            group: leader.map(|pid| Pid::from_raw(pid as i32)),
        }
    }

    /// Node exited cleanly, so `browser.close()` already ran
    fn disarm(&mut self) {
        self.group = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(group) = self.group.take() {
            debug!("Killing capture process group {}", group);
            let _ = killpg(group, Signal::SIGKILL);
        }
    }
}

/// Captures rasters through a [`PageDriver`], rejecting script errors and
/// blank frames
pub struct RenderCapture<D> {
    driver: D,
    capture_timeout: Duration,
    blank_retries: u32,
    blank_retry_delay: Duration,
}

impl<D: PageDriver> RenderCapture<D> {
    pub fn new(driver: D, config: &CaptureConfig) -> Self {
        Self {
            driver,
            capture_timeout: Duration::from_millis(config.capture_timeout_ms),
            blank_retries: config.blank_retries,
            blank_retry_delay: Duration::from_millis(config.blank_retry_delay_ms),
        }
    }

    /// Render `spec` with `backend` and return the output element's pixels
    pub async fn capture(
        &self,
        base_url: &str,
        spec: &SpecDocument,
        backend: Backend,
    ) -> Result<RasterImage, CaptureError> {
        let mut retries = 0;
        loop {
            match self.capture_once(base_url, spec, backend).await {
                Err(CaptureError::Blank { .. }) if retries < self.blank_retries => {
                    retries += 1;
                    warn!(
                        "{}: blank output, re-capturing ({}/{})",
                        backend, retries, self.blank_retries
                    );
                    tokio::time::sleep(self.blank_retry_delay).await;
                }
                other => return other,
            }
        }
    }

    async fn capture_once(
        &self,
        base_url: &str,
        spec: &SpecDocument,
        backend: Backend,
    ) -> Result<RasterImage, CaptureError> {
        let request = RenderRequest {
            base_url,
            spec,
            backend,
            selector: backend.output_selector(),
        };

        let page = tokio::time::timeout(self.capture_timeout, self.driver.render(&request))
            .await
            .map_err(|_| CaptureError::Timeout {
                backend,
                after: self.capture_timeout,
            })??;

        if !page.page_errors.is_empty() {
            return Err(CaptureError::Script {
                backend,
                messages: page.page_errors,
            });
        }

        let image = RasterImage::from_png(&page.png)
            .map_err(|source| CaptureError::Decode { backend, source })?;

        if image.is_blank() {
            return Err(CaptureError::Blank { backend });
        }

        info!(
            "Captured {} output: {}x{}",
            backend,
            image.width(),
            image.height()
        );
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rendiff_common::raster::OPAQUE_WHITE;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    /// Serves a scripted sequence of page captures, repeating the last one
    struct ScriptedDriver {
        pages: Vec<PageCapture>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedDriver {
        fn new(pages: Vec<PageCapture>) -> Self {
            Self {
                pages,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl PageDriver for ScriptedDriver {
        async fn render(&self, _request: &RenderRequest<'_>) -> Result<PageCapture, CaptureError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(self.pages[n.min(self.pages.len() - 1)].clone())
        }
    }

    fn page(image: &RasterImage) -> PageCapture {
        PageCapture {
            png: image.to_png().unwrap(),
            page_errors: Vec::new(),
        }
    }

    fn drawn() -> RasterImage {
        RasterImage::from_fn(20, 20, |x, _| if x < 10 { [0, 0, 255, 255] } else { OPAQUE_WHITE })
    }

    fn spec() -> SpecDocument {
        SpecDocument::new(serde_json::json!({"marks": []}))
    }

    #[tokio::test]
    async fn test_capture_returns_decoded_image() {
        let capture = RenderCapture::new(
            ScriptedDriver::new(vec![page(&drawn())]),
            &CaptureConfig::default(),
        );
        let image = capture
            .capture("http://localhost:1/", &spec(), Backend::Avenger)
            .await
            .unwrap();
        assert_eq!(image, drawn());
    }

    #[tokio::test]
    async fn test_blank_output_is_capture_error() {
        let blank = RasterImage::filled(20, 20, OPAQUE_WHITE);
        let capture = RenderCapture::new(
            ScriptedDriver::new(vec![page(&blank)]),
            &CaptureConfig::default(),
        );
        let err = capture
            .capture("http://localhost:1/", &spec(), Backend::Svg)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Blank { backend: Backend::Svg }));
        assert_eq!(err.to_string(), "svg: blank output");
    }

    #[tokio::test]
    async fn test_blank_retry_is_opt_in() {
        let blank = RasterImage::filled(20, 20, OPAQUE_WHITE);
        let config = CaptureConfig {
            blank_retries: 1,
            blank_retry_delay_ms: 0,
            ..Default::default()
        };
        let driver = ScriptedDriver::new(vec![page(&blank), page(&drawn())]);
        let capture = RenderCapture::new(driver, &config);
        let image = capture
            .capture("http://localhost:1/", &spec(), Backend::Canvas)
            .await
            .unwrap();
        assert_eq!(image, drawn());
        assert_eq!(capture.driver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_page_errors_fail_capture() {
        let driver = ScriptedDriver::new(vec![PageCapture {
            png: drawn().to_png().unwrap(),
            page_errors: vec!["TypeError: x is undefined".to_string()],
        }]);
        let capture = RenderCapture::new(driver, &CaptureConfig::default());
        let err = capture
            .capture("http://localhost:1/", &spec(), Backend::Avenger)
            .await
            .unwrap_err();
        match err {
            CaptureError::Script { backend, messages } => {
                assert_eq!(backend, Backend::Avenger);
                assert_eq!(messages, ["TypeError: x is undefined"]);
            }
            other => panic!("expected script error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hung_render_times_out() {
        let mut driver = ScriptedDriver::new(vec![page(&drawn())]);
        driver.delay = Duration::from_secs(30);
        let config = CaptureConfig {
            capture_timeout_ms: 50,
            ..Default::default()
        };
        let capture = RenderCapture::new(driver, &config);
        let err = capture
            .capture("http://localhost:1/", &spec(), Backend::Svg)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Timeout { backend: Backend::Svg, .. }));
    }

    #[tokio::test]
    async fn test_undecodable_screenshot() {
        let driver = ScriptedDriver::new(vec![PageCapture {
            png: b"truncated".to_vec(),
            page_errors: Vec::new(),
        }]);
        let capture = RenderCapture::new(driver, &CaptureConfig::default());
        let err = capture
            .capture("http://localhost:1/", &spec(), Backend::Canvas)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Decode { .. }));
    }

    #[test]
    fn test_script_embeds_backend_and_selector() {
        let driver = PlaywrightDriver::new(CaptureConfig::default());
        let spec = SpecDocument::new(serde_json::json!({"title": "it's \"quoted\""}));
        let request = RenderRequest {
            base_url: "http://localhost:4000/",
            spec: &spec,
            backend: Backend::Svg,
            selector: Backend::Svg.output_selector(),
        };
        let script = driver
            .build_script(&request, Path::new("/tmp/out.png"))
            .unwrap();

        assert!(script.contains(r#""renderer":"svg""#));
        assert!(script.contains(r#""actions":false"#));
        assert!(script.contains(r#"page.locator("svg")"#));
        assert!(script.contains(r#"page.goto("http://localhost:4000/")"#));
        assert!(script.contains(r##""#plot-container""##));
        assert!(script.contains(r#"{"title":"it's \"quoted\""}"#));
        assert!(script.contains("chromium.launch({ headless: true })"));
    }

    #[test_case("chromium", Some(Browser::Chromium))]
    #[test_case("firefox", Some(Browser::Firefox))]
    #[test_case("webkit", Some(Browser::Webkit))]
    #[test_case("opera", None)]
    fn test_browser_from_str(name: &str, expected: Option<Browser>) {
        assert_eq!(name.parse::<Browser>().ok(), expected);
    }

    /// `PlaywrightDriver` against a shell standing in for node
    #[cfg(unix)]
    mod node_process {
        use super::*;
        use crate::testing::wait_until_gone;

        fn sh_node(body: &str) -> CaptureConfig {
            CaptureConfig {
                node: PathBuf::from("sh"),
                node_args: vec!["-c".to_string(), body.to_string(), "node".to_string()],
                ..CaptureConfig::default()
            }
        }

        async fn render(body: &str) -> Result<PageCapture, CaptureError> {
            let spec = spec();
            let request = RenderRequest {
                base_url: "http://localhost:1/",
                spec: &spec,
                backend: Backend::Avenger,
                selector: "canvas",
            };
            PlaywrightDriver::new(sh_node(body)).render(&request).await
        }

        #[tokio::test]
        async fn test_result_line_follows_noise() {
            let dir = tempfile::tempdir().unwrap();
            let png = dir.path().join("drawn.png");
            drawn().save_png(&png).unwrap();

            let body = format!(
                r#"echo 'Downloading chromium...'; echo '{{"partial"'; cp '{}' capture.png; echo '{{"ok":true,"errors":[]}}'"#,
                png.display()
            );
            let page = render(&body).await.unwrap();
            assert!(page.page_errors.is_empty());
            assert_eq!(page.png, std::fs::read(&png).unwrap());

            let capture = RenderCapture::new(PlaywrightDriver::new(sh_node(&body)), &sh_node(&body));
            let image = capture
                .capture("http://localhost:1/", &spec(), Backend::Avenger)
                .await
                .unwrap();
            assert_eq!(image, drawn());
        }

        #[tokio::test]
        async fn test_page_errors_become_script_error() {
            let body = r#"echo '{"ok":false,"errors":["TypeError: mark is undefined"],"error":"locator timed out"}'; exit 1"#;
            let page = render(body).await.unwrap();
            assert!(page.png.is_empty());
            assert_eq!(page.page_errors, ["TypeError: mark is undefined"]);

            let config = sh_node(body);
            let capture = RenderCapture::new(PlaywrightDriver::new(config.clone()), &config);
            let err = capture
                .capture("http://localhost:1/", &spec(), Backend::Avenger)
                .await
                .unwrap_err();
            match err {
                CaptureError::Script { backend, messages } => {
                    assert_eq!(backend, Backend::Avenger);
                    assert_eq!(messages, ["TypeError: mark is undefined"]);
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_failure_without_page_errors_is_driver_error() {
            let body = r#"echo '{"ok":false,"errors":[],"error":"net::ERR_CONNECTION_REFUSED"}'; exit 1"#;
            match render(body).await.unwrap_err() {
                CaptureError::Driver { reason, .. } => {
                    assert_eq!(reason, "net::ERR_CONNECTION_REFUSED");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_missing_result_line_is_driver_error() {
            let body = "echo 'not json'; echo \"Cannot find module 'playwright'\" >&2; exit 1";
            match render(body).await.unwrap_err() {
                CaptureError::Driver { reason, .. } => {
                    assert!(reason.contains("without a result"), "{reason}");
                    assert!(reason.contains("Cannot find module"), "{reason}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_missing_screenshot_is_driver_error() {
            let body = r#"echo '{"ok":true,"errors":[]}'"#;
            let err = render(body).await.unwrap_err();
            assert!(matches!(err, CaptureError::Driver { .. }), "{err}");
        }

        #[tokio::test]
        async fn test_missing_node_is_driver_error() {
            let config = CaptureConfig {
                node: PathBuf::from("/nonexistent/bin/node"),
                ..CaptureConfig::default()
            };
            let spec = spec();
            let request = RenderRequest {
                base_url: "http://localhost:1/",
                spec: &spec,
                backend: Backend::Svg,
                selector: "svg",
            };
            match PlaywrightDriver::new(config).render(&request).await.unwrap_err() {
                CaptureError::Driver { backend, reason } => {
                    assert_eq!(backend, Backend::Svg);
                    assert!(reason.starts_with("failed to run"), "{reason}");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn test_timeout_kills_launched_browser() {
            let dir = tempfile::tempdir().unwrap();
            let pid_file = dir.path().join("browser.pid");

            // Stands in for node launching a long-lived browser process
            let body = format!(
                "sleep 300 & echo $! > '{}'; wait",
                pid_file.display()
            );
            let config = CaptureConfig {
                capture_timeout_ms: 500,
                ..sh_node(&body)
            };
            let capture = RenderCapture::new(PlaywrightDriver::new(config.clone()), &config);

            let err = capture
                .capture("http://localhost:1/", &spec(), Backend::Canvas)
                .await
                .unwrap_err();
            assert!(matches!(err, CaptureError::Timeout { backend: Backend::Canvas, .. }));

            let pid: i32 = std::fs::read_to_string(&pid_file)
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            assert!(
                wait_until_gone(pid, Duration::from_secs(5)),
                "browser process {pid} survived the capture timeout"
            );
        }
    }
}
