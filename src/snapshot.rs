use anyhow::{anyhow, Context, Result};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::ScreenshotParams;
use futures::StreamExt;
use std::env;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Checked when no explicit browser path is configured.
pub const CHROME_ENV_VAR: &str = "CHROME";

// the screenshot grows past this to fit the whole page
const WINDOW_WIDTH: u32 = 1024;
const WINDOW_HEIGHT: u32 = 768;

/// `ScreenshotCapture` saves a PNG of an HTML export by running a headless Chrome or Chromium.
///
/// Whether a browser is available is decided once by `detect`; callers hold an
/// `Option<ScreenshotCapture>` and skip image export when it is `None`.
#[derive(Debug, Clone)]
pub struct ScreenshotCapture {
    browser: PathBuf,
}

impl ScreenshotCapture {
    /// Looks for a usable browser binary, preferring `explicit`, then the `CHROME`
    /// environment variable, then the usual install locations.
    pub fn detect(explicit: Option<&Path>) -> Option<Self> {
        if let Some(path) = explicit {
            // an explicit path that doesn't exist is not silently replaced by another browser
            return path.exists().then(|| ScreenshotCapture {
                browser: path.to_path_buf(),
            });
        }

        let from_env = env::var_os(CHROME_ENV_VAR).map(PathBuf::from);
        from_env
            .into_iter()
            .chain(default_locations())
            .find(|p| p.exists())
            .map(|browser| {
                debug!(browser = %browser.display(), "found browser for screenshots");
                ScreenshotCapture { browser }
            })
    }

    pub fn browser(&self) -> &Path {
        &self.browser
    }

    /// Renders `html` in the headless browser and writes a full page screenshot to `out`.
    ///
    /// The document is loaded over the DevTools protocol, so its size is not limited by
    /// the command line.
    pub async fn capture(&self, html: &str, out: &Path) -> Result<()> {
        let user_data_dir = scratch_profile_dir();
        let config = BrowserConfig::builder()
            .chrome_executable(&self.browser)
            .window_size(WINDOW_WIDTH, WINDOW_HEIGHT)
            .user_data_dir(&user_data_dir)
            .args(launch_args())
            .build()
            .map_err(|e| anyhow!("Failed to build browser config: {}", e))?;

        let (mut browser, mut handler) = Browser::launch(config)
            .await
            .with_context(|| format!("Failed to launch {}", self.browser.display()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(_event) = handler.next().await {}
        });

        let result = render_to_file(&browser, html, out).await;

        if let Err(e) = browser.close().await {
            warn!("failed to close the browser: {}", e);
        }
        let _ = handler_task.await;
        let _ = tokio::fs::remove_dir_all(&user_data_dir).await;

        result?;
        info!(path = %out.display(), "saved screenshot");
        Ok(())
    }
}

async fn render_to_file(browser: &Browser, html: &str, out: &Path) -> Result<()> {
    let page = browser.new_page("about:blank").await?;
    page.set_content(html).await?;
    page.save_screenshot(screenshot_params(), out)
        .await
        .with_context(|| format!("Failed to save screenshot to {}", out.display()))?;
    Ok(())
}

fn screenshot_params() -> ScreenshotParams {
    ScreenshotParams::builder().full_page(true).build()
}

fn launch_args() -> Vec<&'static str> {
    vec![
        "--no-first-run",
        "--no-default-browser-check",
        "--disable-gpu",
        "--disable-extensions",
        "--disable-dev-shm-usage",
        "--hide-scrollbars",
    ]
}

/// A fresh profile directory so a running browser session is never reused.
fn scratch_profile_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    env::temp_dir().join(format!("tokentint-chrome-{}-{}", std::process::id(), nanos))
}

fn default_locations() -> Vec<PathBuf> {
    let candidates: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
        ]
    } else {
        &[
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/snap/bin/chromium",
        ]
    };
    candidates.iter().map(PathBuf::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_explicit_browser_is_unavailable() {
        let path = Path::new("/definitely/not/a/browser");
        assert!(ScreenshotCapture::detect(Some(path)).is_none());
    }

    #[test]
    fn existing_explicit_browser_is_used() {
        let exe = env::current_exe().unwrap();
        let capture = ScreenshotCapture::detect(Some(exe.as_path())).unwrap();
        assert_eq!(capture.browser(), exe.as_path());
    }

    #[test]
    fn screenshot_covers_the_full_page() {
        assert_eq!(screenshot_params().full_page, Some(true));
    }

    #[test]
    fn launch_args_are_independent_of_the_export() {
        let total: usize = launch_args().iter().map(|a| a.len()).sum();
        assert!(total < 1024);
        assert!(launch_args().iter().all(|a| a.starts_with("--")));
    }

    #[test]
    fn profile_dirs_are_unique_and_temporary() {
        let dir = scratch_profile_dir();
        assert!(dir.starts_with(env::temp_dir()));
        assert!(dir
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("tokentint-chrome-"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn large_export_fails_only_at_launch() {
        let fake = Path::new("/bin/true");
        if !fake.exists() {
            return;
        }
        let capture = ScreenshotCapture {
            browser: fake.to_path_buf(),
        };

        // well past the 128 KiB limit on a single command line argument
        let html = format!("<pre>{}</pre>", "token ".repeat(40_000));
        let out = env::temp_dir().join("tokentint-large-export.png");
        let err = capture.capture(&html, &out).await.unwrap_err();

        let message = format!("{:#}", err);
        assert!(message.contains("Failed to launch"), "{message}");
        assert!(!message.contains("Argument list too long"), "{message}");
    }
}
