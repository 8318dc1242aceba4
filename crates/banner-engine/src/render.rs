use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{BannerError, BannerResult};
use crate::imagegen::solid_png;

const CHROME_CANDIDATES: [&str; 4] = ["google-chrome", "chromium", "chromium-browser", "chrome"];
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// HTML file to PNG screenshot at a fixed viewport.
pub trait Renderer: Send + Sync {
    fn render(&self, html_path: &Path, output_path: &Path, width: u32, height: u32)
        -> BannerResult<()>;
}

/// Headless Chrome/Chromium via its `--screenshot` switch.
#[derive(Debug, Clone)]
pub struct ChromeRenderer {
    binary: Option<PathBuf>,
    timeout: Duration,
}

impl ChromeRenderer {
    pub fn new(binary: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            binary: Some(binary.into()),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// Uses `configured` when given, else the first known browser on `PATH`.
    /// A missing browser surfaces as a render failure, not a build failure.
    pub fn discover(configured: Option<PathBuf>, timeout_secs: u64) -> Self {
        let binary = configured.or_else(find_browser_on_path);
        Self {
            binary,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub fn binary(&self) -> Option<&Path> {
        self.binary.as_deref()
    }

    fn command_args(html_path: &Path, output_path: &Path, width: u32, height: u32) -> Vec<String> {
        vec![
            "--headless=new".to_string(),
            "--disable-gpu".to_string(),
            "--hide-scrollbars".to_string(),
            "--no-sandbox".to_string(),
            format!("--screenshot={}", output_path.display()),
            format!("--window-size={width},{height}"),
            format!("file://{}", html_path.display()),
        ]
    }
}

impl Renderer for ChromeRenderer {
    fn render(
        &self,
        html_path: &Path,
        output_path: &Path,
        width: u32,
        height: u32,
    ) -> BannerResult<()> {
        let Some(binary) = &self.binary else {
            return Err(BannerError::Render(
                "no Chrome/Chromium binary found (set BANNER_CHROME or renderer_binary)".to_string(),
            ));
        };
        let html_path = fs::canonicalize(html_path).map_err(|err| {
            BannerError::Render(format!("html not readable {}: {err}", html_path.display()))
        })?;
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _ = fs::remove_file(output_path);

        let mut child = Command::new(binary)
            .args(Self::command_args(&html_path, output_path, width, height))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                BannerError::Render(format!("failed to start {}: {err}", binary.display()))
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if started.elapsed() >= self.timeout => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(BannerError::Render(format!(
                        "browser timed out after {}s",
                        self.timeout.as_secs()
                    )));
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };
        debug!(event = "render_exit", code = ?status.code(), elapsed_ms = started.elapsed().as_millis() as u64);

        if !status.success() {
            return Err(BannerError::Render(format!("browser exited with {status}")));
        }
        match fs::metadata(output_path) {
            Ok(meta) if meta.len() > 0 => Ok(()),
            _ => Err(BannerError::Render(format!(
                "no screenshot written to {}",
                output_path.display()
            ))),
        }
    }
}

fn find_browser_on_path() -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    for dir in env::split_paths(&paths) {
        for name in CHROME_CANDIDATES {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    None
}

/// Offline renderer: writes a solid placeholder PNG of the viewport size.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunRenderer;

impl Renderer for DryrunRenderer {
    fn render(
        &self,
        html_path: &Path,
        output_path: &Path,
        width: u32,
        height: u32,
    ) -> BannerResult<()> {
        let html = fs::read_to_string(html_path)?;
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output_path, solid_png(&html, width, height)?)?;
        Ok(())
    }
}
