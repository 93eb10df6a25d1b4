//! # Flamegraph Bridge
//!
//! Turns a written `.pb` artifact into its siblings:
//!
//! ```text
//! cpu-profile-<ts>.pb ──┬──► cpu-profile-<ts>.html   (HtmlRenderer)
//!                       └──► cpu-profile-<ts>.md     (MarkdownFormat)
//! ```
//!
//! Both outputs are produced concurrently. Failures are logged and reported
//! in the [`RenderReport`]; they never reach the caller as errors, so a
//! broken renderer cannot lose the `.pb` that was already written.
//!
//! ## Module Structure
//!
//! - **`stacks`**: pprof profile → weighted root-first stacks
//! - **`html`**: inferno flamegraph page or external command
//! - **`markdown`**: hotspot tables and hottest stacks
//! - **`classification`**: app / std / runtime / deps frame origins

pub mod classification;
pub mod html;
pub mod markdown;
pub mod stacks;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use log::{debug, info, warn};
use proftoggle_common::{ArtifactFormat, MarkdownFormat};

use crate::config::ControllerConfig;
use crate::domain::{Artifact, RenderError};
use crate::export::load_profile;

pub use markdown::{analyze_hotspots, render_markdown, FunctionHotspot};
pub use stacks::ProfileView;

const COMMAND_PREFIX: &str = "command:";

/// How the `.html` sibling is produced.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HtmlRenderer {
    /// inferno SVG embedded in a page
    #[default]
    Builtin,
    /// No HTML output
    None,
    /// External program, `{input}` / `{output}` substituted
    Command(String),
}

impl FromStr for HtmlRenderer {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Some(template) = trimmed.strip_prefix(COMMAND_PREFIX) {
            if template.trim().is_empty() {
                return Err(RenderError::UnknownRenderer(s.to_string()));
            }
            return Ok(HtmlRenderer::Command(template.trim().to_string()));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "" | "builtin" => Ok(HtmlRenderer::Builtin),
            "none" | "off" => Ok(HtmlRenderer::None),
            _ => Err(RenderError::UnknownRenderer(s.to_string())),
        }
    }
}

impl fmt::Display for HtmlRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HtmlRenderer::Builtin => f.write_str("builtin"),
            HtmlRenderer::None => f.write_str("none"),
            HtmlRenderer::Command(template) => write!(f, "{COMMAND_PREFIX}{template}"),
        }
    }
}

/// Outcome of rendering one artifact.
#[derive(Debug)]
pub struct RenderReport {
    pub source: Artifact,
    pub html: Result<Artifact, RenderError>,
    pub markdown: Result<Artifact, RenderError>,
}

impl RenderReport {
    /// Sibling artifacts that were written.
    #[must_use]
    pub fn written(&self) -> Vec<&Artifact> {
        [self.html.as_ref().ok(), self.markdown.as_ref().ok()].into_iter().flatten().collect()
    }
}

#[derive(Debug, Clone)]
pub struct FlamegraphBridge {
    html: HtmlRenderer,
    markdown: MarkdownFormat,
}

impl FlamegraphBridge {
    #[must_use]
    pub fn new(html: HtmlRenderer, markdown: MarkdownFormat) -> Self {
        Self { html, markdown }
    }

    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self::new(config.html.clone(), config.markdown_format)
    }

    /// Render the HTML and markdown siblings of `artifact` concurrently.
    pub async fn render(&self, artifact: &Artifact) -> RenderReport {
        let (html, markdown) = tokio::join!(self.render_html(artifact), self.render_markdown(artifact));

        match &html {
            Ok(out) => {
                info!("Wrote {}", out.path.display());
                println!("{}", file_uri(&out.path));
            }
            Err(RenderError::Disabled) => debug!("HTML rendering disabled for {}", artifact.path.display()),
            Err(e) => warn!("HTML flamegraph for {} failed: {e}", artifact.path.display()),
        }
        match &markdown {
            Ok(out) => info!("Wrote {}", out.path.display()),
            Err(e) => warn!("Markdown summary for {} failed: {e}", artifact.path.display()),
        }

        RenderReport { source: artifact.clone(), html, markdown }
    }

    async fn render_html(&self, artifact: &Artifact) -> Result<Artifact, RenderError> {
        let target = artifact.sibling(ArtifactFormat::Html);
        match &self.html {
            HtmlRenderer::None => Err(RenderError::Disabled),
            HtmlRenderer::Command(template) => {
                html::run_command(template, &artifact.path, &target.path).await?;
                Ok(target)
            }
            HtmlRenderer::Builtin => {
                let input = artifact.path.clone();
                let title = artifact.profile_name();
                let page = tokio::task::spawn_blocking(move || {
                    let view = ProfileView::from_profile(&load_profile(&input)?);
                    html::render_flamegraph_html(&view, &title)
                })
                .await
                .map_err(|e| RenderError::TaskFailed(e.to_string()))??;
                tokio::fs::write(&target.path, page).await?;
                Ok(target)
            }
        }
    }

    async fn render_markdown(&self, artifact: &Artifact) -> Result<Artifact, RenderError> {
        let target = artifact.sibling(ArtifactFormat::Md);
        let input = artifact.path.clone();
        let title = format!("{} profile: {}", artifact.kind, artifact.profile_name());
        let format = self.markdown;
        let text = tokio::task::spawn_blocking(move || {
            let view = ProfileView::from_profile(&load_profile(&input)?);
            Ok::<_, RenderError>(render_markdown(&view, &title, format))
        })
        .await
        .map_err(|e| RenderError::TaskFailed(e.to_string()))??;
        tokio::fs::write(&target.path, text).await?;
        Ok(target)
    }
}

/// `file://` URI for a path, absolute when it can be resolved.
#[must_use]
pub fn file_uri(path: &Path) -> String {
    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| {
        std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    });
    format!("file://{}", absolute.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{encode_profile, ProfileWriter};
    use proftoggle_common::ArtifactKind;

    #[test]
    fn test_html_renderer_parse_and_display() {
        assert_eq!("builtin".parse::<HtmlRenderer>().unwrap(), HtmlRenderer::Builtin);
        assert_eq!("none".parse::<HtmlRenderer>().unwrap(), HtmlRenderer::None);
        let command: HtmlRenderer = "command:pprof -http= {input}".parse().unwrap();
        assert_eq!(command, HtmlRenderer::Command("pprof -http= {input}".to_string()));
        assert_eq!(command.to_string(), "command:pprof -http= {input}");
        assert!("svg".parse::<HtmlRenderer>().is_err());
        assert!("command:".parse::<HtmlRenderer>().is_err());
    }

    fn write_fixture(dir: &Path) -> Artifact {
        let bytes = encode_profile(&stacks::fixtures::cpu_profile());
        ProfileWriter::new(dir).write(ArtifactKind::Cpu, &bytes, "ts").unwrap()
    }

    #[tokio::test]
    async fn test_render_writes_both_siblings() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_fixture(dir.path());
        let bridge = FlamegraphBridge::new(HtmlRenderer::Builtin, MarkdownFormat::Detailed);

        let report = bridge.render(&artifact).await;
        let html = report.html.as_ref().unwrap();
        let md = report.markdown.as_ref().unwrap();
        assert_eq!(html.path, dir.path().join("cpu-profile-ts.html"));
        assert_eq!(md.path, dir.path().join("cpu-profile-ts.md"));
        assert!(std::fs::read_to_string(&md.path).unwrap().contains("functions by total"));
        assert_eq!(report.written().len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_html_still_writes_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_fixture(dir.path());
        let bridge = FlamegraphBridge::new(HtmlRenderer::None, MarkdownFormat::Summary);

        let report = bridge.render(&artifact).await;
        assert!(matches!(report.html, Err(RenderError::Disabled)));
        assert!(report.markdown.is_ok());
    }

    #[tokio::test]
    async fn test_corrupt_profile_fails_without_panicking() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ProfileWriter::new(dir.path()).write(ArtifactKind::Heap, b"\xff\xff\xff", "ts").unwrap();
        let bridge = FlamegraphBridge::new(HtmlRenderer::Builtin, MarkdownFormat::Summary);

        let report = bridge.render(&artifact).await;
        assert!(report.html.is_err());
        assert!(report.markdown.is_err());
    }
}
