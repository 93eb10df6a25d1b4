//! HTML flamegraphs: built in through inferno, or delegated to a command.

use std::path::Path;
use std::process::Stdio;

use log::debug;
use tokio::process::Command;

use super::stacks::ProfileView;
use crate::domain::RenderError;

const INPUT_PLACEHOLDER: &str = "{input}";
const OUTPUT_PLACEHOLDER: &str = "{output}";

/// Render `view` as an interactive inferno SVG wrapped in a standalone page.
///
/// # Errors
/// [`RenderError::EmptyProfile`] when there is nothing to draw, or an I/O
/// error from inferno.
pub fn render_flamegraph_html(view: &ProfileView, title: &str) -> Result<String, RenderError> {
    let lines = view.folded_lines();
    if lines.is_empty() {
        return Err(RenderError::EmptyProfile);
    }

    let mut options = inferno::flamegraph::Options::default();
    options.title = title.to_string();
    options.subtitle = Some(format!("{} ({})", view.sample_type, view.unit));
    options.count_name = view.unit.clone();

    let mut svg = Vec::new();
    inferno::flamegraph::from_lines(&mut options, lines.iter().map(String::as_str), &mut svg)?;
    let svg = String::from_utf8_lossy(&svg);

    Ok(format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n<meta charset=\"utf-8\">\n<title>{title}</title>\n\
         <style>body {{ margin: 0; background: #fff; }} svg {{ width: 100%; height: auto; }}</style>\n\
         </head>\n<body>\n{svg}\n</body>\n</html>\n",
        title = html_escape(title),
    ))
}

/// Run an external renderer built from `template`.
///
/// `{input}` and `{output}` are replaced in every argument. When the
/// template has no `{output}`, the command's stdout becomes the output file.
///
/// # Errors
/// Spawn failures, a non-zero exit status, or failing to write stdout.
pub async fn run_command(template: &str, input: &Path, output: &Path) -> Result<(), RenderError> {
    let input = input.to_string_lossy();
    let output_str = output.to_string_lossy();
    let args: Vec<String> = template
        .split_whitespace()
        .map(|arg| arg.replace(INPUT_PLACEHOLDER, &input).replace(OUTPUT_PLACEHOLDER, &output_str))
        .collect();
    let Some((program, rest)) = args.split_first() else {
        return Err(RenderError::UnknownRenderer(template.to_string()));
    };

    let writes_stdout = !template.contains(OUTPUT_PLACEHOLDER);
    debug!("Running renderer: {}", args.join(" "));

    let mut command = Command::new(program);
    command.args(rest).stdin(Stdio::null()).kill_on_drop(true);

    let spawn_failed = |source| RenderError::SpawnFailed { program: program.clone(), source };
    if writes_stdout {
        let result = command.stderr(Stdio::inherit()).output().await.map_err(spawn_failed)?;
        if !result.status.success() {
            return Err(RenderError::CommandFailed { program: program.clone(), status: result.status });
        }
        tokio::fs::write(output, &result.stdout).await?;
    } else {
        let status = command.status().await.map_err(spawn_failed)?;
        if !status.success() {
            return Err(RenderError::CommandFailed { program: program.clone(), status });
        }
    }
    Ok(())
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::stacks::fixtures;

    #[test]
    fn test_builtin_embeds_svg() {
        let view = ProfileView::from_profile(&fixtures::cpu_profile());
        let html = render_flamegraph_html(&view, "cpu-profile-ts").unwrap();
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<svg"));
        assert!(html.contains("<title>cpu-profile-ts</title>"));
    }

    #[test]
    fn test_empty_view_is_an_error() {
        let view = ProfileView::from_profile(&pprof::protos::Profile::default());
        assert!(matches!(render_flamegraph_html(&view, "t"), Err(RenderError::EmptyProfile)));
    }

    #[tokio::test]
    async fn test_command_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.pb");
        let output = dir.path().join("out.html");
        std::fs::write(&input, b"profile").unwrap();

        run_command("cp {input} {output}", &input, &output).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"profile");
    }

    #[tokio::test]
    async fn test_command_stdout_becomes_output() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.pb");
        let output = dir.path().join("out.html");
        std::fs::write(&input, b"<html/>").unwrap();

        run_command("cat {input}", &input, &output).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"<html/>");
    }

    #[tokio::test]
    async fn test_failing_command_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.html");
        let err = run_command("false {input}", Path::new("x"), &output).await.unwrap_err();
        assert!(matches!(err, RenderError::CommandFailed { .. }));
    }
}
