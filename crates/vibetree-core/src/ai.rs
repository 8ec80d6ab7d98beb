//! Driving external AI CLIs: the command typed into a task shell, and
//! PR summaries generated from a branch diff.

use std::io;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::warn;

use crate::git::PrSummary;
use crate::model::Task;

#[derive(Debug, Error)]
pub enum AiError {
    #[error("invalid AI tool name: {0:?}")]
    InvalidTool(String),
    #[error("AI tool not configured")]
    NotConfigured,
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("AI generation failed: {0}")]
    Failed(String),
}

/// Tool names are interpolated into a shell command line, so only `[A-Za-z0-9._-]+` passes.
pub fn validate_tool_name(tool: &str) -> Result<&str, AiError> {
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-');
    if tool.is_empty() || !tool.chars().all(allowed) {
        return Err(AiError::InvalidTool(tool.to_string()));
    }
    Ok(tool)
}

/// `Task: <title>`, followed by a blank line and the description when there is one.
pub fn task_prompt(task: &Task) -> String {
    let description = task.description.trim();
    if description.is_empty() {
        format!("Task: {}", task.title)
    } else {
        format!("Task: {}\n\n{description}", task.title)
    }
}

/// Escape text so it stays a single argument inside double quotes.
pub fn escape_double_quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '`' => out.push_str("\\`"),
            '$' => out.push_str("\\$"),
            '!' => out.push_str("\\!"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

/// The line written into the PTY: `<tool> "<escaped prompt>"\n`.
pub fn ai_command_line(tool: &str, task: &Task) -> Result<String, AiError> {
    let tool = validate_tool_name(tool)?;
    Ok(format!(
        "{tool} \"{}\"\n",
        escape_double_quoted(&task_prompt(task))
    ))
}

fn summary_prompt(diff: &str) -> String {
    format!(
        "Analyze the following git diff and generate a concise Pull Request title and a detailed description.\n\
         The description should summarize the changes and their impact.\n\n\
         Format your response EXACTLY like this:\n\
         TITLE: <concise title>\n\
         BODY:\n\
         <detailed description>\n\n\
         DIFF:\n\
         {diff}\n"
    )
}

/// Pull `TITLE:` and `BODY:` out of the tool's answer.
pub fn parse_pr_summary(output: &str) -> PrSummary {
    let output = output.trim();
    let title = output
        .lines()
        .find_map(|l| l.strip_prefix("TITLE:"))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or("Updated PR")
        .to_string();

    let mut offset = 0;
    let mut body = None;
    for line in output.split_inclusive('\n') {
        if let Some(rest) = line.strip_prefix("BODY:") {
            let start = offset + (line.len() - rest.len());
            let text = output[start..].trim();
            if !text.is_empty() {
                body = Some(text.to_string());
            }
            break;
        }
        offset += line.len();
    }

    PrSummary {
        title,
        body: body.unwrap_or_else(|| output.to_string()),
    }
}

/// Ask `tool` for a PR title and body describing `diff`.
pub async fn generate_pr_summary(tool: &str, diff: &str, dir: &Path) -> Result<PrSummary, AiError> {
    if tool.trim().is_empty() {
        return Err(AiError::NotConfigured);
    }
    let tool = validate_tool_name(tool.trim())?;
    let output = Command::new(tool)
        .arg(summary_prompt(diff))
        .current_dir(dir)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| AiError::Spawn {
            tool: tool.to_string(),
            source,
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !output.status.success() {
        return Err(AiError::Failed(stderr.trim().to_string()));
    }
    if stdout.trim().is_empty() && !stderr.trim().is_empty() {
        warn!(tool, stderr = %stderr.trim(), "AI tool wrote only to stderr");
    }
    Ok(parse_pr_summary(&stdout))
}
