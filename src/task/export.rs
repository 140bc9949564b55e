use std::fmt::Write;

use super::TaskDetail;

/// Render a task and its conversation as a flat markdown document.
pub fn render_markdown(detail: &TaskDetail) -> String {
    let task = &detail.task;
    let mut out = String::new();

    // Writing to a String cannot fail.
    let _ = writeln!(out, "# Research Task\n");
    let _ = writeln!(out, "**Task:** {}\n", task.text);
    let _ = writeln!(out, "**Status:** {}\n", task.status);
    let _ = writeln!(out, "**Created:** {}\n", task.created_at.to_rfc3339());
    if let Some(done) = task.completed_at {
        let _ = writeln!(out, "**Completed:** {}\n", done.to_rfc3339());
    }
    if let Some(metrics) = &detail.metrics {
        let _ = writeln!(out, "**Duration:** {:.2}s\n", metrics.duration_secs);
        let _ = writeln!(
            out,
            "**Tokens:** {} ({} in / {} out), estimated cost ${:.4}\n",
            metrics.total_tokens, metrics.input_tokens, metrics.output_tokens, metrics.estimated_cost
        );
    }
    if let Some(error) = &task.error {
        let _ = writeln!(out, "**Error:** {}\n", error);
    }

    let _ = writeln!(out, "## Agent Messages\n");
    let mut messages: Vec<_> = detail.messages.iter().collect();
    messages.sort_by_key(|m| m.order);
    for msg in messages {
        let _ = writeln!(out, "### {}\n", msg.agent);
        let _ = writeln!(out, "{}\n", msg.content.trim_end());
    }
    out
}
