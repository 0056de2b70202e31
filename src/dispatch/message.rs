//! Outbound task message sent to an agent session.

use std::path::Path;

use crate::agents::model::Agent;
use crate::tasks::model::Task;

/// Prefix agents reply with when they finish a task.
pub const COMPLETION_MARKER: &str = "TASK_COMPLETE:";

/// Render the message that hands `task` to `agent`.
///
/// The agent's behavioral documents come first, followed by the task brief,
/// the output directory and the completion instructions.
pub fn build_task_message(
    task: &Task,
    agent: &Agent,
    projects_path: &Path,
    completion_url: &str,
) -> String {
    let mut msg = String::new();

    let documents = [
        ("AGENT SOUL", &agent.soul_md),
        ("USER CONTEXT", &agent.user_md),
        ("AGENTS DIRECTORY", &agent.agents_md),
    ];
    for (heading, body) in documents {
        if let Some(body) = body.as_deref().filter(|b| !b.trim().is_empty()) {
            msg.push_str(&format!("--- {heading} ---\n{body}\n\n"));
        }
    }

    let output_dir = projects_path.join(task.project_slug());

    msg.push_str(&format!("{} **NEW TASK ASSIGNED**\n\n", task.priority.marker()));
    msg.push_str(&format!("**Title:** {}\n", task.title));
    if let Some(description) = task.description.as_deref().filter(|d| !d.is_empty()) {
        msg.push_str(&format!("**Description:** {description}\n"));
    }
    msg.push_str(&format!(
        "**Priority:** {}\n",
        task.priority.to_string().to_uppercase()
    ));
    if let Some(due) = task.due_date {
        msg.push_str(&format!("**Due:** {}\n", due.format("%Y-%m-%d %H:%M UTC")));
    }
    msg.push_str(&format!("**Task ID:** {}\n\n", task.id));

    msg.push_str(&format!("**OUTPUT DIRECTORY:** {}\n", output_dir.display()));
    msg.push_str("Create this directory and save all deliverables there.\n\n");

    msg.push_str(&format!(
        "When complete, reply with:\n`{COMPLETION_MARKER} [brief summary of what you did]`\n\n"
    ));
    msg.push_str(&format!(
        "Or report the result directly: POST {completion_url}\n\
         Body: {{\"task_id\": \"{}\", \"outcome\": \"success\", \"summary\": \"...\"}}\n\
         Use \"outcome\": \"failed\" with an \"error\" field if you could not finish.",
        task.id
    ));

    msg
}
