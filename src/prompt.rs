use std::path::Path;

use crate::types::{PhaseTemplate, RetryContext, Task};

/// Parameters for building a phase prompt.
pub struct PromptParams<'a> {
    pub task: &'a Task,
    pub template: &'a PhaseTemplate,
    pub iteration: u32,
    pub max_iterations: u32,
    pub result_path: &'a Path,
    /// Summary of the previous phase, for context continuity.
    pub previous_summary: Option<&'a str>,
    /// Present when this run is a rewind from a later phase.
    pub retry_context: Option<&'a RetryContext>,
}

/// Build a full prompt for a phase agent.
///
/// Structure: [Autonomous Preamble] + [Task Context] + [Phase Instructions]
/// + [Structured Output Suffix]. The agent works in the task's worktree,
/// which is its process working directory.
pub fn build_prompt(params: &PromptParams) -> String {
    [
        build_preamble(params),
        build_task_context(params.task),
        build_phase_instructions(params),
        build_output_suffix(params),
    ]
    .join("\n\n")
}

fn build_preamble(params: &PromptParams) -> String {
    let mut preamble = format!(
        "# Autonomous Agent\n\n\
        You are running autonomously as phase `{}` of an orchestrated workflow.\n\
        No human is available for questions — use your judgment to make decisions.\n\
        You are in an isolated git worktree for this task; edit files freely, but\n\
        do not commit, push, or switch branches — the orchestrator owns git.",
        params.template.id
    );

    if params.max_iterations > 1 {
        preamble.push_str(&format!(
            "\n\nThis is iteration {} of at most {} for this phase.",
            params.iteration, params.max_iterations
        ));
    }

    preamble
}

fn build_task_context(task: &Task) -> String {
    let mut lines = vec![
        "## Task".to_string(),
        format!("- **Id:** {}", task.id),
        format!("- **Title:** {}", task.title),
        format!("- **Weight:** {}", task.weight),
    ];
    if let Some(ref description) = task.description {
        lines.push(format!("- **Description:** {}", description));
    }
    if let Some(ref spec) = task.inline_spec {
        lines.push(format!("\n### Specification\n\n{}", spec));
    }
    lines.join("\n")
}

fn build_phase_instructions(params: &PromptParams) -> String {
    let mut sections = vec![format!(
        "## Phase: {}\n\nCarry out the `{}` phase for this task.",
        params.template.name, params.template.id
    )];

    if let Some(summary) = params.previous_summary {
        sections.push(format!("### Previous phase summary\n\n{}", summary));
    }

    if let Some(retry) = params.retry_context {
        sections.push(format!(
            "### Retry context\n\nA later phase (`{}`) failed and execution was rewound here.\n\
            Failure: {}\n\nAddress the failure cause in this fresh attempt.",
            retry.from_phase, retry.reason
        ));
    }

    sections.join("\n\n")
}

fn build_output_suffix(params: &PromptParams) -> String {
    format!(
        "## Required Output\n\n\
        When you are done, write a JSON file to `{}` with exactly this shape:\n\n\
        ```json\n\
        {{\n\
        \x20 \"task_id\": \"{}\",\n\
        \x20 \"phase\": \"{}\",\n\
        \x20 \"outcome\": \"ok\" | \"needs_retry\" | \"failed\",\n\
        \x20 \"summary\": \"one-paragraph summary of what you did\",\n\
        \x20 \"reason\": \"required when outcome is failed\",\n\
        \x20 \"commit_summary\": \"one-line imperative description of the change\"\n\
        }}\n\
        ```\n\n\
        Use `needs_retry` when the phase goal is not yet met but another\n\
        iteration of this conversation could meet it. Use `failed` when this\n\
        phase cannot succeed without earlier work being redone.",
        params.result_path.display(),
        params.task.id,
        params.template.id
    )
}

/// One-line-per-task summary of the backlog, used by review prompts for
/// duplicate detection. Returns `None` when nothing besides `exclude_id`
/// exists.
pub fn build_backlog_summary(tasks: &[Task], exclude_id: &str) -> Option<String> {
    let lines: Vec<String> = tasks
        .iter()
        .filter(|t| t.id != exclude_id)
        .map(|t| format!("- {}: {} [{}]", t.id, t.title, t.status))
        .collect();

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Prompt for the `ai` gate reviewer: judge the phase output and return a
/// verdict file.
pub fn build_review_prompt(
    task: &Task,
    template: &PhaseTemplate,
    phase_summary: &str,
    result_path: &Path,
) -> String {
    format!(
        "# Autonomous Reviewer\n\n\
        You are reviewing the output of phase `{}` for task {} ({}).\n\
        Phase summary:\n\n{}\n\n\
        Inspect the working tree and judge whether the phase goal is met.\n\n\
        ## Required Output\n\n\
        Write a JSON file to `{}`:\n\n\
        ```json\n\
        {{\n\
        \x20 \"task_id\": \"{}\",\n\
        \x20 \"phase\": \"{}\",\n\
        \x20 \"outcome\": \"ok\" | \"failed\",\n\
        \x20 \"summary\": \"verdict rationale\"\n\
        }}\n\
        ```",
        template.id,
        task.id,
        task.title,
        phase_summary,
        result_path.display(),
        task.id,
        template.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Weight;
    use std::path::PathBuf;

    fn make_params<'a>(
        task: &'a Task,
        template: &'a PhaseTemplate,
        result_path: &'a Path,
    ) -> PromptParams<'a> {
        PromptParams {
            task,
            template,
            iteration: 1,
            max_iterations: 1,
            result_path,
            previous_summary: None,
            retry_context: None,
        }
    }

    #[test]
    fn prompt_contains_identity_and_contract() {
        let mut task = Task::new("TASK-003", "Add health endpoint");
        task.weight = Weight::Small;
        let template = PhaseTemplate::new("implement");
        let result_path = PathBuf::from("/tmp/result.json");

        let prompt = build_prompt(&make_params(&task, &template, &result_path));
        assert!(prompt.contains("TASK-003"));
        assert!(prompt.contains("Add health endpoint"));
        assert!(prompt.contains("phase `implement`"));
        assert!(prompt.contains("/tmp/result.json"));
        assert!(prompt.contains("needs_retry"));
    }

    #[test]
    fn prompt_includes_iteration_banner_only_when_iterating() {
        let task = Task::new("TASK-003", "t");
        let template = PhaseTemplate::new("implement");
        let result_path = PathBuf::from("/tmp/result.json");

        let mut params = make_params(&task, &template, &result_path);
        let prompt = build_prompt(&params);
        assert!(!prompt.contains("iteration"));

        params.iteration = 2;
        params.max_iterations = 3;
        let prompt = build_prompt(&params);
        assert!(prompt.contains("iteration 2 of at most 3"));
    }

    #[test]
    fn prompt_carries_retry_context() {
        let task = Task::new("TASK-003", "t");
        let template = PhaseTemplate::new("spec");
        let result_path = PathBuf::from("/tmp/result.json");
        let retry = RetryContext {
            from_phase: "review".to_string(),
            reason: "review found missing edge cases".to_string(),
        };

        let mut params = make_params(&task, &template, &result_path);
        params.retry_context = Some(&retry);
        let prompt = build_prompt(&params);
        assert!(prompt.contains("`review`"));
        assert!(prompt.contains("missing edge cases"));
    }

    #[test]
    fn backlog_summary_excludes_self() {
        let a = Task::new("TASK-001", "First");
        let b = Task::new("TASK-002", "Second");
        let tasks = vec![a, b];

        let summary = build_backlog_summary(&tasks, "TASK-001").unwrap();
        assert!(summary.contains("TASK-002"));
        assert!(!summary.contains("TASK-001"));

        assert!(build_backlog_summary(&tasks[..1], "TASK-001").is_none());
    }
}
