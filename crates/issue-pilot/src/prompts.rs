//! Prompt text sent to the model.
//!
//! One prompt per run: the issue plus fixed output-format instructions.
//! Retries resend exactly this string.

use crate::plan::ChangePlan;
use crate::tracker::WorkItem;

/// Rules appended to every task. Kept short: the model tends to ignore long rule lists.
pub const RULES: &str = "\
## Rules
- Keep changes minimal and runnable. Deliver a small, working increment.
- Each entry in `changes` replaces the WHOLE file at `path`; include the full file content.
- Paths are relative to the repository root. Never use absolute paths or `..`.
- If you add dependencies, update the dependency manifest (requirements.txt, package.json, Cargo.toml) too.
- Prefer scaffolding first when the issue describes a large feature.
";

/// Output contract. Mirrors the `ChangePlan` wire names.
pub const OUTPUT_FORMAT: &str = "\
## Output
Respond with STRICT JSON ONLY (no prose, no code fences) containing:
- \"branch_name\": string (kebab-case, short, unique to this issue)
- \"changes\": array of objects {\"path\": \"...\", \"content\": \"...\"}
- \"commit_message\": string
- \"pr_title\": string
- \"pr_body\": string
";

/// Build the single prompt for `item` in repository `repo`.
pub fn build_plan_prompt(repo: &str, item: &WorkItem) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are a senior software engineer working in the GitHub repository \"{repo}\".\n\n"
    ));
    prompt.push_str(&format!("# Task (issue #{})\n\n", item.id));
    prompt.push_str(&format!("**Title:** {}\n\n", item.title.trim()));
    prompt.push_str("**Details:**\n");
    match item.description.as_deref().map(str::trim) {
        Some(body) if !body.is_empty() => prompt.push_str(body),
        _ => prompt.push_str("(no description provided)"),
    }
    prompt.push_str("\n\n");

    prompt.push_str(RULES);
    prompt.push('\n');
    prompt.push_str(OUTPUT_FORMAT);
    prompt.push_str("\nJSON schema of the expected object:\n");
    prompt.push_str(&ChangePlan::json_schema());
    prompt.push('\n');

    prompt
}
