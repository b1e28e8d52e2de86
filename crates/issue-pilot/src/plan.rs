//! Typed change plan returned by the model.
//!
//! The JSON field names are the wire contract with the prompt; the Rust
//! field names follow the rest of the crate.

use std::sync::LazyLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::errors::PilotError;

/// One whole-file write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileChange {
    /// Path relative to the repository root.
    pub path: String,
    /// Full new content of the file.
    pub content: String,
}

impl FileChange {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChangePlan {
    /// Short kebab-case branch name.
    pub branch_name: String,
    /// Files to write, in order. A repeated path is overwritten by the later entry.
    pub changes: Vec<FileChange>,
    pub commit_message: String,
    #[serde(rename = "pr_title")]
    pub request_title: String,
    #[serde(rename = "pr_body")]
    pub request_body: String,
}

impl ChangePlan {
    /// Parse and validate the model's JSON text.
    ///
    /// Missing or mistyped fields and semantic problems (unsafe branch name,
    /// empty change list, blank paths) all surface as one `ModelPlan` error.
    pub fn parse(text: &str) -> Result<Self, PilotError> {
        let mut plan: ChangePlan = serde_json::from_str(text.trim())
            .map_err(|e| PilotError::ModelPlan(format!("invalid plan JSON: {e}")))?;
        plan.normalize();
        let problems = plan.problems();
        if !problems.is_empty() {
            return Err(PilotError::ModelPlan(problems.join("; ")));
        }
        Ok(plan)
    }

    fn normalize(&mut self) {
        self.branch_name = self.branch_name.trim().to_string();
        for change in &mut self.changes {
            change.path = change.path.trim().to_string();
        }
    }

    fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !is_safe_branch_name(&self.branch_name) {
            problems.push(format!("unsafe branch_name `{}`", self.branch_name));
        }
        if self.changes.is_empty() {
            problems.push("changes is empty".to_string());
        }
        for (idx, change) in self.changes.iter().enumerate() {
            if change.path.is_empty() {
                problems.push(format!("changes[{idx}].path is empty"));
            }
        }
        if self.commit_message.trim().is_empty() {
            problems.push("commit_message is empty".to_string());
        }
        if self.request_title.trim().is_empty() {
            problems.push("pr_title is empty".to_string());
        }
        problems
    }

    /// Pretty-printed JSON schema of the plan, embedded in the prompt.
    pub fn json_schema() -> String {
        let schema = schemars::schema_for!(ChangePlan);
        serde_json::to_string_pretty(&schema).unwrap_or_default()
    }
}

static BRANCH_CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._/-]+$").expect("BRANCH_CHARSET regex should compile")
});

/// Conservative subset of git's ref-name rules.
fn is_safe_branch_name(name: &str) -> bool {
    BRANCH_CHARSET.is_match(name)
        && !name.contains("..")
        && !name.contains("//")
        && !name.starts_with(['-', '/', '.'])
        && !name.ends_with(['/', '.'])
        && !name.ends_with(".lock")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan_json() -> serde_json::Value {
        json!({
            "branch_name": "agent/health-check",
            "changes": [
                {"path": "src/health.rs", "content": "pub fn ok() {}\n"},
                {"path": " README.md ", "content": "# widgets\n"}
            ],
            "commit_message": "Add health check",
            "pr_title": "Add health check endpoint",
            "pr_body": "Closes #42"
        })
    }

    #[test]
    fn parses_and_normalizes_a_valid_plan() {
        let plan = ChangePlan::parse(&plan_json().to_string()).unwrap();
        assert_eq!(plan.branch_name, "agent/health-check");
        assert_eq!(plan.changes.len(), 2);
        assert_eq!(plan.changes[1].path, "README.md");
        assert_eq!(plan.request_title, "Add health check endpoint");
        assert_eq!(plan.request_body, "Closes #42");
    }

    #[test]
    fn missing_field_is_a_plan_error() {
        let mut value = plan_json();
        value.as_object_mut().unwrap().remove("pr_title");
        let err = ChangePlan::parse(&value.to_string()).unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ModelPlan);
        assert!(err.to_string().contains("pr_title"), "{err}");
    }

    #[test]
    fn mistyped_changes_is_a_plan_error() {
        let mut value = plan_json();
        value["changes"] = json!("src/health.rs");
        assert!(ChangePlan::parse(&value.to_string()).is_err());
    }

    #[test]
    fn non_json_text_is_a_plan_error() {
        let err = ChangePlan::parse("Sure! Here is the plan:").unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::ModelPlan);
    }

    #[test]
    fn semantic_problems_are_reported_together() {
        let mut value = plan_json();
        value["branch_name"] = json!("--force");
        value["changes"] = json!([]);
        let err = ChangePlan::parse(&value.to_string()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unsafe branch_name"), "{msg}");
        assert!(msg.contains("changes is empty"), "{msg}");
    }

    #[test]
    fn blank_path_is_rejected() {
        let mut value = plan_json();
        value["changes"] = json!([{"path": "   ", "content": "x"}]);
        let err = ChangePlan::parse(&value.to_string()).unwrap_err();
        assert!(err.to_string().contains("changes[0].path is empty"));
    }

    #[test]
    fn branch_name_rules() {
        for ok in ["fix-typo", "agent/add-login", "v1.2-docs"] {
            assert!(is_safe_branch_name(ok), "{ok}");
        }
        for bad in [
            "", "-rf", "/abs", "a..b", "trailing/", "x.lock", "has space", "semi;colon", "a//b",
        ] {
            assert!(!is_safe_branch_name(bad), "{bad}");
        }
    }

    #[test]
    fn schema_names_wire_fields() {
        let schema = ChangePlan::json_schema();
        for field in ["branch_name", "changes", "commit_message", "pr_title", "pr_body"] {
            assert!(schema.contains(field), "schema missing {field}");
        }
    }
}
