// Accumulated setup issues
//
// Non-fatal problems found while checking prerequisites or validating a submission.
// They are collected in order and rendered alongside the form.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    Environment,
    Permission,
    Validation,
    Driver,
    Installation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupIssue {
    pub kind: IssueKind,
    /// Form field the issue belongs to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationResults {
    issues: Vec<SetupIssue>,
}

impl ValidationResults {
    pub fn add_error(&mut self, kind: IssueKind, message: impl Into<String>) {
        self.issues.push(SetupIssue {
            kind,
            field: None,
            message: message.into(),
        });
    }

    pub fn add_field(&mut self, kind: IssueKind, field: &str, message: impl Into<String>) {
        self.issues.push(SetupIssue {
            kind,
            field: Some(field.to_string()),
            message: message.into(),
        });
    }

    pub fn extend(&mut self, other: ValidationResults) {
        self.issues.extend(other.issues);
    }

    pub fn error_count(&self) -> usize {
        self.issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn has_kind(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn messages_for(&self, field: &str) -> Vec<String> {
        self.issues
            .iter()
            .filter(|i| i.field.as_deref() == Some(field))
            .map(|i| i.message.clone())
            .collect()
    }

    pub fn messages(&self) -> Vec<String> {
        self.issues.iter().map(|i| i.message.clone()).collect()
    }
}
