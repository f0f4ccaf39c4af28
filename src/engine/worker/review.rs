//! Review comment triage for REVIEW_LOOP.
//!
//! Blocking comments go back to the oracle as fix requests; everything else
//! is turned into a follow-up issue so the PR is not held up by nits.

use crate::host::{NewIssue, ReviewComment};
use regex::Regex;
use std::sync::LazyLock;

pub const FOLLOW_UP_LABELS: &[&str] = &["follow-up", "from-review"];

static BLOCKING_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(must|required|blocking|security|bug|broken)\b").expect("static regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommentClass {
    Blocking,
    NonBlocking,
}

/// Blocking when it is part of a changes-requested review or names a
/// blocking marker; anything else (nits, suggestions, questions) is not.
pub fn classify(comment: &ReviewComment) -> CommentClass {
    if comment.changes_requested || BLOCKING_MARKERS.is_match(&comment.body) {
        CommentClass::Blocking
    } else {
        CommentClass::NonBlocking
    }
}

/// Top-level comments with a body. Replies (including our own) are skipped.
pub fn is_actionable(comment: &ReviewComment) -> bool {
    comment.in_reply_to.is_none() && !comment.body.trim().is_empty()
}

pub fn follow_up_issue(pr: u64, issue: u64, comment: &ReviewComment) -> NewIssue {
    let location = match (&comment.path, comment.line) {
        (Some(path), Some(line)) => format!("{path}:{line}"),
        (Some(path), None) => path.clone(),
        _ => "review".to_string(),
    };
    let title_target = comment.path.as_deref().unwrap_or("review");
    let quoted: String = comment
        .body
        .lines()
        .map(|l| format!("> {l}\n"))
        .collect();

    NewIssue {
        title: format!("Follow-up from PR #{pr}: {title_target}"),
        body: format!(
            "Non-blocking review feedback from @{} on PR #{pr} (`{location}`), \
             deferred so the fix for #{issue} could merge.\n\n{quoted}\n\
             Original issue: #{issue}\nPull request: #{pr}\n",
            comment.author
        ),
        labels: FOLLOW_UP_LABELS.iter().map(|s| s.to_string()).collect(),
    }
}

/// Render blocking comments for the fix prompt.
pub fn render_for_prompt(comments: &[ReviewComment]) -> String {
    comments
        .iter()
        .map(|c| match (&c.path, c.line) {
            (Some(path), Some(line)) => format!("- **{path}:{line}**: {}", c.body.trim()),
            (Some(path), None) => format!("- **{path}**: {}", c.body.trim()),
            _ => format!("- {}", c.body.trim()),
        })
        .collect::<Vec<_>>()
        .join("\n")
}
