//! Text dashboard for `manager run --dashboard` and `manager status`.

use crate::engine::manager::ManagerStatus;
use crate::status::WorkerStatus;
use chrono::{DateTime, Utc};

/// Full-screen redraw: clear, home, table.
pub fn redraw(status: &ManagerStatus) {
    print!("\x1b[2J\x1b[H{}", render(status, Utc::now()));
}

pub fn render(status: &ManagerStatus, now: DateTime<Utc>) -> String {
    let mut out = String::new();
    let uptime = (now - status.started_at).num_minutes();
    out.push_str(&format!(
        "drover manager  {}  (pid {}, up {}m)\n",
        status.repo, status.pid, uptime
    ));
    let last = status
        .last_poll
        .map(|t| format!("{}s ago", (now - t).num_seconds()))
        .unwrap_or_else(|| "never".into());
    out.push_str(&format!("last issue poll: {last}\n\n"));

    out.push_str(&format!(
        "  active {}/{}  completed {}  failed {}  merged {}  main failures {}  open escalations {}\n\n",
        status.workers_active,
        status.max_workers,
        status.workers_completed,
        status.workers_failed,
        status.prs_merged,
        status.main_failures,
        status.escalations
    ));

    if status.workers.is_empty() {
        out.push_str("  (no workers)\n");
        return out;
    }
    out.push_str(&format!(
        "  {:<8} {:<18} {:<8} {:<7} {}\n",
        "ISSUE", "PHASE", "PR", "AGE", "TITLE"
    ));
    for w in &status.workers {
        let marker = if w.active { "*" } else { " " };
        let pr = w.pr_number.map(|n| format!("#{n}")).unwrap_or_else(|| "-".into());
        out.push_str(&format!(
            "{marker} #{:<7} {:<18} {:<8} {:<7} {}\n",
            w.issue_id,
            w.phase.as_str(),
            pr,
            age(now, w.updated_at),
            truncate(&w.title, 50)
        ));
    }
    out
}

/// One line per worker for `worker list-workers`.
pub fn worker_row(status: &WorkerStatus, now: DateTime<Utc>) -> String {
    let last = status
        .last_log()
        .map(|l| truncate(&l.message, 60))
        .unwrap_or_default();
    format!(
        "#{:<7} {:<18} {:<7} {}{}",
        status.issue_id,
        status.phase.as_str(),
        age(now, status.updated_at),
        if status.dry_run { "[dry-run] " } else { "" },
        last
    )
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::manager::WorkerSummary;
    use crate::status::WorkerPhase;
    use chrono::Duration;

    fn status(now: DateTime<Utc>) -> ManagerStatus {
        ManagerStatus {
            repo: "acme/widgets".into(),
            pid: 4242,
            started_at: now - Duration::minutes(5),
            last_poll: Some(now - Duration::seconds(12)),
            max_workers: 3,
            issues_tracked: 2,
            workers_active: 1,
            workers_completed: 1,
            workers_failed: 0,
            prs_merged: 1,
            main_failures: 0,
            escalations: 0,
            workers: vec![
                WorkerSummary {
                    issue_id: 7,
                    title: "Fix pager".into(),
                    phase: WorkerPhase::CiLoop,
                    pr_number: Some(31),
                    reason: None,
                    active: true,
                    updated_at: now - Duration::seconds(90),
                },
                WorkerSummary {
                    issue_id: 3,
                    title: "Typo in README".into(),
                    phase: WorkerPhase::Completed,
                    pr_number: Some(30),
                    reason: Some("merged".into()),
                    active: false,
                    updated_at: now - Duration::hours(2),
                },
            ],
        }
    }

    #[test]
    fn renders_header_and_rows() {
        let now = Utc::now();
        let text = render(&status(now), now);
        assert!(text.contains("acme/widgets"));
        assert!(text.contains("up 5m"));
        assert!(text.contains("last issue poll: 12s ago"));
        assert!(text.contains("active 1/3"));
        assert!(text.contains("* #7       ci_loop            #31      1m      Fix pager"));
        assert!(text.contains("  #3       completed          #30      2h      Typo in README"));
    }

    #[test]
    fn truncates_long_titles() {
        assert_eq!(truncate("abcdef", 4), "abc…");
        assert_eq!(truncate("abc", 4), "abc");
    }
}
