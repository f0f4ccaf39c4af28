//! drover: autonomous issue workers and the manager that schedules them.
//!
//! A worker carries one issue from implementation through validation,
//! review, CI, merge and a post-merge check of the default branch. The
//! manager discovers and triages issues, bounds concurrency and escalates
//! what workers cannot resolve.

pub mod channels;
pub mod cli;
pub mod cmd;
pub mod config;
pub mod engine;
pub mod escalation;
pub mod github;
pub mod home;
pub mod host;
pub mod redact;
pub mod status;
pub mod triage;
