//! Engine: the per-issue worker state machine and the manager that
//! schedules workers.
//!
//! The two halves share no memory. A worker writes its status document and
//! appends notifications; the manager reads both.

pub mod manager;
pub mod worker;
