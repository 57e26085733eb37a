//! Application-level orchestration.
//!
//! This module owns the job lifecycle (start/poll/finish/cancel) and the post-completion
//! steps: automatic downloads and the delayed backend cleanup. UI/CLI layers only send
//! commands and render the events coming back.

mod controller;
mod post_process;

pub(crate) use controller::{run_controller, JobController, UiCommand};
