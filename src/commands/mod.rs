//! Caller-facing operations on [`crate::Engine`], grouped by concern.

mod candidate_api;
mod device_api;
mod session_api;
