//! Submission API Module
//!
//! Exposes the execution gateway and the job config templates.

mod http;
pub mod template;

pub use http::{AppState, GatewayServer, ALLOWED_COMMANDS, EXECUTE_HEADER, EXECUTE_VERSION};
