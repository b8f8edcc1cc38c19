//! `sshfleet` CLI Library
//!
//! The driver around the runner: manifest loading, password prompts,
//! connection options, result rendering and the built-in demo.

pub mod demo_cmd;
pub mod prompt;
pub mod render;
pub mod run_cmd;
