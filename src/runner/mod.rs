//! Runner process management.
//!
//! - [`launch`] — builds the command line for one of the three execution
//!   modes and starts it.
//! - [`process`] — process-group spawning, the [`process::ProcessHandle`],
//!   escalating termination, and one-shot helper commands.
//! - [`args`] — extra-argument tokenizing and webhook port discovery.

pub mod args;
pub mod launch;
pub mod process;
