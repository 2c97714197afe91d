//! Child process ownership: spawning, stdio pumps, and supervision.
//!
//! - `spawner`: launches the child with piped stdio and `kill_on_drop`.
//! - `reader`: drains stdout into parsed messages for a [`ChildListener`].
//! - `writer`: the single task that writes framed lines to stdin.
//! - `stderr`: keeps recent stderr lines for crash diagnostics.
//! - `supervisor`: lifecycle state, restart policy, and shutdown.

pub mod reader;
pub mod spawner;
pub mod stderr;
pub mod supervisor;
pub mod writer;

pub use reader::ChildListener;
pub use supervisor::{ProcessState, ProcessSupervisor};
