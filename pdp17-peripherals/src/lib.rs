//! Console peripherals for the PDP-17: the attention mailbox, the terminal
//! device threads, and the run wrapper that owns their lifecycle.

pub mod console;
pub mod mailbox;

pub use console::{run_machine, stdin_source, Console};
pub use mailbox::Mailbox;
