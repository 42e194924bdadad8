//! Interactive terminal sessions.
//!
//! Each session owns one shell on its own pseudo-terminal. The registry maps
//! controller-assigned session IDs to sessions and drives their lifecycle:
//! a reader task streams output, a waiter task notices the end and reports
//! `pty_ended` exactly once.

mod registry;
mod terminal;

pub use registry::{SessionRegistry, StartRequest};
pub use terminal::{SessionState, TerminalSession};
