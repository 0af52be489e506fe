//! Durable process state: the framed output log and the process directory
//! schema that together make a launched command reattachable after a
//! server restart.

pub mod dir;
pub mod log;

pub use dir::{ExitStatus, ProcessDir, ProcessInfo};
pub use log::{LogWriter, Record, Stream, Streams};
