//! Process-lifecycle concerns: signal handling and graceful shutdown.

pub mod shutdown;
