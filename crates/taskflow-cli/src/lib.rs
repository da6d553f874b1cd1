//! Library half of the `taskflow` binary, so the commands can be exercised
//! from integration tests without spawning a process.

pub mod commands;
