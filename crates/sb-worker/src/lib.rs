//! Switchboard worker: connects out to the coordinator, runs the assistant
//! CLI for assigned tasks, and relays the parsed output stream.

pub mod client;
pub mod executor;
pub mod parser;
pub mod runner;

pub use client::WorkerClient;
pub use executor::{TaskExecutor, ASSISTANT_CLI};
pub use parser::StreamParser;
