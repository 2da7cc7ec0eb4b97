pub mod agents;
pub mod cli;
pub mod config;
pub mod doctor;
pub mod error;
pub mod profiles;
pub mod provider;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod tool_policy;
pub mod tools;

#[cfg(test)]
mod tests;
