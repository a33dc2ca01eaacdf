pub mod agent;
pub mod app;
pub mod chat;
pub mod cli;
pub mod config;
pub mod delegation;
pub mod doctor;
pub mod error;
pub mod history;
pub mod llm;
pub mod mcp;
pub mod memory;
pub mod openai;
pub mod orchestrator;
pub mod profiles;
pub mod provider;
pub mod registry;
pub mod server;
pub mod specialist;
pub mod streaming;
pub mod tool;

#[cfg(test)]
mod tests;
