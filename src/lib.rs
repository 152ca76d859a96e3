#![forbid(unsafe_code)]

// Stagehand library - stage session orchestrator over a REST stage API, chat signaling and a media engine

pub mod api;
pub mod chat;
pub mod config;
pub mod metrics;
pub mod preferences;
pub mod session;
pub mod stage;

#[cfg(test)]
mod testing;
