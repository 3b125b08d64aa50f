pub mod configuration;
pub mod controller;
pub mod email;
pub mod error;
pub mod graph;
pub mod llm;
pub mod prompts;
pub mod report;
pub mod search;
pub mod state;
pub mod store;
pub mod utils;
