pub mod agents;
pub mod bus;
pub mod config;
pub mod errors;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod orchestrator;
pub mod runner;
pub mod util;
pub mod workspace;
