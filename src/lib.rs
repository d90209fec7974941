pub mod activity;
pub mod agent;
pub mod archive;
pub mod clock;
pub mod config;
pub mod decision;
pub mod export;
pub mod migrate;
pub mod orchestrator;
pub mod proc;
pub mod shell;
