pub mod agent;
pub mod chain;
pub mod config;
pub mod error;
pub mod flow;
pub mod llm;
pub mod prompts;
pub mod storage;
pub mod subtasks;
pub mod tools;
