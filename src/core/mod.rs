pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod prompt;
pub mod subroutine;
pub mod terminal;
pub mod transcript;
