pub mod brain;
pub mod catalog;
pub mod credentials;
pub mod lifecycle;
pub mod llm;
pub mod mcp;
pub mod pool;
pub mod service;
pub mod terminal;
pub mod transcript;
