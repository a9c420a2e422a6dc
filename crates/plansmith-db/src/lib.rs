//! Postgres persistence for plansmith: plans and branches, contexts,
//! subtasks, conversation messages, builds and file results.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
