pub mod builds;
pub mod contexts;
pub mod convo;
pub mod file_results;
pub mod plans;
pub mod subtasks;
