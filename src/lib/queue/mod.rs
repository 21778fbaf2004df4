pub mod history;
pub mod policy;
pub mod source_queue;
