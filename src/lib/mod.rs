#[macro_use]
extern crate lazy_static;

pub mod audio;
pub mod capture;
pub mod cli;
pub mod clock;
pub mod control;
pub mod engine;
pub mod frame;
pub mod helper;
pub mod lifecycle;
pub mod logger;
pub mod output;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod source;
