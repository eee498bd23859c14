pub mod backend;
pub mod config;
pub mod pipeline;
pub mod serve;
pub mod supervisor;
pub mod tasks;
pub mod utils;
pub mod watch;
