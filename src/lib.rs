pub mod config;
pub mod device;
pub mod exec;
pub mod factory;
pub mod fuzz;
pub mod host;
