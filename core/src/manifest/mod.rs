pub mod config;
pub mod core;
pub mod entities;
pub mod yaml;
