pub mod cli;
pub mod error;
pub mod manager;
pub mod parser;
pub mod setup;
pub mod timeutils;
pub mod utils;
