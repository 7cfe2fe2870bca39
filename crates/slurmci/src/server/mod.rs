pub mod autoalloc;
pub mod bootstrap;
pub mod metrics;
