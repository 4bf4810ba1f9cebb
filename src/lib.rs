pub mod cli;
pub mod daemon;
pub mod errors;
pub mod mesh;
pub mod models;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod service;
pub mod stages;
pub mod storage;
pub mod validation;
