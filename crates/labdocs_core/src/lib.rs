pub mod audit;
pub mod bookstack;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod notify;
pub mod render;
pub mod runner;
pub mod runtime;
pub mod sync;
