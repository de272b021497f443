pub mod api;
pub mod app;
pub mod config;
pub mod errors;
pub mod external;
pub mod jobs;
pub mod linking;
pub mod mediator;
pub mod metrics_defs;
pub mod owners;
pub mod pagination;
pub mod run_state;
pub mod services;
pub mod store;
pub mod types;
