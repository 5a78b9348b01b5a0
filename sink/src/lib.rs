pub mod batch;
pub mod bus;
pub mod cache;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod ingest;
pub mod saver;
pub mod search;
pub mod state;
pub mod stats;
pub mod store;
