pub mod batch;
pub mod cache;
pub mod check;
pub mod config;
pub mod db;
pub mod detect;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod singleflight;
pub mod store;
pub mod tracker;
pub mod upstream;

pub use error::{CheckFailure, TrackerError, UpstreamError};
pub use tracker::{Tracker, TrackerSettings};
