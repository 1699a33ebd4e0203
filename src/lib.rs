// Library interface for the proctoring server and device runtime

// Shared vocabulary
pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Server side
pub mod chunk_wire;
pub mod db;
pub mod queries;
pub mod registry;
pub mod schema;
pub mod serve;
pub mod service;

// Device side
pub mod analysis;
pub mod api;
pub mod capture;
pub mod context;
pub mod lockdown;
pub mod recording_state;
pub mod relay;
pub mod upload;
pub mod violation;

pub use context::{DeviceEvent, DevicePlatform, SessionContext, TeardownReport};
pub use error::{ProctorError, Result};
pub use service::ProctorService;
