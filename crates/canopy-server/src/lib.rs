//! Canopy server: wires configuration, observability and the gateway together
//! and serves the operator HTTP endpoints.

pub mod settings;
pub mod status;

pub use settings::{apply_overrides, gateway_config, observability_config, Overrides};
pub use status::{router, serve_status, LogLevelRequest, StatusState};
