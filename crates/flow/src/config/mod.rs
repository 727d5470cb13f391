//! Flow configuration loaded from TOML with environment overrides.

mod loading;
mod types;
mod validation;


pub use types::{DeputyConfig, FlowConfig, JoinConfig};
