pub mod config;
pub mod error;

pub use config::{Config, TrafficConfig, TrafficIntensity, WeatherConfig};
pub use error::*;
