use thiserror::Error;

use vitals_flow::FlowError;

use crate::db::DbError;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("signal bus error: {0}")]
    Signal(#[from] vitals_signal::SignalError),

    #[error("invalid settings: {0}")]
    Settings(String),

    #[error("settings parse error: {0}")]
    SettingsParse(#[from] toml::de::Error),

    #[error("settings I/O error: {0}")]
    SettingsIo(#[from] std::io::Error),

    #[error("monitor is already running")]
    AlreadyStarted,
}
