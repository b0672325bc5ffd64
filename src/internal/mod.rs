pub mod config;
pub mod data_types;
pub mod errors;
pub mod events;
pub mod rtc_session;
pub mod session;
pub mod signal;
pub mod state_machine;
pub mod timeout;
pub mod transport;
