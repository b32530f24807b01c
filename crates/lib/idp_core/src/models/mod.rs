//! Domain models and the database rows behind them.

pub mod auth_request;
pub mod client;
pub mod key;
pub mod token;
pub mod user;
