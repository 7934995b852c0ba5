pub mod error_handler;
pub mod validators;

#[cfg(feature = "espidf")]
pub mod web_server;
#[cfg(feature = "espidf")]
pub mod wifi;
