//! Command-line interface
//!
//! - `serve`: run the HTTP server
//! - `models`: list models under the models directory

pub mod commands;
pub mod handlers;

pub use commands::{Commands, LoggingArgs, ModelsCommand, ServeCommand, ServerCliArgs};
pub use handlers::{handle_models, handle_serve};
