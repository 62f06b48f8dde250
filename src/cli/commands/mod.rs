pub mod config;
pub mod model;
pub mod server;

pub use config::LoggingArgs;
pub use model::ModelsCommand;
pub use server::{ServeCommand, ServerCliArgs};

use clap::Subcommand;

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the OpenAI-compatible inference server
    Serve(ServeCommand),

    /// List the models found under the models directory
    Models(ModelsCommand),
}
