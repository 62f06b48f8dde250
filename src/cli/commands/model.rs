use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ModelsCommand {
    /// Directory to scan instead of the configured one
    #[arg(long, value_name = "DIR")]
    pub models_dir: Option<PathBuf>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}
