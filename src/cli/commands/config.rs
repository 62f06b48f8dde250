//! Logging flags shared by every command

use clap::Args;

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Default, Args)]
pub struct LoggingArgs {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "LODESTAR_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log filter directives, e.g. `lodestar_core=debug,tower_http=info`
    #[arg(long = "log-filter", env = "LODESTAR_LOG_FILTER", global = true)]
    pub log_filter: Option<String>,
}

impl LoggingArgs {
    /// `-v` flags win over an explicit level, which wins over the config file
    pub fn effective_level<'a>(&'a self, config: &'a LoggingConfig) -> &'a str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace",
            (1, _) => "debug",
            (0, Some(level)) => level,
            _ => config.level.as_deref().unwrap_or("info"),
        }
    }

    /// Full `EnvFilter` directive string
    pub fn filter_directives(&self, config: &LoggingConfig) -> String {
        let filter = self.log_filter.as_ref().or(config.filter.as_ref());
        match filter {
            Some(filter) => filter.clone(),
            None => {
                let level = self.effective_level(config);
                format!("lodestar={level},lodestar_core={level},tower_http={level}")
            }
        }
    }
}
