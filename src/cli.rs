use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Duration;
use clap::{ArgAction, Parser};
use glob::Pattern;

use crate::constants::{self, DEFAULT_REFRESH_PADDING_SECS};
use crate::run::{self, RunConfig};

#[derive(Debug, Clone, Parser)]
#[command(
    name = "awsrun",
    version,
    about = "Run a command under derived AWS credentials for each matching profile",
    long_about = None
)]
pub struct Cli {
    #[arg(
        short = 'u',
        long = "profiles",
        help = "Glob matching the profile names to run against"
    )]
    pub profiles: String,

    #[arg(long, help = "Credential cache file (default: ~/.aws/cli/cache/awsrun)")]
    pub cache: Option<PathBuf>,

    #[arg(long, help = "Do not load cached authentication data")]
    pub no_load_cache: bool,

    #[arg(long, help = "Do not save cached authentication data")]
    pub no_save_cache: bool,

    #[arg(
        long,
        default_value_t = DEFAULT_REFRESH_PADDING_SECS,
        value_parser = clap::value_parser!(i64).range(0..),
        help = "Refresh credentials expiring within this many seconds"
    )]
    pub refresh_padding: i64,

    #[arg(short = 'v', long, action = ArgAction::Count, help = "Increase verbosity (-v info, -vv debug, -vvv trace)")]
    pub verbose: u8,

    #[arg(
        required = true,
        trailing_var_arg = true,
        help = "Command to run once per matched profile"
    )]
    pub command: Vec<String>,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        let pattern = Pattern::new(&self.profiles)
            .with_context(|| format!("Invalid profile glob: {:?}", self.profiles))?;

        let cache_path = match self.cache {
            Some(path) => path,
            None => constants::default_cache_path()
                .context("Could not determine the credential cache location")?,
        };

        run::execute(RunConfig {
            pattern,
            cache_path,
            load_cache: !self.no_load_cache,
            save_cache: !self.no_save_cache,
            refresh_padding: Duration::seconds(self.refresh_padding),
            command: self.command,
        })
        .await
    }
}
