use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use libdiz::compression::{CompressionConfig, DEFAULT_BLOCK_SIZE, DEFAULT_LEVEL};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) compression: CompressionArgs,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Args, Debug)]
pub(crate) struct CompressionArgs {
    /// Deflate level, 0 (store) to 9 (best)
    #[arg(long, global = true, env = "DIZ_LEVEL", default_value_t = DEFAULT_LEVEL)]
    pub(crate) level: u32,

    /// Uncompressed bytes per parallel compression block
    #[arg(long, global = true, env = "DIZ_BLOCK_SIZE", default_value_t = DEFAULT_BLOCK_SIZE)]
    pub(crate) block_size: usize,

    /// Blocks compressed concurrently [default: twice the available parallelism]
    #[arg(long, global = true, env = "DIZ_CONCURRENCY")]
    pub(crate) concurrency: Option<usize>,
}

impl CompressionArgs {
    pub(crate) fn to_config(&self) -> libdiz::Result<CompressionConfig> {
        let concurrency = self
            .concurrency
            .unwrap_or_else(|| CompressionConfig::default().concurrency);
        CompressionConfig::new(self.level, self.block_size, concurrency)
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create an archive from a docker-save tar
    Create {
        /// Output archive, `-` for stdout
        output: String,

        /// docker-save tar to read images from
        #[arg(long)]
        tar: PathBuf,

        /// Tag globs to include; a leading `-` excludes
        #[arg(default_value = "*", allow_hyphen_values = true)]
        tags: Vec<String>,
    },

    /// Replace the images of matching tags in an archive
    Update {
        archive: PathBuf,

        /// docker-save tar holding the new images
        #[arg(long)]
        tar: PathBuf,

        #[arg(default_value = "*", allow_hyphen_values = true)]
        tags: Vec<String>,
    },

    /// Write a docker-load tar of the matching images
    Restore {
        archive: PathBuf,

        /// Output tar, `-` or absent for stdout
        #[arg(short, long)]
        output: Option<String>,

        #[arg(default_value = "*", allow_hyphen_values = true)]
        tags: Vec<String>,
    },

    /// List the images held by an archive
    List {
        archive: PathBuf,

        #[arg(default_value = "*", allow_hyphen_values = true)]
        tags: Vec<String>,
    },

    /// Serve an archive over the registry pull protocol
    Serve {
        archive: PathBuf,

        /// Listening host
        #[arg(long, env = "DIZ_HOST", default_value = "0.0.0.0")]
        host: String,

        /// Listening port
        #[arg(short, long, env = "DIZ_PORT", default_value_t = 5000)]
        port: u16,
    },
}
