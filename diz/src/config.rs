use std::path::PathBuf;

use libdiz::compression::CompressionConfig;

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub host: String,
    pub port: u16,
    pub archive: PathBuf,
    pub compression: CompressionConfig,
}
