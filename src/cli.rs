//! Command-line entry contract for the feature server

use crate::error::ServeResult;
use crate::models::BackendKind;
use crate::server::BindAddress;
use clap::Parser;
use std::path::PathBuf;

/// Runs the server bound to the given address/port. ADDRESS may be '*' to
/// bind to all local addresses. :PORT may be omitted to choose a port
/// automatically.
#[derive(Debug, Parser)]
#[command(name = "feature_server", version)]
pub struct Cli {
    /// ADDRESS[:PORT]
    pub address: String,

    /// Backend kind: sklearn|spark (onnx when built with the onnx feature)
    pub backend_kind: String,

    /// Full path to the model artifact (a directory for spark)
    pub model_path: PathBuf,

    /// Optional TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Both are checked before anything is loaded or bound
    pub fn backend_kind(&self) -> ServeResult<BackendKind> {
        self.backend_kind.parse()
    }

    pub fn bind_address(&self) -> ServeResult<BindAddress> {
        self.address.parse()
    }
}
