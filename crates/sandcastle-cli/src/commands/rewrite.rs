//! `sandcastle rewrite-kubeconfig`: repoint a kubeconfig at another server

use std::path::PathBuf;

use clap::Args;
use tracing::info;

use sandcastle_cluster::rewrite_server;

use super::CommandErrorExt;
use crate::Result;

/// Rewrite arguments
#[derive(Args, Debug)]
pub struct RewriteArgs {
    /// Kubeconfig to rewrite
    pub kubeconfig: PathBuf,

    /// New server URL, e.g. https://127.0.0.1:6443
    #[arg(long)]
    pub server: String,

    /// Where to write the result [default: rewrite in place]
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

/// Run the rewrite command
pub async fn run(args: RewriteArgs) -> Result<()> {
    let original = tokio::fs::read_to_string(&args.kubeconfig)
        .await
        .cmd_err()?;
    let rewritten = rewrite_server(&original, &args.server)?;

    let output = args.output.as_ref().unwrap_or(&args.kubeconfig);
    tokio::fs::write(output, rewritten).await?;

    info!(path = %output.display(), server = %args.server, "kubeconfig rewritten");
    Ok(())
}
