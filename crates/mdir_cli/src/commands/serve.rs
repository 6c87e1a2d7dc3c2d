//! Serve command implementation: a foreground TCP sync server.

use mdir_sync_server::{
    AlwaysCreate, CreationPolicy, MergeByName, RejectDuplicates, ServerConfig, SyncServer,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Options of the serve command.
#[derive(Debug)]
pub struct ServeOptions {
    /// Address to listen on.
    pub bind: SocketAddr,
    /// Journal directory; in memory when absent.
    pub storage: Option<PathBuf>,
    /// Open folder limit.
    pub cache_capacity: usize,
    /// `merge`, `always` or `reject`.
    pub policy: String,
}

fn policy(name: &str) -> Result<Box<dyn CreationPolicy>, Box<dyn std::error::Error>> {
    match name {
        "merge" => Ok(Box::new(MergeByName)),
        "always" => Ok(Box::new(AlwaysCreate)),
        "reject" => Ok(Box::new(RejectDuplicates)),
        other => Err(format!("unknown creation policy {other:?}").into()),
    }
}

/// Runs the server until Ctrl-C.
pub fn run(options: ServeOptions) -> Result<(), Box<dyn std::error::Error>> {
    let mut config =
        ServerConfig::new(options.bind).with_folder_cache_capacity(options.cache_capacity);
    if let Some(storage) = options.storage {
        config = config.with_storage_root(storage);
    }
    let server = Arc::new(SyncServer::with_policy(config, policy(&options.policy)?)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        let trigger = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, shutting down");
            }
            trigger.cancel();
        });
        server.run(shutdown).await
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_names() {
        assert!(policy("merge").is_ok());
        assert!(policy("always").is_ok());
        assert!(policy("reject").is_ok());
        assert!(policy("first").is_err());
    }
}
