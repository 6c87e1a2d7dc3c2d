//! Server configuration.

use mdir_core::DEFAULT_MAX_DOCUMENT_SIZE;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default number of folders kept open.
pub const DEFAULT_FOLDER_CACHE_CAPACITY: usize = 1024;

/// Default identifier of the root folder.
pub const DEFAULT_ROOT_DIR_ID: &str = "root";

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Folders kept open at once. Subscribed folders never count as idle.
    pub folder_cache_capacity: usize,
    /// Directory holding one journal per folder; `None` keeps everything in
    /// memory.
    pub storage_root: Option<PathBuf>,
    /// Largest encoded document accepted.
    pub max_document_size: usize,
    /// Whether to flush journals after every append.
    pub sync_on_append: bool,
    /// Identifier of the folder every tree starts from.
    pub root_dir_id: String,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            folder_cache_capacity: DEFAULT_FOLDER_CACHE_CAPACITY,
            storage_root: None,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
            sync_on_append: true,
            root_dir_id: DEFAULT_ROOT_DIR_ID.to_string(),
        }
    }

    /// Sets the folder cache capacity.
    pub fn with_folder_cache_capacity(mut self, capacity: usize) -> Self {
        self.folder_cache_capacity = capacity;
        self
    }

    /// Stores journals under `root`.
    pub fn with_storage_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.storage_root = Some(root.into());
        self
    }

    /// Sets the document size limit.
    pub fn with_max_document_size(mut self, size: usize) -> Self {
        self.max_document_size = size;
        self
    }

    /// Sets the root folder identifier.
    pub fn with_root_dir_id(mut self, dir_id: impl Into<String>) -> Self {
        self.root_dir_id = dir_id.into();
        self
    }

    /// Enables or disables flushing after every append.
    pub fn with_sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], 4410)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.folder_cache_capacity, DEFAULT_FOLDER_CACHE_CAPACITY);
        assert!(config.storage_root.is_none());
        assert_eq!(config.bind_addr.port(), 4410);
        assert_eq!(config.root_dir_id, DEFAULT_ROOT_DIR_ID);
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new("0.0.0.0:9000".parse().unwrap())
            .with_folder_cache_capacity(8)
            .with_storage_root("/var/lib/mdir")
            .with_max_document_size(4096);

        assert_eq!(config.folder_cache_capacity, 8);
        assert_eq!(config.storage_root, Some(PathBuf::from("/var/lib/mdir")));
        assert_eq!(config.max_document_size, 4096);
    }
}
