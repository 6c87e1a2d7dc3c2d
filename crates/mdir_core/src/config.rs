//! Journal configuration.

/// Default upper bound on an encoded document.
pub const DEFAULT_MAX_DOCUMENT_SIZE: usize = 1024 * 1024;

/// Configuration for opening folder journals.
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Whether to flush the log after every append.
    pub sync_on_append: bool,

    /// Largest encoded document accepted by `append`.
    pub max_document_size: usize,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            sync_on_append: true,
            max_document_size: DEFAULT_MAX_DOCUMENT_SIZE,
        }
    }
}

impl JournalConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to flush after every append.
    #[must_use]
    pub const fn with_sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }

    /// Sets the document size limit.
    #[must_use]
    pub const fn with_max_document_size(mut self, size: usize) -> Self {
        self.max_document_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = JournalConfig::default();
        assert!(config.sync_on_append);
        assert_eq!(config.max_document_size, 1024 * 1024);
    }

    #[test]
    fn builder_pattern() {
        let config = JournalConfig::new()
            .with_sync_on_append(false)
            .with_max_document_size(512);
        assert!(!config.sync_on_append);
        assert_eq!(config.max_document_size, 512);
    }
}
