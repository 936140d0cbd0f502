use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurfaceError {
    /// The browser window or tab is gone.
    #[error("automation surface closed")]
    Closed,
    /// Out-of-memory or type-loading class failures inside the page runtime.
    #[error("fatal runtime error: {0}")]
    Fatal(String),
    #[error("element not found: {0}")]
    NotFound(String),
    #[error("surface error: {0}")]
    Transient(String),
}

/// The single browser surface an agent drives. Implemented by the headless controller
/// and by the extension bridge; selectors come from the [`crate::SelectorCatalog`].
#[async_trait]
pub trait AutomationSurface: Send + Sync {
    async fn is_alive(&self) -> bool;
    async fn current_url(&self) -> Result<String, SurfaceError>;
    async fn navigate(&self, url: &str) -> Result<(), SurfaceError>;
    async fn reload(&self) -> Result<(), SurfaceError>;
    /// True when any of `selectors` matches a visible element.
    async fn probe(&self, selectors: &[String]) -> Result<bool, SurfaceError>;
    /// Replaces the content of the first matching input.
    async fn fill(&self, selectors: &[String], text: &str) -> Result<(), SurfaceError>;
    /// Clicks the first match. `Ok(false)` when nothing matched.
    async fn click(&self, selectors: &[String]) -> Result<bool, SurfaceError>;
    async fn press_enter(&self, selectors: &[String]) -> Result<(), SurfaceError>;
    /// Stores a screenshot or DOM dump and returns a reference to it.
    async fn capture_debug_artifact(&self, label: &str) -> Result<String, SurfaceError>;
}
