use std::{collections::HashMap, path::PathBuf, time::Duration};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::AgentError;

/// Page features the agent looks for. Which selectors realise each one is configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    /// Primary chat surface (conversation list, side pane).
    ChatReady,
    /// Progress bars and loading overlays.
    Loading,
    /// Authentication-required indicators specific enough to never show on a logged-in page.
    QrHighConfidence,
    OfflineBanner,
    InvalidRecipientDialog,
    MessageInput,
    SendButton,
    MarkerPending,
    MarkerSingle,
    MarkerDouble,
}

impl Indicator {
    pub const ALL: [Indicator; 10] = [
        Indicator::ChatReady,
        Indicator::Loading,
        Indicator::QrHighConfidence,
        Indicator::OfflineBanner,
        Indicator::InvalidRecipientDialog,
        Indicator::MessageInput,
        Indicator::SendButton,
        Indicator::MarkerPending,
        Indicator::MarkerSingle,
        Indicator::MarkerDouble,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Indicator::ChatReady => "chat_ready",
            Indicator::Loading => "loading",
            Indicator::QrHighConfidence => "qr_high_confidence",
            Indicator::OfflineBanner => "offline_banner",
            Indicator::InvalidRecipientDialog => "invalid_recipient_dialog",
            Indicator::MessageInput => "message_input",
            Indicator::SendButton => "send_button",
            Indicator::MarkerPending => "marker_pending",
            Indicator::MarkerSingle => "marker_single",
            Indicator::MarkerDouble => "marker_double",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorCatalog {
    /// Safe page to return to after a runtime fault.
    #[serde(default)]
    pub home_url: String,
    /// Conversation URL; `{recipient}` is replaced with the normalised identifier.
    #[serde(default)]
    pub chat_url_template: String,
    /// Substrings of the current location that mean the session was logged out.
    #[serde(default)]
    pub logout_url_markers: Vec<String>,
    #[serde(default)]
    pub selectors: HashMap<Indicator, Vec<String>>,
}

impl SelectorCatalog {
    pub fn selectors(&self, indicator: Indicator) -> &[String] {
        self.selectors
            .get(&indicator)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn chat_url(&self, recipient: &str) -> String {
        self.chat_url_template.replace("{recipient}", recipient)
    }

    pub fn is_logout_location(&self, url: &str) -> bool {
        self.logout_url_markers
            .iter()
            .any(|marker| !marker.is_empty() && url.contains(marker.as_str()))
    }

    fn missing(&self) -> Vec<Indicator> {
        Indicator::ALL
            .into_iter()
            .filter(|indicator| self.selectors(*indicator).is_empty())
            .collect()
    }

    /// One selector per indicator, named after the indicator.
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            home_url: "https://chat.test/".into(),
            chat_url_template: "https://chat.test/send?phone={recipient}".into(),
            logout_url_markers: vec!["/logout".into()],
            selectors: Indicator::ALL
                .into_iter()
                .map(|indicator| (indicator, vec![indicator.as_str().to_string()]))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryTimings {
    pub ready_timeout_ms: u64,
    pub ready_poll_interval_ms: u64,
    /// Longest a loading overlay is waited out before the attempt is abandoned.
    pub overlay_timeout_ms: u64,
    pub confirm_timeout_ms: u64,
    pub confirm_poll_interval_ms: u64,
    pub max_task_attempts: u32,
    pub retry_backoff_ms: u64,
}

impl Default for DeliveryTimings {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 30_000,
            ready_poll_interval_ms: 500,
            overlay_timeout_ms: 20_000,
            confirm_timeout_ms: 20_000,
            confirm_poll_interval_ms: 1_000,
            max_task_attempts: 3,
            retry_backoff_ms: 2_000,
        }
    }
}

impl DeliveryTimings {
    pub(crate) fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub(crate) fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms.max(10))
    }

    pub(crate) fn overlay_timeout(&self) -> Duration {
        Duration::from_millis(self.overlay_timeout_ms)
    }

    pub(crate) fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub(crate) fn confirm_poll(&self) -> Duration {
        Duration::from_millis(self.confirm_poll_interval_ms.max(10))
    }

    pub(crate) fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub manager_url: String,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Used until the manager advertises its own cadence with a lease grant.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_inter_command_delay_ms")]
    pub inter_command_delay_ms: u64,
    #[serde(default = "default_processed_capacity")]
    pub processed_capacity: usize,
    #[serde(default)]
    pub delivery: DeliveryTimings,
    #[serde(default)]
    pub catalog: SelectorCatalog,
}

impl AgentConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, AgentError> {
        let config: AgentConfig =
            toml::from_str(raw).map_err(|err| AgentError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &std::path::Path) -> Result<Self, AgentError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| AgentError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if !self.manager_url.starts_with("http://") && !self.manager_url.starts_with("https://") {
            return Err(AgentError::Config(format!(
                "manager_url must be http(s): {}",
                self.manager_url
            )));
        }
        if self.delivery.max_task_attempts == 0 {
            return Err(AgentError::Config("max_task_attempts must be at least 1".into()));
        }
        let missing = self.catalog.missing();
        if !missing.is_empty() {
            tracing::warn!(
                target: "courier.agent",
                missing = ?missing,
                "selector catalog is incomplete"
            );
        }
        Ok(())
    }

    /// Configured state path, else `state.toml` under the platform data directory.
    pub fn resolved_state_path(&self) -> Result<PathBuf, AgentError> {
        if let Some(path) = &self.state_path {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("", "", "courier-agent").ok_or_else(|| {
            AgentError::Config("unable to determine a data directory for agent state".into())
        })?;
        Ok(dirs.data_dir().join("state.toml"))
    }

    pub fn manager_base(&self) -> &str {
        self.manager_url.trim_end_matches('/')
    }

    pub(crate) fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1_000))
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(250))
    }

    pub(crate) fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms.max(250))
    }

    pub(crate) fn inter_command_delay(&self) -> Duration {
        Duration::from_millis(self.inter_command_delay_ms)
    }
}

fn default_device_name() -> String {
    "courier agent".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_status_interval_ms() -> u64 {
    2_000
}

fn default_inter_command_delay_ms() -> u64 {
    1_500
}

fn default_processed_capacity() -> usize {
    512
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_catalog_keyed_by_indicator() {
        let raw = r##"
            manager_url = "https://manager.example/"
            state_path = "/tmp/courier-agent.toml"

            [delivery]
            confirm_timeout_ms = 5000

            [catalog]
            chat_url_template = "https://chat.example/send?phone={recipient}"
            logout_url_markers = ["/logout"]

            [catalog.selectors]
            chat_ready = ["#side"]
            message_input = ["footer [contenteditable]"]
        "##;
        let config = AgentConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.manager_base(), "https://manager.example");
        assert_eq!(config.delivery.confirm_timeout_ms, 5000);
        assert_eq!(config.delivery.max_task_attempts, 3);
        assert_eq!(config.catalog.selectors(Indicator::ChatReady), ["#side"]);
        assert!(config.catalog.selectors(Indicator::Loading).is_empty());
        assert_eq!(
            config.catalog.chat_url("15551234567"),
            "https://chat.example/send?phone=15551234567"
        );
        assert!(config.catalog.is_logout_location("https://chat.example/logout?x=1"));
    }

    #[test]
    fn rejects_non_http_manager() {
        let err = AgentConfig::from_toml_str(r#"manager_url = "ftp://nope""#).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
