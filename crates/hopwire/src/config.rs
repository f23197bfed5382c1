//! Runtime configuration and the per-process context handed to the
//! exchange components.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ExchangeError;
use crate::identity::PeerId;
use crate::router::MessageChooser;
use crate::store::{AckStore, MessageStore};

/// Which exchange strategy sessions run with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterKind {
    /// Plain gossip without receipts.
    Simple,
    /// Gossip with delivery receipts.
    #[default]
    Acknowledging,
}

/// Tunables for the exchange core. All fields have working defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub router: RouterKind,

    /// How often discovery is restarted when it has gone quiet.
    #[serde(with = "duration_serde")]
    pub rediscovery_interval: Duration,

    /// Disconnect discovery-backed neighbors with no payload activity
    /// for this long.
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Address of the rendezvous server the periodic link dials.
    pub server_addr: String,

    /// Well-known id the rendezvous server exchanges under.
    pub server_id: String,

    /// How often the periodic server link opens a fresh session.
    #[serde(with = "duration_serde")]
    pub server_interval: Duration,

    /// When set, only messages with these service ids are forwarded.
    pub service_whitelist: Option<Vec<u8>>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            router: RouterKind::default(),
            rediscovery_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            server_addr: format!("127.0.0.1:{DEFAULT_SERVER_PORT}"),
            server_id: "rendezvous".to_string(),
            server_interval: Duration::from_secs(300),
            service_whitelist: None,
        }
    }
}

/// Port the rendezvous server listens on unless configured otherwise.
pub const DEFAULT_SERVER_PORT: u16 = 9099;

impl ExchangeConfig {
    /// Load the configuration from a JSON file, falling back to the
    /// defaults when the file is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(path = %path.display(), "ignoring malformed config: {e}");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }

    /// Write the configuration as pretty-printed JSON.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ExchangeError> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Everything a running exchange needs, constructed once per process and
/// shared by the watcher, the server link, and the rendezvous server.
pub struct ExchangeContext {
    pub own_id: PeerId,
    pub config: ExchangeConfig,
    pub messages: Arc<dyn MessageStore>,
    pub acks: Arc<dyn AckStore>,
}

impl ExchangeContext {
    pub fn new(
        own_id: PeerId,
        config: ExchangeConfig,
        messages: Arc<dyn MessageStore>,
        acks: Arc<dyn AckStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            own_id,
            config,
            messages,
            acks,
        })
    }

    /// A chooser wired to this context's stores and strategy.
    pub fn chooser(&self) -> MessageChooser {
        MessageChooser::new(
            self.config.router,
            self.messages.clone(),
            self.acks.clone(),
            self.config.service_whitelist.clone(),
        )
    }
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
