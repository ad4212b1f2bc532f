use crate::config::LoggingConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webrtc::peer_connection::RTCPeerConnection;

/// Sender tag used for entries the core writes itself
pub const SYSTEM_SENDER: &str = "System";

/// First line of every log, before anything has happened
pub const LOG_HEADER: &str = "[System] Starting...";

/// Installs the global tracing subscriber.
///
/// Does nothing when logging is disabled. `RUST_LOG` wins over the configured
/// level. Calling it twice is harmless, the second install is ignored.
pub fn init_tracing(config: &LoggingConfig) {
    if !config.enabled {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

/// Append-only user-visible log, one `[sender] text` entry per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBook {
    text: String,
}

impl LogBook {
    pub fn new() -> Self {
        Self {
            text: LOG_HEADER.to_string(),
        }
    }

    pub fn append(&mut self, sender: &str, text: &str) {
        self.text.push('\n');
        self.text.push('[');
        self.text.push_str(sender);
        self.text.push_str("] ");
        self.text.push_str(text);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.text.lines()
    }
}

impl Default for LogBook {
    fn default() -> Self {
        Self::new()
    }
}

/// Quick getStats snapshot of the nominated candidate pair
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, v) in stats.reports {
        if let webrtc::stats::StatsReportType::CandidatePair(pair) = v {
            if pair.nominated {
                tracing::debug!(
                    "STATS {moment}: {}:{}  type: {:?}  bytes={}/{} state={:?}",
                    pair.local_candidate_id,
                    pair.remote_candidate_id,
                    pair.stats_type,
                    pair.bytes_sent,
                    pair.bytes_received,
                    pair.state
                );
            }
        }
    }
}
