use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Upper bound on waiting for ICE gathering before sending what we have
pub const GATHER_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits for the gathering-complete promise, or gives up after `limit`.
pub async fn wait_for_gathering(gathered: &mut mpsc::Receiver<()>, limit: Duration) {
    if timeout(limit, gathered.recv()).await.is_err() {
        tracing::warn!(
            "ICE gathering not complete after {} s, sending partial candidates",
            limit.as_secs()
        );
    }
}

/// Candidate counts by type in one SDP
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

impl fmt::Display for CandidateSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host={} srflx={} relay={}",
            self.host, self.srflx, self.relay
        )
    }
}

/// Counts the `a=candidate` lines of an SDP by candidate type.
pub fn analyze_candidates(sdp: &str) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for line in sdp.lines().filter(|l| l.starts_with("a=candidate:")) {
        let mut fields = line.split_whitespace();
        let kind = fields
            .by_ref()
            .skip_while(|f| *f != "typ")
            .nth(1)
            .unwrap_or("");
        match kind {
            "host" => summary.host += 1,
            "srflx" | "prflx" => summary.srflx += 1,
            "relay" => summary.relay += 1,
            other => tracing::trace!("Unknown candidate type {:?}", other),
        }
    }

    if summary.host + summary.srflx + summary.relay == 0 {
        tracing::warn!("SDP carries no ICE candidates");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_are_counted_by_type() {
        let sdp = "v=0\r\n\
            a=candidate:1 1 udp 2130706431 192.168.1.2 50000 typ host\r\n\
            a=candidate:2 1 udp 1694498815 203.0.113.5 50001 typ srflx raddr 192.168.1.2 rport 50000\r\n\
            a=candidate:3 1 udp 16777215 198.51.100.9 3478 typ relay raddr 203.0.113.5 rport 50001\r\n\
            a=candidate:4 1 udp 2130706431 10.0.0.2 50002 typ host\r\n\
            a=end-of-candidates\r\n";

        assert_eq!(
            analyze_candidates(sdp),
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[tokio::test]
    async fn gathering_wait_returns_on_completion() {
        let (tx, mut rx) = mpsc::channel(1);
        drop(tx);
        // closed promise means gathering already finished
        wait_for_gathering(&mut rx, Duration::from_millis(10)).await;
    }
}
