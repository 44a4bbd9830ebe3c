//! Periodic liveness frames.
//!
//! Runs beside the reader loop and shares its write path, so a heartbeat
//! can be sent while a long command is still executing.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::protocol::Response;
use crate::session::Session;

/// Start the heartbeat loop on its own task.
pub fn spawn(session: Arc<Session>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(run(session, period))
}

/// Send `HEARTBEAT` every `period` while the session is active.
///
/// The first frame goes out one full period after start. A failed write
/// ends the loop; the session has already been moved to `Closing` by then.
pub async fn run(session: Arc<Session>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = session.cancellation().cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !session.is_active() {
            break;
        }

        match session.send(&Response::heartbeat()).await {
            Ok(()) => trace!("Sent HEARTBEAT"),
            Err(e) => {
                warn!(peer = session.peer(), error = %e, "Failed to send HEARTBEAT");
                break;
            }
        }
    }

    debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test(start_paused = true)]
    async fn test_first_heartbeat_after_one_period() {
        let (client, server) = tokio::io::duplex(256);
        let session = Arc::new(Session::new("test", client));
        session.activate();

        let start = Instant::now();
        let handle = spawn(Arc::clone(&session), Duration::from_secs(10));

        let mut lines = BufReader::new(server).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("HEARTBEAT"));
        assert!(start.elapsed() >= Duration::from_secs(10));

        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("HEARTBEAT"));
        assert!(start.elapsed() >= Duration::from_secs(20));

        session.begin_closing("test");
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_write_failure() {
        let (client, server) = tokio::io::duplex(256);
        drop(server);
        let session = Arc::new(Session::new("test", client));
        session.activate();

        spawn(Arc::clone(&session), Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_on_cancellation_without_sending() {
        let (client, server) = tokio::io::duplex(256);
        let session = Arc::new(Session::new("test", client));
        session.activate();

        let handle = spawn(Arc::clone(&session), Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(3)).await;
        session.shutdown().await;
        handle.await.unwrap();

        let mut lines = BufReader::new(server).lines();
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inactive_session_sends_nothing() {
        let (client, _server) = tokio::io::duplex(256);
        // Never activated
        let session = Arc::new(Session::new("test", client));

        spawn(Arc::clone(&session), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(session.state(), SessionState::Connecting);
    }
}
