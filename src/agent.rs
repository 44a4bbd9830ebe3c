//! Control connection management.
//!
//! Opens the TCP session, then drives it: the heartbeat loop runs on a
//! spawned task while the calling task reads frames, dispatches them one
//! at a time and writes the responses. Whatever ends the session (peer
//! close, read error, write error, interrupt) funnels into a single
//! `Session::shutdown`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::AgentError;
use crate::frame::FrameReader;
use crate::heartbeat;
use crate::session::Session;

/// An established control connection, not yet running.
pub struct Connection {
    session: Arc<Session>,
    reader: FrameReader<OwnedReadHalf>,
    peer: SocketAddr,
}

impl Connection {
    /// Connect to the configured endpoint.
    ///
    /// There is no retry: a failure here is reported to the caller as
    /// `Connect` or `ConnectTimeout`.
    pub async fn establish(config: &Config) -> Result<Self, AgentError> {
        let endpoint = config.endpoint();
        debug!(endpoint = %endpoint, "Connecting");

        let stream = match timeout(config.connect_timeout, TcpStream::connect(&endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(AgentError::Connect { endpoint, source }),
            Err(_) => {
                return Err(AgentError::ConnectTimeout {
                    endpoint,
                    timeout: config.connect_timeout,
                })
            }
        };

        let peer = configure_socket(&stream, config.tcp_keepalive)
            .and_then(|()| stream.peer_addr())
            .map_err(|source| AgentError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;

        info!(peer = %peer, "Connected");
        Ok(Self::from_stream(stream, peer, config.read_buffer_size))
    }

    fn from_stream(stream: TcpStream, peer: SocketAddr, read_buffer_size: usize) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            session: Arc::new(Session::new(peer.to_string(), writer)),
            reader: FrameReader::new(reader, read_buffer_size),
            peer,
        }
    }

    /// Handle to the session, e.g. for an interrupt handler.
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Run the session until it ends.
    ///
    /// Returns `Ok` for an orderly end (peer close, interrupt, write
    /// failure) and `Err(Read)` when the transport failed under the reader.
    pub async fn run(
        self,
        dispatcher: Dispatcher,
        heartbeat_interval: Duration,
    ) -> Result<(), AgentError> {
        let Connection {
            session,
            mut reader,
            peer,
        } = self;

        session.activate();
        info!(peer = %peer, heartbeat_interval = ?heartbeat_interval, "Session active");

        let heartbeat = heartbeat::spawn(Arc::clone(&session), heartbeat_interval);

        let result = read_loop(&session, &mut reader, &dispatcher).await;
        if let Err(e) = &result {
            error!(peer = %peer, error = %e, "Session failed");
        }

        session.shutdown().await;
        if let Err(e) = heartbeat.await {
            warn!(error = %e, "Heartbeat task did not finish cleanly");
        }

        result
    }
}

async fn read_loop(
    session: &Session,
    reader: &mut FrameReader<OwnedReadHalf>,
    dispatcher: &Dispatcher,
) -> Result<(), AgentError> {
    let cancel = session.cancellation();

    loop {
        if !session.is_active() {
            return Ok(());
        }

        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next_frame() => frame,
        };

        let line = match frame {
            Ok(Some(line)) => line,
            Ok(None) => {
                info!("Server closed connection");
                session.begin_closing("peer closed");
                return Ok(());
            }
            Err(e) => {
                session.begin_closing("read failed");
                return Err(e);
            }
        };

        debug!(command = %line, "Received command");

        // Dropping an in-flight handler kills its child process
        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            response = dispatcher.dispatch(&line) => response,
        };

        if let Some(response) = response {
            if let Err(e) = session.send(&response).await {
                warn!(error = %e, "Failed to send response");
            }
        }
    }
}

fn configure_socket(stream: &TcpStream, keepalive: Option<Duration>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    if let Some(idle) = keepalive {
        let socket = SockRef::from(stream);
        socket.set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::Handlers;
    use crate::session::SessionState;
    use std::path::Path;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::net::tcp::OwnedReadHalf as PeerReadHalf;
    use tokio::net::TcpListener;

    fn test_config(port: u16, download_dir: &Path, heartbeat: Duration) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: heartbeat,
            read_buffer_size: 16,
            handler_timeout: Duration::from_secs(5),
            download_dir: download_dir.to_path_buf(),
            tcp_keepalive: Some(Duration::from_secs(60)),
            log_level: "debug".to_string(),
        }
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Next line from the agent that is not a heartbeat.
    #[cfg(unix)]
    async fn next_reply(lines: &mut Lines<BufReader<PeerReadHalf>>) -> String {
        loop {
            let line = lines.next_line().await.unwrap().expect("agent hung up");
            if line != "HEARTBEAT" {
                return line;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_end_to_end_session() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(
            listener.local_addr().unwrap().port(),
            dir.path(),
            Duration::from_secs(3600),
        );

        let agent = tokio::spawn(async move {
            let connection = Connection::establish(&config).await.unwrap();
            let session = connection.session();
            let handlers = Arc::new(Handlers::from_config(&config).unwrap());
            let result = connection
                .run(Dispatcher::new(handlers), config.heartbeat_interval)
                .await;
            (result, session)
        });

        let (peer, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = peer.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half.write_all(b"PING\n").await.unwrap();
        assert_eq!(next_reply(&mut lines).await, "PONG");

        write_half.write_all(b"EXECUTE echo hi\n").await.unwrap();
        assert_eq!(next_reply(&mut lines).await, "EXECUTE_RESULT hi");

        // Multi-line output still arrives as a single frame
        write_half.write_all(b"EXECUTE printf 'a\\nb'\n").await.unwrap();
        write_half.write_all(b"PING\n").await.unwrap();
        assert_eq!(next_reply(&mut lines).await, "EXECUTE_RESULT a b");
        assert_eq!(next_reply(&mut lines).await, "PONG");

        let bad_url = format!("DOWNLOAD http://127.0.0.1:{}/x f.txt\n", unused_port());
        write_half.write_all(bad_url.as_bytes()).await.unwrap();
        assert_eq!(next_reply(&mut lines).await, "DOWNLOAD_FAIL f.txt");

        write_half.write_all(b"DOWNLOAD onlyone\n").await.unwrap();
        assert_eq!(next_reply(&mut lines).await, "DOWNLOAD_FAIL invalid_format");

        // Split across writes and followed by a blank line
        write_half.write_all(b"HEL").await.unwrap();
        write_half.write_all(b"LO\n\n").await.unwrap();
        assert_eq!(next_reply(&mut lines).await, "UNKNOWN_COMMAND HELLO");

        drop(write_half);

        let (result, session) = agent.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.shutdown().await);

        // Agent closed its side as well
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_heartbeats_share_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(
            listener.local_addr().unwrap().port(),
            dir.path(),
            Duration::from_millis(20),
        );

        let agent = tokio::spawn(async move {
            let connection = Connection::establish(&config).await.unwrap();
            let handlers = Arc::new(Handlers::from_config(&config).unwrap());
            connection
                .run(Dispatcher::new(handlers), config.heartbeat_interval)
                .await
        });

        let (peer, _) = listener.accept().await.unwrap();
        let (read_half, mut write_half) = peer.into_split();
        let mut lines = BufReader::new(read_half).lines();

        // A slow command keeps the reader busy while heartbeats continue
        write_half.write_all(b"EXECUTE sleep 0.2; echo done\n").await.unwrap();

        let mut heartbeats = 0;
        loop {
            let line = lines.next_line().await.unwrap().unwrap();
            match line.as_str() {
                "HEARTBEAT" => heartbeats += 1,
                "EXECUTE_RESULT done" => break,
                other => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(heartbeats >= 2);

        // Keep reading so late heartbeats land on an open socket
        drop(write_half);
        while let Some(line) = lines.next_line().await.unwrap() {
            assert_eq!(line, "HEARTBEAT");
        }
        assert!(agent.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connection_reset_fails_session() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(
            listener.local_addr().unwrap().port(),
            dir.path(),
            Duration::from_secs(3600),
        );

        let connection = Connection::establish(&config).await.unwrap();
        let session = connection.session();
        let handlers = Arc::new(Handlers::from_config(&config).unwrap());
        let agent = tokio::spawn(
            connection.run(Dispatcher::new(handlers), config.heartbeat_interval),
        );

        // Zero linger turns the close into a RST
        let (peer, _) = listener.accept().await.unwrap();
        SockRef::from(&peer).set_linger(Some(Duration::ZERO)).unwrap();
        drop(peer);

        assert!(matches!(
            agent.await.unwrap(),
            Err(AgentError::Read(_))
        ));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_interrupt_ends_session() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = test_config(
            listener.local_addr().unwrap().port(),
            dir.path(),
            Duration::from_secs(3600),
        );

        let connection = Connection::establish(&config).await.unwrap();
        let (_peer, _) = listener.accept().await.unwrap();
        let session = connection.session();
        let handlers = Arc::new(Handlers::from_config(&config).unwrap());

        let agent = tokio::spawn(
            connection.run(Dispatcher::new(handlers), config.heartbeat_interval),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        session.interrupt();

        assert!(agent.await.unwrap().is_ok());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(unused_port(), dir.path(), Duration::from_secs(10));

        match Connection::establish(&config).await {
            Err(AgentError::Connect { endpoint, .. }) => {
                assert_eq!(endpoint, config.endpoint());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }
}
