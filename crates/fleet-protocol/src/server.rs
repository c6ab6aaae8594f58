//! Hub connection server.
//!
//! Accepts instance connections, performs the handshake, registers the
//! connection and routes inbound heartbeats and command results. Outbound
//! commands are written by a per-connection writer task fed from the
//! [`ConnectionHandle`] channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use certfleet_common::InstanceId;

use crate::correlation::CorrelationTable;
use crate::dispatcher::CommandDispatcher;
use crate::frame::{recv_message, send_message, spawn_writer, HubMessage};
use crate::protocol::{HandshakeAck, InstanceInfo, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
use crate::registry::{ConnectionHandle, ConnectionRegistry};
use crate::FleetProtocolError;

/// Outbound queue depth per connection.
const OUTBOUND_BUFFER: usize = 256;

/// Hub server settings.
#[derive(Debug, Clone)]
pub struct HubServerConfig {
    pub max_message_size: usize,
    /// Time allowed for the instance to send its first frame
    pub handshake_timeout: Duration,
}

impl Default for HubServerConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Accepts and serves instance connections.
#[derive(Debug, Clone)]
pub struct HubServer {
    dispatcher: CommandDispatcher,
    config: HubServerConfig,
}

impl HubServer {
    pub fn new(dispatcher: CommandDispatcher, config: HubServerConfig) -> Self {
        Self { dispatcher, config }
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }

    fn correlations(&self) -> &Arc<CorrelationTable> {
        self.dispatcher.correlations()
    }

    /// Accept connections until `shutdown` is cancelled.
    pub async fn run(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), FleetProtocolError> {
        info!(address = ?listener.local_addr().ok(), "Hub listening for instances");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Hub listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let server = self.clone();
                        let shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            debug!(peer = %peer, "Accepted connection");
                            if let Err(e) = server.serve_connection(stream, shutdown).await {
                                warn!(peer = %peer, error = %e, "Instance connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    /// Serve one instance connection until it closes.
    ///
    /// On return the connection is unregistered (unless a newer connection
    /// for the same instance replaced it) and its outstanding commands are
    /// abandoned.
    pub async fn serve_connection<S>(
        &self,
        stream: S,
        shutdown: CancellationToken,
    ) -> Result<(), FleetProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let max_size = self.config.max_message_size;
        let (mut reader, mut writer) = tokio::io::split(stream);

        let info = match self.handshake(&mut reader).await {
            Ok(info) => info,
            Err((e, reason)) => {
                if let Some(reason) = reason {
                    let ack = HubMessage::HandshakeAck(HandshakeAck {
                        accepted: false,
                        protocol_version: PROTOCOL_VERSION,
                        error: Some(reason),
                    });
                    let _ = send_message(&mut writer, &ack, max_size).await;
                }
                return Err(e);
            }
        };
        let instance_id = info.instance_id.clone();

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let handle = ConnectionHandle::new(tx, shutdown.clone());
        let connection_id = handle.connection_id();

        // Registered before the ack; commands queued meanwhile wait in the
        // channel until the writer starts.
        if let Some(previous) = self.registry().on_connect(info, handle) {
            // Commands sent over the old connection will never be answered.
            previous.close();
            self.correlations().abandon_connection(previous.connection_id());
        }

        let ack = HubMessage::HandshakeAck(HandshakeAck {
            accepted: true,
            protocol_version: PROTOCOL_VERSION,
            error: None,
        });
        let outcome = match send_message(&mut writer, &ack, max_size).await {
            Ok(()) => {
                let writer_task = spawn_writer(writer, rx, shutdown.clone(), max_size);
                let outcome = self.read_loop(&instance_id, &mut reader, &shutdown).await;
                shutdown.cancel();
                let _ = writer_task.await;
                outcome
            }
            Err(e) => Err(e),
        };

        shutdown.cancel();
        self.registry().on_connection_closed(&instance_id, connection_id);
        self.correlations().abandon_connection(connection_id);
        outcome
    }

    /// Read the first frame. On rejection, also returns the reason to send
    /// back to the instance.
    async fn handshake<R>(
        &self,
        reader: &mut R,
    ) -> Result<InstanceInfo, (FleetProtocolError, Option<String>)>
    where
        R: AsyncRead + Unpin,
    {
        let first = tokio::time::timeout(
            self.config.handshake_timeout,
            recv_message(reader, self.config.max_message_size),
        )
        .await
        .map_err(|_| {
            (
                FleetProtocolError::ConnectionFailed("Handshake timed out".to_string()),
                None,
            )
        })?
        .map_err(|e| (e, None))?;

        let info = match first {
            HubMessage::InstanceInfo(info) => info,
            other => {
                let reason = format!("Expected instance info, got {:?}", other.message_type());
                return Err((FleetProtocolError::InvalidMessage(reason.clone()), Some(reason)));
            }
        };

        if info.instance_id.as_str().trim().is_empty() {
            let reason = "Instance id must not be empty".to_string();
            return Err((FleetProtocolError::InvalidMessage(reason.clone()), Some(reason)));
        }

        if info.protocol_version != PROTOCOL_VERSION {
            let reason = format!(
                "Unsupported protocol version {} (hub speaks {})",
                info.protocol_version, PROTOCOL_VERSION
            );
            warn!(instance_id = %info.instance_id, "{}", reason);
            return Err((FleetProtocolError::ConnectionFailed(reason.clone()), Some(reason)));
        }

        debug!(
            instance_id = %info.instance_id,
            title = %info.title,
            client_version = %info.client_version,
            "Handshake received"
        );
        Ok(info)
    }

    async fn read_loop<R>(
        &self,
        instance_id: &InstanceId,
        reader: &mut R,
        shutdown: &CancellationToken,
    ) -> Result<(), FleetProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                message = recv_message(reader, self.config.max_message_size) => message,
            };

            match message {
                Ok(HubMessage::Heartbeat(heartbeat)) => {
                    trace!(instance_id = %instance_id, "Heartbeat");
                    self.registry().record_heartbeat(instance_id, heartbeat.summary);
                }
                Ok(HubMessage::CommandResult(result)) => {
                    trace!(instance_id = %instance_id, command_id = %result.command_id, "Command result");
                    self.correlations().resolve(result);
                }
                Ok(other) => {
                    warn!(
                        instance_id = %instance_id,
                        msg_type = ?other.message_type(),
                        "Unexpected message from instance"
                    );
                }
                Err(FleetProtocolError::ConnectionClosed) => {
                    debug!(instance_id = %instance_id, "Instance closed the connection");
                    return Ok(());
                }
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "Instance connection failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::protocol::{CommandArgs, CommandResult, CommandType, Heartbeat};
    use certfleet_common::{AuthContext, StatusSummary};
    use chrono::Utc;

    fn server() -> HubServer {
        let dispatcher = CommandDispatcher::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(CorrelationTable::new()),
            DispatcherConfig::default(),
        );
        HubServer::new(dispatcher, HubServerConfig::default())
    }

    #[tokio::test]
    async fn test_first_frame_must_be_instance_info() {
        let server = server();
        let (hub_side, mut instance_side) = tokio::io::duplex(4096);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(hub_side, CancellationToken::new()).await })
        };

        let heartbeat = HubMessage::Heartbeat(Heartbeat {
            instance_id: InstanceId::new("edge-01"),
            sent_at: Utc::now(),
            summary: None,
        });
        send_message(&mut instance_side, &heartbeat, MAX_MESSAGE_SIZE)
            .await
            .unwrap();

        match recv_message(&mut instance_side, MAX_MESSAGE_SIZE).await.unwrap() {
            HubMessage::HandshakeAck(ack) => {
                assert!(!ack.accepted);
                assert!(ack.error.is_some());
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(serving.await.unwrap().is_err());
        assert_eq!(server.registry().connected_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_lifecycle() {
        let server = server();
        let id = InstanceId::new("edge-01");
        let (hub_side, mut instance_side) = tokio::io::duplex(4096);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(hub_side, CancellationToken::new()).await })
        };

        let hello = HubMessage::InstanceInfo(InstanceInfo::new(id.clone()).with_title("Edge"));
        send_message(&mut instance_side, &hello, MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert!(matches!(
            recv_message(&mut instance_side, MAX_MESSAGE_SIZE).await.unwrap(),
            HubMessage::HandshakeAck(HandshakeAck { accepted: true, .. })
        ));
        assert!(server.registry().is_connected(&id));

        let heartbeat = HubMessage::Heartbeat(Heartbeat {
            instance_id: id.clone(),
            sent_at: Utc::now(),
            summary: Some(StatusSummary {
                total: 4,
                ..Default::default()
            }),
        });
        send_message(&mut instance_side, &heartbeat, MAX_MESSAGE_SIZE)
            .await
            .unwrap();

        // A result nobody waits for is dropped without closing the connection.
        let stray = HubMessage::CommandResult(CommandResult::empty(certfleet_common::CommandId::new()));
        send_message(&mut instance_side, &stray, MAX_MESSAGE_SIZE)
            .await
            .unwrap();

        let connection_id = server.registry().lookup(&id).unwrap().connection_id();
        let pending = server
            .correlations()
            .register(certfleet_common::CommandId::new(), &id, connection_id)
            .unwrap();

        drop(instance_side);
        serving.await.unwrap().unwrap();

        assert!(!server.registry().is_connected(&id));
        assert!(matches!(
            server
                .correlations()
                .await_result(pending, Duration::from_secs(5))
                .await,
            Err(FleetProtocolError::AgentDisconnected(_))
        ));
        let snapshot = server.registry().snapshot(&id).unwrap();
        assert!(!snapshot.connected);
        assert_eq!(snapshot.summary.unwrap().total, 4);
    }

    async fn handshake_as(
        server: &HubServer,
        id: &InstanceId,
    ) -> (
        tokio::io::DuplexStream,
        tokio::task::JoinHandle<Result<(), FleetProtocolError>>,
    ) {
        let (hub_side, mut instance_side) = tokio::io::duplex(4096);
        let serving = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(hub_side, CancellationToken::new()).await })
        };
        let hello = HubMessage::InstanceInfo(InstanceInfo::new(id.clone()));
        send_message(&mut instance_side, &hello, MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        assert!(matches!(
            recv_message(&mut instance_side, MAX_MESSAGE_SIZE).await.unwrap(),
            HubMessage::HandshakeAck(HandshakeAck { accepted: true, .. })
        ));
        (instance_side, serving)
    }

    async fn next_request(instance_side: &mut tokio::io::DuplexStream) -> certfleet_common::CommandId {
        match recv_message(instance_side, MAX_MESSAGE_SIZE).await.unwrap() {
            HubMessage::CommandRequest(envelope) => envelope.command_id,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_takeover_keeps_commands_on_new_connection() {
        let server = server();
        let id = InstanceId::new("edge-01");
        let send = |server: &HubServer| {
            let server = server.clone();
            let id = id.clone();
            tokio::spawn(async move {
                server
                    .dispatcher()
                    .send(
                        &id,
                        CommandType::Other("Ping".to_string()),
                        CommandArgs::new(),
                        &AuthContext::system(),
                    )
                    .await
            })
        };

        let (mut first_side, first_serving) = handshake_as(&server, &id).await;
        let orphaned = send(&server);
        next_request(&mut first_side).await;

        let (mut second_side, _second_serving) = handshake_as(&server, &id).await;
        assert!(matches!(
            orphaned.await.unwrap(),
            Err(FleetProtocolError::AgentDisconnected(_))
        ));

        let live = send(&server);
        let command_id = next_request(&mut second_side).await;

        // Cleanup of the replaced connection must not touch the new one.
        first_serving.await.unwrap().unwrap();
        assert!(server.registry().is_connected(&id));
        assert_eq!(server.correlations().pending_for(&id), 1);

        let reply = HubMessage::CommandResult(CommandResult {
            payload: Some("\"pong\"".to_string()),
            ..CommandResult::empty(command_id)
        });
        send_message(&mut second_side, &reply, MAX_MESSAGE_SIZE)
            .await
            .unwrap();
        let result = live.await.unwrap().unwrap();
        assert_eq!(result.decode::<String>().unwrap(), Some("pong".to_string()));
    }
}
