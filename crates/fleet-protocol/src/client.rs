//! Instance-side hub client.
//!
//! Keeps one outbound connection to the hub: handshake, periodic heartbeats
//! and concurrent command execution. Each inbound command runs in its own
//! task; results are written back through a shared writer task in
//! completion order.

use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::executor::AgentCommandExecutor;
use crate::frame::{recv_message, send_message, spawn_writer, HubMessage};
use crate::protocol::{CommandEnvelope, CommandResult, Heartbeat, InstanceInfo, MAX_MESSAGE_SIZE};
use crate::FleetProtocolError;

const OUTBOUND_BUFFER: usize = 256;

/// Hub client settings.
#[derive(Debug, Clone)]
pub struct HubClientConfig {
    /// `host:port` of the hub
    pub hub_address: String,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub max_message_size: usize,
}

impl Default for HubClientConfig {
    fn default() -> Self {
        Self {
            hub_address: "127.0.0.1:7800".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(5),
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Local shutdown was requested
    Shutdown,
    /// The hub sent a `Reconnect` command
    ReconnectRequested,
    /// The hub closed the connection
    Closed,
}

/// Connection from an instance to its hub.
#[derive(Debug, Clone)]
pub struct HubClient {
    info: InstanceInfo,
    executor: AgentCommandExecutor,
    config: HubClientConfig,
}

impl HubClient {
    pub fn new(info: InstanceInfo, executor: AgentCommandExecutor, config: HubClientConfig) -> Self {
        Self {
            info,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &HubClientConfig {
        &self.config
    }

    /// Connect, serve, and reconnect until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), FleetProtocolError> {
        loop {
            let session = match TcpStream::connect(&self.config.hub_address).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(error = %e, "Failed to set TCP_NODELAY");
                    }
                    info!(
                        instance_id = %self.info.instance_id,
                        hub = %self.config.hub_address,
                        "Connected to hub"
                    );
                    self.run_session(stream, shutdown.child_token()).await
                }
                Err(e) => Err(FleetProtocolError::ConnectionFailed(format!(
                    "{}: {}",
                    self.config.hub_address, e
                ))),
            };

            match session {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(end) => info!(instance_id = %self.info.instance_id, reason = ?end, "Hub session ended"),
                Err(e) => warn!(instance_id = %self.info.instance_id, error = %e, "Hub session failed"),
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }

            debug!(delay = ?self.config.reconnect_interval, "Reconnecting to hub");
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    /// Serve one established connection.
    pub async fn run_session<S>(
        &self,
        stream: S,
        shutdown: CancellationToken,
    ) -> Result<SessionEnd, FleetProtocolError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let max_size = self.config.max_message_size;
        let (mut reader, mut writer) = tokio::io::split(stream);

        send_message(&mut writer, &HubMessage::InstanceInfo(self.info.clone()), max_size).await?;
        match recv_message(&mut reader, max_size).await? {
            HubMessage::HandshakeAck(ack) if ack.accepted => {
                debug!(instance_id = %self.info.instance_id, protocol_version = ack.protocol_version, "Handshake accepted");
            }
            HubMessage::HandshakeAck(ack) => {
                let reason = ack.error.unwrap_or_else(|| "no reason given".to_string());
                error!(instance_id = %self.info.instance_id, reason = %reason, "Hub rejected handshake");
                return Err(FleetProtocolError::ConnectionFailed(reason));
            }
            other => {
                return Err(FleetProtocolError::InvalidMessage(format!(
                    "Expected handshake ack, got {:?}",
                    other.message_type()
                )));
            }
        }

        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let writer_task = spawn_writer(writer, rx, shutdown.clone(), max_size);

        // Frames are read in their own task; a read future dropped by the
        // select below would lose a partially read frame.
        let (inbound_tx, mut inbound) = mpsc::channel(OUTBOUND_BUFFER);
        let reader_task = tokio::spawn(async move {
            loop {
                let message = recv_message(&mut reader, max_size).await;
                let failed = message.is_err();
                if inbound_tx.send(message).await.is_err() || failed {
                    break;
                }
            }
        });
        let reconnect = self.executor.reconnect_signal();

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(SessionEnd::Shutdown),
                _ = reconnect.notified() => break Ok(SessionEnd::ReconnectRequested),
                _ = heartbeat.tick() => {
                    let message = HubMessage::Heartbeat(Heartbeat {
                        instance_id: self.info.instance_id.clone(),
                        sent_at: Utc::now(),
                        summary: self.executor.heartbeat_summary().await,
                    });
                    if tx.send(message).await.is_err() {
                        break Err(FleetProtocolError::ConnectionClosed);
                    }
                    trace!(instance_id = %self.info.instance_id, "Heartbeat sent");
                }
                message = inbound.recv() => match message {
                    Some(Ok(HubMessage::CommandRequest(envelope))) => {
                        self.spawn_command(envelope, tx.clone());
                    }
                    Some(Ok(other)) => {
                        warn!(msg_type = ?other.message_type(), "Unexpected message from hub");
                    }
                    Some(Err(FleetProtocolError::ConnectionClosed)) | None => break Ok(SessionEnd::Closed),
                    Some(Err(e)) => break Err(e),
                }
            }
        };

        shutdown.cancel();
        reader_task.abort();
        let _ = writer_task.await;
        outcome
    }

    fn spawn_command(&self, envelope: CommandEnvelope, tx: mpsc::Sender<HubMessage>) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let command_id = envelope.command_id;
            let command_type = envelope.command_type.clone();
            // Inner task so a panicking handler still produces a result.
            let result = match tokio::spawn(async move { executor.handle(envelope).await }).await {
                Ok(result) => result,
                Err(e) => {
                    error!(command_id = %command_id, command_type = %command_type, error = %e, "Command handler aborted");
                    CommandResult {
                        error: Some(format!("Command handler aborted: {}", e)),
                        ..CommandResult::empty(command_id)
                    }
                }
            };
            if tx.send(HubMessage::CommandResult(result)).await.is_err() {
                debug!(command_id = %command_id, "Connection closed before result was sent");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InstanceHandler;
    use crate::protocol::{CommandArgs, CommandType, HandshakeAck, PROTOCOL_VERSION};
    use async_trait::async_trait;
    use certfleet_common::{InstanceId, StatusSummary};
    use std::sync::Arc;

    struct Slow;

    #[async_trait]
    impl InstanceHandler for Slow {
        async fn get_status_summary(&self) -> anyhow::Result<StatusSummary> {
            Ok(StatusSummary {
                total: 1,
                ..Default::default()
            })
        }

        async fn remove_managed_item(&self, id: &str) -> anyhow::Result<bool> {
            if id == "slow" {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(true)
        }
    }

    fn client() -> HubClient {
        let id = InstanceId::new("edge-01");
        HubClient::new(
            InstanceInfo::new(id.clone()),
            AgentCommandExecutor::new(id, Arc::new(Slow)),
            HubClientConfig {
                heartbeat_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
    }

    async fn accept(hub: &mut tokio::io::DuplexStream) {
        match recv_message(hub, MAX_MESSAGE_SIZE).await.unwrap() {
            HubMessage::InstanceInfo(info) => assert_eq!(info.instance_id.as_str(), "edge-01"),
            other => panic!("unexpected: {:?}", other),
        }
        let ack = HubMessage::HandshakeAck(HandshakeAck {
            accepted: true,
            protocol_version: PROTOCOL_VERSION,
            error: None,
        });
        send_message(hub, &ack, MAX_MESSAGE_SIZE).await.unwrap();
    }

    async fn next_result(hub: &mut tokio::io::DuplexStream) -> CommandResult {
        loop {
            match recv_message(hub, MAX_MESSAGE_SIZE).await.unwrap() {
                HubMessage::CommandResult(result) => return result,
                HubMessage::Heartbeat(_) => continue,
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_rejected_handshake() {
        let (instance_side, mut hub) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            client().run_session(instance_side, CancellationToken::new()).await
        });

        let _ = recv_message(&mut hub, MAX_MESSAGE_SIZE).await.unwrap();
        let nack = HubMessage::HandshakeAck(HandshakeAck {
            accepted: false,
            protocol_version: PROTOCOL_VERSION,
            error: Some("not welcome".into()),
        });
        send_message(&mut hub, &nack, MAX_MESSAGE_SIZE).await.unwrap();

        match session.await.unwrap() {
            Err(FleetProtocolError::ConnectionFailed(reason)) => assert_eq!(reason, "not welcome"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_command_does_not_block_others() {
        let (instance_side, mut hub) = tokio::io::duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let session = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client().run_session(instance_side, shutdown).await })
        };
        accept(&mut hub).await;

        let slow = CommandEnvelope::new(
            CommandType::RemoveManagedItem,
            &CommandArgs::new().with("managedCertId", "slow"),
        )
        .unwrap();
        let fast = CommandEnvelope::new(CommandType::GetStatusSummary, &CommandArgs::new()).unwrap();

        for envelope in [&slow, &fast] {
            send_message(&mut hub, &HubMessage::CommandRequest(envelope.clone()), MAX_MESSAGE_SIZE)
                .await
                .unwrap();
        }

        let first = next_result(&mut hub).await;
        let second = next_result(&mut hub).await;
        assert_eq!(first.command_id, fast.command_id);
        assert_eq!(second.command_id, slow.command_id);

        shutdown.cancel();
        assert_eq!(session.await.unwrap().unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn test_reconnect_command_ends_session() {
        let (instance_side, mut hub) = tokio::io::duplex(4096);
        let session = tokio::spawn(async move {
            client().run_session(instance_side, CancellationToken::new()).await
        });
        accept(&mut hub).await;

        let reconnect = CommandEnvelope::new(CommandType::Reconnect, &CommandArgs::new()).unwrap();
        send_message(&mut hub, &HubMessage::CommandRequest(reconnect), MAX_MESSAGE_SIZE)
            .await
            .unwrap();

        assert_eq!(
            session.await.unwrap().unwrap(),
            SessionEnd::ReconnectRequested
        );
    }
}
