//! MQTT 3.1.1 broker over TCP.
//!
//! Each `MqttConnection` owns one `rumqttc` client and its event loop. The
//! event loop is polled inline while the connection only publishes. Once a
//! subscription is acknowledged it moves onto a driver task that forwards
//! incoming publishes to the subscription channel until it is cancelled or
//! the network fails.
//!
//! ```text
//!  connect ──poll──► ConnAck
//!  publish ──poll──► PubAck                  (no driver)
//!  subscribe ─poll─► SubAck ──spawn──► driver: poll ─► Publish ─► mpsc
//!  disconnect ─────► cancel driver ─► DISCONNECT ─► wait Outgoing::Disconnect
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Broker, BrokerConnection, BrokerMessage, MessageReceiver};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::validation::{validate_topic_filter, validate_topic_name};

/// Capacity of the request queue between `AsyncClient` and `EventLoop`.
const REQUEST_CHANNEL_CAPACITY: usize = 16;

/// Largest packet the MQTT remaining-length field can frame.
const MQTT_MAX_PACKET_SIZE: usize = 268_435_455;

/// JSON escapes a control character as `\u00XX`.
const JSON_ESCAPE_FACTOR: usize = 6;

/// Envelope keys and timestamp plus the PUBLISH fixed header and packet id.
const PACKET_OVERHEAD: usize = 512;

/// Extra time the driver gets on top of the operation timeout to finish its
/// own disconnect before it is aborted.
const DRIVER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Connection factory for an MQTT broker at `host:port`.
#[derive(Debug, Clone)]
pub struct MqttBroker {
    host: String,
    port: u16,
    client_id_prefix: String,
    keep_alive: Duration,
    connect_timeout: Duration,
    operation_timeout: Duration,
    max_packet_size: usize,
}

impl MqttBroker {
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.mqtt_host.clone(),
            port: config.mqtt_port,
            client_id_prefix: config.mqtt_client_id_prefix.clone(),
            keep_alive: config.mqtt_keep_alive,
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout,
            max_packet_size: packet_size_limit(config),
        }
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Options for a fresh clean session with a unique client id.
    fn options(&self) -> MqttOptions {
        let client_id = format!("{}-{}", self.client_id_prefix, Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_max_packet_size(self.max_packet_size, self.max_packet_size);
        options
    }
}

/// Packet size that fits the largest message the relay accepts, once it is
/// wrapped in the JSON envelope and a PUBLISH packet.
///
/// Applied to both directions, so messages of that size from other
/// publishers do not tear down subscriptions either.
pub fn packet_size_limit(config: &Config) -> usize {
    let source = config.message_source.len().max(config.publisher_source.len());
    let topic = config.relay_topic.len().max(config.consumer_topic.len());

    config
        .max_message_length
        .saturating_add(source)
        .saturating_mul(JSON_ESCAPE_FACTOR)
        .saturating_add(topic)
        .saturating_add(PACKET_OVERHEAD)
        .min(MQTT_MAX_PACKET_SIZE)
}

#[async_trait]
impl Broker for MqttBroker {
    fn kind(&self) -> &'static str {
        "mqtt"
    }

    async fn connect(&self) -> AppResult<Box<dyn BrokerConnection>> {
        let options = self.options();
        let client_id = options.client_id();
        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return if matches!(ack.code, ConnectReturnCode::Success) {
                            Ok(())
                        } else {
                            Err(format!("connection refused: {:?}", ack.code))
                        };
                    }
                    Ok(_) => {}
                    Err(e) => return Err(e.to_string()),
                }
            }
        };

        match timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {
                debug!(broker = %self.addr(), client_id = %client_id, "MQTT connection established");
                Ok(Box::new(MqttConnection {
                    client,
                    eventloop: Some(eventloop),
                    driver: None,
                    operation_timeout: self.operation_timeout,
                    client_id,
                }))
            }
            Ok(Err(reason)) => Err(AppError::ConnectionFailed(format!(
                "{}: {reason}",
                self.addr()
            ))),
            Err(_) => Err(AppError::ConnectionFailed(format!(
                "{}: no CONNACK within {:?}",
                self.addr(),
                self.connect_timeout
            ))),
        }
    }
}

struct Driver {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

struct MqttConnection {
    client: AsyncClient,
    /// `None` once a driver task owns the event loop
    eventloop: Option<EventLoop>,
    driver: Option<Driver>,
    operation_timeout: Duration,
    client_id: String,
}

#[async_trait]
impl BrokerConnection for MqttConnection {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> AppResult<()> {
        validate_topic_name(topic)?;

        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| AppError::PublishFailed(e.to_string()))?;

        // With a driver running the acknowledgement is consumed there.
        let Some(eventloop) = self.eventloop.as_mut() else {
            return Ok(());
        };

        let acknowledged = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        };

        match timeout(self.operation_timeout, acknowledged).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(AppError::PublishFailed(e.to_string())),
            Err(_) => Err(AppError::OperationTimeout(format!(
                "no PUBACK for '{topic}' within {:?}",
                self.operation_timeout
            ))),
        }
    }

    async fn subscribe(&mut self, filter: &str) -> AppResult<MessageReceiver> {
        validate_topic_filter(filter)?;

        let mut eventloop = self.eventloop.take().ok_or_else(|| {
            AppError::StreamSetup("connection already has an active subscription".to_string())
        })?;
        let (sender, receiver) = mpsc::unbounded_channel();

        if let Err(e) = await_subscription(
            &self.client,
            &mut eventloop,
            filter,
            &sender,
            self.operation_timeout,
        )
        .await
        {
            self.eventloop = Some(eventloop);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(drive(
            self.client.clone(),
            eventloop,
            sender,
            cancel.clone(),
            self.operation_timeout,
        ));
        self.driver = Some(Driver { handle, cancel });
        info!(client_id = %self.client_id, filter, "MQTT subscription active");

        Ok(receiver)
    }

    async fn disconnect(mut self: Box<Self>) -> AppResult<()> {
        if let Some(Driver { mut handle, cancel }) = self.driver.take() {
            cancel.cancel();
            return match timeout(self.operation_timeout + DRIVER_SHUTDOWN_GRACE, &mut handle).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(AppError::Internal(format!("MQTT driver task failed: {e}"))),
                Err(_) => {
                    handle.abort();
                    Err(AppError::OperationTimeout(
                        "MQTT driver did not stop in time".to_string(),
                    ))
                }
            };
        }

        match self.eventloop.take() {
            Some(mut eventloop) => {
                close(&self.client, &mut eventloop, self.operation_timeout).await
            }
            None => Ok(()),
        }
    }
}

impl Drop for MqttConnection {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.cancel.cancel();
        }
    }
}

/// Send SUBSCRIBE and poll until the SUBACK arrives. Publishes that overtake
/// the acknowledgement are already forwarded to `sender`.
async fn await_subscription(
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    filter: &str,
    sender: &mpsc::UnboundedSender<BrokerMessage>,
    limit: Duration,
) -> AppResult<()> {
    client
        .subscribe(filter, QoS::AtLeastOnce)
        .await
        .map_err(|e| AppError::StreamSetup(e.to_string()))?;

    let acknowledged = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let rejected = ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    return if rejected {
                        Err(AppError::StreamSetup(format!(
                            "broker rejected subscription to '{filter}'"
                        )))
                    } else {
                        Ok(())
                    };
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    // Receiver is still held by the caller, send cannot fail.
                    let _ = sender.send(BrokerMessage::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(_) => {}
                Err(e) => return Err(AppError::StreamSetup(e.to_string())),
            }
        }
    };

    timeout(limit, acknowledged).await.map_err(|_| {
        AppError::StreamSetup(format!("no SUBACK for '{filter}' within {limit:?}"))
    })?
}

/// Poll the event loop on behalf of a subscription.
async fn drive(
    client: AsyncClient,
    mut eventloop: EventLoop,
    sender: mpsc::UnboundedSender<BrokerMessage>,
    cancel: CancellationToken,
    disconnect_timeout: Duration,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BrokerMessage::new(publish.topic, publish.payload.to_vec());
                    if sender.send(message).is_err() {
                        debug!("Subscription receiver dropped, stopping MQTT driver");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "MQTT connection lost, ending subscription");
                    return;
                }
            }
        }
    }

    drop(sender);
    if let Err(e) = close(&client, &mut eventloop, disconnect_timeout).await {
        warn!(error = %e, "MQTT disconnect after subscription failed");
    }
}

/// Send DISCONNECT and poll until it has been written.
async fn close(client: &AsyncClient, eventloop: &mut EventLoop, limit: Duration) -> AppResult<()> {
    client
        .disconnect()
        .await
        .map_err(|e| AppError::Disconnected(e.to_string()))?;

    let flushed = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    };

    match timeout(limit, flushed).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(AppError::Disconnected(e.to_string())),
        Err(_) => Err(AppError::OperationTimeout(format!(
            "DISCONNECT not written within {limit:?}"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::RelayMessage;
    use crate::validation::validate_message_text;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn broker_on(port: u16) -> MqttBroker {
        MqttBroker::from_config(&Config {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: port,
            connect_timeout: Duration::from_secs(2),
            ..Config::default()
        })
    }

    #[test]
    fn test_client_ids_are_unique_and_prefixed() {
        let broker = broker_on(1883);
        let first = broker.options().client_id();
        let second = broker.options().client_id();

        assert!(first.starts_with("mqtt-relay-"));
        assert_ne!(first, second);
    }

    #[test]
    fn test_packet_limit_covers_largest_message() {
        let config = Config::default();
        let broker = MqttBroker::from_config(&config);

        let text = "\u{1}".repeat(config.max_message_length);
        let payload = RelayMessage::new(text, config.publisher_source.clone())
            .to_payload()
            .unwrap();
        let packet = payload.len() + config.consumer_topic.len() + 9;

        assert!(broker.options().max_packet_size() >= packet);
        assert!(broker.options().max_packet_size() > config.max_message_length);
    }

    #[test]
    fn test_packet_limit_is_capped_by_protocol() {
        let config = Config {
            max_message_length: usize::MAX,
            ..Config::default()
        };
        assert_eq!(packet_size_limit(&config), MQTT_MAX_PACKET_SIZE);
    }

    /// Read one MQTT packet as (first header byte, body).
    async fn read_packet(socket: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = socket.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = socket.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        socket.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accept one client, acknowledge its CONNECT and first PUBLISH, and
    /// return the size of the published payload.
    async fn acking_server(listener: TcpListener) -> usize {
        let (mut socket, _) = listener.accept().await.unwrap();

        let (header, _) = read_packet(&mut socket).await.unwrap();
        assert_eq!(header, 0x10, "expected CONNECT");
        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let (header, body) = read_packet(&mut socket).await.unwrap();
        assert_eq!(header & 0xf0, 0x30, "expected PUBLISH");
        let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
        let pkid = &body[2 + topic_len..4 + topic_len];
        socket
            .write_all(&[0x40, 0x02, pkid[0], pkid[1]])
            .await
            .unwrap();

        // Keep the socket open until the client hangs up.
        while read_packet(&mut socket).await.is_ok() {}

        body.len() - topic_len - 4
    }

    #[tokio::test]
    async fn test_publishes_message_at_length_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(acking_server(listener));

        let broker = broker_on(port);
        let limit = Config::default().max_message_length;
        let text = "x".repeat(limit);
        validate_message_text(&text, limit).unwrap();
        let payload = RelayMessage::new(text, "mqtt-relay").to_payload().unwrap();
        let expected = payload.len();

        let mut connection = broker.connect().await.unwrap();
        connection.publish("demo/messages", payload).await.unwrap();
        connection.disconnect().await.unwrap();

        assert_eq!(server.await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_connect_refused_maps_to_connection_failed() {
        // Bind then drop a listener to get a port nobody is listening on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = broker_on(port).connect().await.err().unwrap();
        assert!(matches!(err, AppError::ConnectionFailed(_)));
        assert!(err.is_broker_unavailable());
    }

    #[tokio::test]
    async fn test_silent_server_times_out_as_connection_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let broker = MqttBroker {
            connect_timeout: Duration::from_millis(200),
            ..broker_on(port)
        };
        let err = broker.connect().await.err().unwrap();
        assert!(matches!(err, AppError::ConnectionFailed(msg) if msg.contains("no CONNACK")));
        accept.abort();
    }
}
