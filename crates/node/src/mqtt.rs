//! Broker seam and the rumqttc-backed implementation.
//!
//! Delivery is pull-based: nothing is read from the broker unless the caller
//! asks for it.  [`MqttLink`] drives the rumqttc event loop itself, only for
//! as long as one request (connect, publish, subscribe, poll) needs it.

use std::collections::VecDeque;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use thiserror::Error;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::MqttSettings;

/// Request channel capacity between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 10;

/// Upper bound for a connect/publish/subscribe round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a non-blocking inbound check may drive the event loop.
const POLL_WINDOW: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Subscribed,
}

#[derive(Debug, Error)]
pub enum NetworkFault {
    #[error("not connected to broker")]
    NotConnected,
    #[error("broker connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),
    #[error("mqtt request rejected: {0}")]
    Request(#[from] rumqttc::ClientError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// The four primitives the node needs from a pub/sub client.
#[allow(async_fn_in_trait)]
pub trait Broker {
    async fn connect(&mut self) -> Result<(), NetworkFault>;
    async fn publish(&mut self, topic: &str, payload: &[u8], retain: bool)
        -> Result<(), NetworkFault>;
    async fn subscribe(&mut self, topic: &str) -> Result<(), NetworkFault>;
    /// Non-blocking check for one pending inbound message.
    async fn poll_message(&mut self) -> Result<Option<InboundMessage>, NetworkFault>;
    fn state(&self) -> ConnectionState;
}

// ---------------------------------------------------------------------------
// rumqttc link
// ---------------------------------------------------------------------------

pub struct MqttLink {
    options: MqttOptions,
    client: AsyncClient,
    eventloop: EventLoop,
    inbound: VecDeque<InboundMessage>,
    state: ConnectionState,
}

impl MqttLink {
    pub fn new(settings: &MqttSettings) -> Self {
        let mut options =
            MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_sec));
        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }

        let (client, eventloop) = AsyncClient::new(options.clone(), REQUEST_CAPACITY);
        Self {
            options,
            client,
            eventloop,
            inbound: VecDeque::new(),
            state: ConnectionState::Disconnected,
        }
    }

    /// Poll the event loop until `done` matches an event, queueing any
    /// inbound publishes seen on the way.
    async fn drive_until(
        &mut self,
        what: &'static str,
        done: impl Fn(&Event) -> bool,
    ) -> Result<(), NetworkFault> {
        let deadline = Instant::now() + REQUEST_TIMEOUT;
        loop {
            let event = match timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(NetworkFault::Timeout(what));
                }
                Ok(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e.into());
                }
                Ok(Ok(event)) => event,
            };
            self.stash_inbound(&event);
            if done(&event) {
                return Ok(());
            }
        }
    }

    fn stash_inbound(&mut self, event: &Event) {
        if let Event::Incoming(Packet::Publish(p)) = event {
            self.inbound.push_back(InboundMessage {
                topic: p.topic.clone(),
                payload: p.payload.to_vec(),
            });
        }
    }

    fn ensure_connected(&self) -> Result<(), NetworkFault> {
        match self.state {
            ConnectionState::Disconnected => Err(NetworkFault::NotConnected),
            _ => Ok(()),
        }
    }
}

impl Broker for MqttLink {
    async fn connect(&mut self) -> Result<(), NetworkFault> {
        // A fresh client/event-loop pair drops any half-open session state.
        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
        self.client = client;
        self.eventloop = eventloop;
        self.inbound.clear();
        self.state = ConnectionState::Disconnected;

        self.drive_until("connack", |e| {
            matches!(e, Event::Incoming(Packet::ConnAck(_)))
        })
        .await?;

        self.state = ConnectionState::Connected;
        tracing::info!(
            broker = %self.options.broker_address().0,
            port = self.options.broker_address().1,
            "mqtt connected"
        );
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        retain: bool,
    ) -> Result<(), NetworkFault> {
        self.ensure_connected()?;
        self.client
            .publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .await?;
        self.drive_until("publish", |e| {
            matches!(e, Event::Outgoing(Outgoing::Publish(_)))
        })
        .await?;
        tracing::debug!(topic, len = payload.len(), retain, "published");
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), NetworkFault> {
        self.ensure_connected()?;
        self.client.subscribe(topic, QoS::AtLeastOnce).await?;
        self.drive_until("suback", |e| matches!(e, Event::Incoming(Packet::SubAck(_))))
            .await?;
        self.state = ConnectionState::Subscribed;
        tracing::info!(topic, "subscribed");
        Ok(())
    }

    async fn poll_message(&mut self) -> Result<Option<InboundMessage>, NetworkFault> {
        if let Some(msg) = self.inbound.pop_front() {
            return Ok(Some(msg));
        }
        self.ensure_connected()?;

        loop {
            match timeout(POLL_WINDOW, self.eventloop.poll()).await {
                // Nothing ready: the transport buffer is drained.
                Err(_) => return Ok(None),
                Ok(Err(e)) => {
                    self.state = ConnectionState::Disconnected;
                    return Err(e.into());
                }
                Ok(Ok(event)) => {
                    self.stash_inbound(&event);
                    if let Some(msg) = self.inbound.pop_front() {
                        return Ok(Some(msg));
                    }
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

// ===========================================================================
// Tests
// ===========================================================================
