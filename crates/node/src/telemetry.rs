//! The node's control loop.
//!
//! Every cycle: drain switch commands, publish the temperature, sample the
//! meter and publish the power, then sleep for the cycle period.  A
//! [`NetworkFault`] anywhere in a cycle aborts the rest of it and triggers
//! exactly one reconnect + resubscribe attempt; whatever that attempt yields,
//! the loop carries on with the next cycle.
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──subscribe──▶ Subscribed
//!       ▲                                                 │
//!       └──────────────[network fault in a cycle]─────────┘
//! ```

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::climate::ClimateSensor;
use crate::command::CommandRouter;
use crate::discovery::{DiscoveryRegistry, Topics};
use crate::meter::{MeterChannel, SerialLink};
use crate::mqtt::{Broker, ConnectionState, NetworkFault};
use crate::relay::Actuator;

/// Upper bound on commands handled per cycle, so a flood cannot starve sampling.
const MAX_COMMANDS_PER_CYCLE: usize = 16;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What one successful cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub reannounced: bool,
    pub commands: usize,
    pub temperature_published: bool,
    pub power_published: bool,
}

/// Result of the single recovery attempt after a faulted cycle.
#[derive(Debug)]
pub enum Recovery {
    Restored,
    ReconnectFailed(NetworkFault),
    ResubscribeFailed(NetworkFault),
}

#[derive(Debug)]
pub enum TickOutcome {
    Completed(CycleReport),
    Recovered {
        fault: NetworkFault,
        recovery: Recovery,
    },
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

pub struct TelemetryLoop<B, S, C, A> {
    broker: B,
    meter: MeterChannel<S>,
    climate: C,
    router: CommandRouter<A>,
    registry: DiscoveryRegistry,
    topics: Topics,
    period: Duration,
    /// Discovery configs and initial states have reached the broker.
    announced: bool,
}

impl<B, S, C, A> TelemetryLoop<B, S, C, A>
where
    B: Broker,
    S: SerialLink,
    C: ClimateSensor,
    A: Actuator,
{
    pub fn new(
        broker: B,
        meter: MeterChannel<S>,
        climate: C,
        router: CommandRouter<A>,
        registry: DiscoveryRegistry,
        topics: Topics,
        period: Duration,
    ) -> Self {
        Self {
            broker,
            meter,
            climate,
            router,
            registry,
            topics,
            period,
            announced: false,
        }
    }

    /// One-time setup: connect, announce every entity (retained), subscribe
    /// to the command topic, publish the initial states.
    pub async fn start(&mut self) -> Result<(), NetworkFault> {
        self.broker.connect().await?;
        self.publish_configs().await?;
        self.broker.subscribe(self.router.command_topic()).await?;
        self.publish_initial_states().await?;
        self.announced = true;
        info!("mqtt ready and subscribed");
        Ok(())
    }

    /// Run forever, one cycle per period.
    pub async fn run(mut self) {
        info!(period_ms = self.period.as_millis() as u64, "telemetry loop started");
        loop {
            self.tick().await;
            sleep(self.period).await;
        }
    }

    /// One cycle plus, if it faulted, the recovery attempt.
    pub async fn tick(&mut self) -> TickOutcome {
        match self.run_cycle().await {
            Ok(report) => {
                debug!(?report, "cycle complete");
                TickOutcome::Completed(report)
            }
            Err(fault) => {
                error!("cycle aborted: {fault}");
                let recovery = self.recover().await;
                TickOutcome::Recovered { fault, recovery }
            }
        }
    }

    /// Exactly one reconnect followed by one resubscribe.  Never fails: the
    /// outcome is logged and returned for inspection.
    pub async fn recover(&mut self) -> Recovery {
        if let Err(e) = self.broker.connect().await {
            warn!("reconnect failed: {e}");
            return Recovery::ReconnectFailed(e);
        }
        if let Err(e) = self.broker.subscribe(self.router.command_topic()).await {
            warn!("resubscribe failed: {e}");
            return Recovery::ResubscribeFailed(e);
        }
        info!("broker connection restored");
        Recovery::Restored
    }

    /// Commands, temperature, power.  Sensor and meter problems are logged
    /// and skipped; only network faults end the cycle early.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, NetworkFault> {
        let mut report = CycleReport::default();

        // Startup announcement never completed (broker was down at boot).
        if !self.announced && self.broker.state() != ConnectionState::Disconnected {
            self.publish_configs().await?;
            self.publish_initial_states().await?;
            self.announced = true;
            report.reannounced = true;
            info!("discovery configs re-announced");
        }

        // ── 1. Inbound commands ──────────────────────────────────────
        while report.commands < MAX_COMMANDS_PER_CYCLE {
            let Some(msg) = self.broker.poll_message().await? else {
                break;
            };
            report.commands += 1;
            debug!(topic = %msg.topic, "message received");
            if let Some(update) = self.router.route(&msg.topic, &msg.payload) {
                self.broker
                    .publish(&update.topic, update.payload.as_bytes(), false)
                    .await?;
            }
        }

        // ── 2. Temperature ───────────────────────────────────────────
        match self.climate.measure() {
            Ok(temp_c) => {
                let value = format!("{temp_c:.1}");
                self.broker
                    .publish(&self.topics.temperature.state, value.as_bytes(), false)
                    .await?;
                report.temperature_published = true;
            }
            Err(e) => warn!("climate sensor: {e}"),
        }

        // ── 3. Power ─────────────────────────────────────────────────
        match self.meter.sample().await {
            Ok(sample) => {
                info!(
                    voltage = sample.voltage,
                    current = sample.current,
                    power = sample.power,
                    frequency = sample.frequency,
                    "meter sample"
                );
                let value = format!("{:.1}", sample.power);
                self.broker
                    .publish(&self.topics.power.state, value.as_bytes(), false)
                    .await?;
                report.power_published = true;
            }
            Err(e) => warn!("meter: {e}"),
        }

        Ok(report)
    }

    async fn publish_configs(&mut self) -> Result<(), NetworkFault> {
        for a in self.registry.all_entities() {
            self.broker.publish(&a.config_topic, &a.payload, true).await?;
        }
        Ok(())
    }

    async fn publish_initial_states(&mut self) -> Result<(), NetworkFault> {
        for a in self.registry.all_entities() {
            if let Some(state) = &a.initial_state {
                self.broker
                    .publish(&a.state_topic, state.value.as_bytes(), state.retain)
                    .await?;
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    use crate::climate::SensorFault;
    use crate::command::SwitchState;
    use crate::discovery::DeviceInfo;
    use crate::frame::{ReadRequest, RESPONSE_LEN};
    use crate::meter::DEFAULT_SETTLE;
    use crate::mqtt::InboundMessage;
    use crate::relay::MockRelay;

    const SET: &str = "homeassistant/switch/luca01sw/set";
    const SW_STATE: &str = "homeassistant/switch/luca01sw/state";
    const T_STATE: &str = "homeassistant/sensor/luca01t/state";
    const P_STATE: &str = "homeassistant/sensor/luca01p/state";
    const IP_STATE: &str = "homeassistant/sensor/luca01ip/state";

    // -- Fakes ----------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Connect,
        Publish {
            topic: String,
            payload: String,
            retain: bool,
        },
        Subscribe(String),
    }

    fn publish(topic: &str, payload: &str, retain: bool) -> Call {
        Call::Publish {
            topic: topic.into(),
            payload: payload.into(),
            retain,
        }
    }

    /// In-memory broker recording every request that reaches it.  Requests
    /// made while disconnected fail closed and are not recorded.
    struct FakeBroker {
        calls: Vec<Call>,
        state: ConnectionState,
        inbound: VecDeque<InboundMessage>,
        /// Upcoming connect attempts that fail.
        failing_connects: usize,
        failing_subscribes: usize,
        /// Publishing to this topic drops the connection.
        failing_topic: Option<String>,
    }

    impl FakeBroker {
        fn new() -> Self {
            Self {
                calls: Vec::new(),
                state: ConnectionState::Disconnected,
                inbound: VecDeque::new(),
                failing_connects: 0,
                failing_subscribes: 0,
                failing_topic: None,
            }
        }

        fn push_command(&mut self, topic: &str, payload: &[u8]) {
            self.inbound.push_back(InboundMessage {
                topic: topic.into(),
                payload: payload.to_vec(),
            });
        }

        fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
            self.calls.iter().filter(|c| pred(c)).count()
        }
    }

    impl Broker for FakeBroker {
        async fn connect(&mut self) -> Result<(), NetworkFault> {
            self.calls.push(Call::Connect);
            if self.failing_connects > 0 {
                self.failing_connects -= 1;
                self.state = ConnectionState::Disconnected;
                return Err(NetworkFault::Timeout("connack"));
            }
            self.state = ConnectionState::Connected;
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            retain: bool,
        ) -> Result<(), NetworkFault> {
            if self.state == ConnectionState::Disconnected {
                return Err(NetworkFault::NotConnected);
            }
            if self.failing_topic.as_deref() == Some(topic) {
                self.state = ConnectionState::Disconnected;
                return Err(NetworkFault::Timeout("publish"));
            }
            self.calls.push(publish(
                topic,
                &String::from_utf8_lossy(payload),
                retain,
            ));
            Ok(())
        }

        async fn subscribe(&mut self, topic: &str) -> Result<(), NetworkFault> {
            if self.state == ConnectionState::Disconnected {
                return Err(NetworkFault::NotConnected);
            }
            self.calls.push(Call::Subscribe(topic.into()));
            if self.failing_subscribes > 0 {
                self.failing_subscribes -= 1;
                self.state = ConnectionState::Disconnected;
                return Err(NetworkFault::Timeout("suback"));
            }
            self.state = ConnectionState::Subscribed;
            Ok(())
        }

        async fn poll_message(&mut self) -> Result<Option<InboundMessage>, NetworkFault> {
            if self.state == ConnectionState::Disconnected {
                return Err(NetworkFault::NotConnected);
            }
            Ok(self.inbound.pop_front())
        }

        fn state(&self) -> ConnectionState {
            self.state
        }
    }

    /// Meter port answering with a fixed byte string (empty = silent).
    struct FixedPort(Vec<u8>);

    impl SerialLink for FixedPort {
        fn write_all(&mut self, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn bytes_available(&mut self) -> io::Result<usize> {
            Ok(self.0.len())
        }
        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    /// 123.4 W on a 230.0 V line.
    fn meter_frame() -> Vec<u8> {
        let mut f = vec![0u8; RESPONSE_LEN];
        f[3..5].copy_from_slice(&2300u16.to_be_bytes());
        f[9..11].copy_from_slice(&1234u16.to_be_bytes());
        f[17..19].copy_from_slice(&500u16.to_be_bytes());
        f
    }

    struct FixedClimate(Option<f32>);

    impl ClimateSensor for FixedClimate {
        fn measure(&mut self) -> Result<f32, SensorFault> {
            self.0.ok_or_else(|| SensorFault::Parse("checksum".into()))
        }
    }

    type TestLoop = TelemetryLoop<FakeBroker, FixedPort, FixedClimate, MockRelay>;

    fn build(broker: FakeBroker, meter_response: Vec<u8>, temp: Option<f32>) -> TestLoop {
        let device = DeviceInfo {
            id: "luca01".into(),
            display_name: "Esp32_Luca".into(),
        };
        let topics = Topics::for_device(&device.id);
        let registry = DiscoveryRegistry::new(&device, &topics, "192.168.0.42", "Led").unwrap();
        TelemetryLoop::new(
            broker,
            MeterChannel::new(FixedPort(meter_response), ReadRequest::default(), DEFAULT_SETTLE),
            FixedClimate(temp),
            CommandRouter::new(&topics, MockRelay::new(2)),
            registry,
            topics,
            Duration::from_secs(5),
        )
    }

    fn healthy() -> TestLoop {
        build(FakeBroker::new(), meter_frame(), Some(21.3))
    }

    /// A loop that has completed `start()`, with the call log cleared.
    async fn started() -> TestLoop {
        let mut tl = healthy();
        tl.start().await.unwrap();
        tl.broker.calls.clear();
        tl
    }

    // -- Startup --------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn start_announces_subscribes_and_publishes_initial_states() {
        let mut tl = healthy();
        tl.start().await.unwrap();

        let calls = &tl.broker.calls;
        assert_eq!(calls[0], Call::Connect);
        for (i, topic) in [
            "homeassistant/sensor/luca01t/config",
            "homeassistant/sensor/luca01ip/config",
            "homeassistant/switch/luca01sw/config",
            "homeassistant/sensor/luca01p/config",
        ]
        .iter()
        .enumerate()
        {
            assert!(
                matches!(&calls[1 + i], Call::Publish { topic: t, retain: true, .. } if t == topic),
                "call {} should be retained config for {topic}: {:?}",
                1 + i,
                calls[1 + i]
            );
        }
        assert_eq!(calls[5], Call::Subscribe(SET.into()));
        assert_eq!(calls[6], publish(IP_STATE, "192.168.0.42", true));
        assert_eq!(calls[7], publish(SW_STATE, "OFF", false));
        assert_eq!(calls.len(), 8);
        assert_eq!(tl.broker.state, ConnectionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_sends_identical_retained_configs() {
        let mut tl = healthy();
        tl.start().await.unwrap();
        let first: Vec<Call> = tl.broker.calls.drain(..).collect();
        tl.start().await.unwrap();
        assert_eq!(first, tl.broker.calls);
    }

    #[tokio::test(start_paused = true)]
    async fn start_fails_when_broker_unreachable() {
        let mut broker = FakeBroker::new();
        broker.failing_connects = 1;
        let mut tl = build(broker, meter_frame(), Some(20.0));
        assert!(tl.start().await.is_err());
        assert_eq!(tl.broker.calls, vec![Call::Connect]);
    }

    // -- Cycle ----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn cycle_publishes_temperature_then_power() {
        let mut tl = started().await;
        let report = tl.run_cycle().await.unwrap();
        assert_eq!(
            tl.broker.calls,
            vec![
                publish(T_STATE, "21.3", false),
                publish(P_STATE, "123.4", false)
            ]
        );
        assert_eq!(
            report,
            CycleReport {
                reannounced: false,
                commands: 0,
                temperature_published: true,
                power_published: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn on_command_switches_and_mirrors_state_once() {
        let mut tl = started().await;
        tl.broker.push_command(SET, b"ON");
        let report = tl.run_cycle().await.unwrap();

        assert_eq!(report.commands, 1);
        assert_eq!(tl.router.state(), SwitchState::On);
        assert_eq!(tl.broker.calls[0], publish(SW_STATE, "ON", false));
        assert_eq!(tl.broker.count(|c| matches!(c, Call::Publish { topic, .. } if topic == SW_STATE)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_command_is_dropped() {
        let mut tl = started().await;
        tl.broker.push_command(SET, b"TOGGLE");
        let report = tl.run_cycle().await.unwrap();

        assert_eq!(report.commands, 1);
        assert_eq!(tl.router.state(), SwitchState::Off);
        assert_eq!(tl.broker.count(|c| matches!(c, Call::Publish { topic, .. } if topic == SW_STATE)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_commands_are_drained_in_order() {
        let mut tl = started().await;
        tl.broker.push_command(SET, b"ON");
        tl.broker.push_command(SET, b"OFF");
        tl.run_cycle().await.unwrap();

        assert_eq!(tl.broker.calls[0], publish(SW_STATE, "ON", false));
        assert_eq!(tl.broker.calls[1], publish(SW_STATE, "OFF", false));
        assert_eq!(tl.router.state(), SwitchState::Off);
    }

    #[tokio::test(start_paused = true)]
    async fn command_flood_is_capped_per_cycle() {
        let mut tl = started().await;
        for _ in 0..MAX_COMMANDS_PER_CYCLE + 4 {
            tl.broker.push_command(SET, b"ON");
        }
        let report = tl.run_cycle().await.unwrap();
        assert_eq!(report.commands, MAX_COMMANDS_PER_CYCLE);
        assert!(report.power_published);
        assert_eq!(tl.broker.inbound.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_meter_skips_power_but_keeps_cycle() {
        let mut tl = build(FakeBroker::new(), Vec::new(), Some(21.3));
        tl.start().await.unwrap();
        tl.broker.calls.clear();

        let outcome = tl.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Completed(CycleReport {
                power_published: false,
                temperature_published: true,
                ..
            })
        ));
        assert_eq!(tl.broker.calls, vec![publish(T_STATE, "21.3", false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_meter_frame_does_not_reconnect() {
        let mut short = meter_frame();
        short.truncate(10);
        let mut tl = build(FakeBroker::new(), short, Some(21.3));
        tl.start().await.unwrap();
        tl.broker.calls.clear();

        assert!(matches!(tl.tick().await, TickOutcome::Completed(_)));
        assert_eq!(tl.broker.count(|c| *c == Call::Connect), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn climate_fault_skips_temperature_only() {
        let mut tl = build(FakeBroker::new(), meter_frame(), None);
        tl.start().await.unwrap();
        tl.broker.calls.clear();

        let report = tl.run_cycle().await.unwrap();
        assert!(!report.temperature_published);
        assert_eq!(tl.broker.calls, vec![publish(P_STATE, "123.4", false)]);
    }

    // -- Recovery ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn fault_in_power_publish_triggers_one_reconnect_and_resubscribe() {
        let mut tl = started().await;
        tl.broker.failing_topic = Some(P_STATE.into());

        let outcome = tl.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Recovered {
                recovery: Recovery::Restored,
                ..
            }
        ));
        assert_eq!(
            tl.broker.calls,
            vec![
                publish(T_STATE, "21.3", false),
                Call::Connect,
                Call::Subscribe(SET.into()),
            ]
        );
        assert_eq!(tl.broker.state, ConnectionState::Subscribed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_is_attempted_once_and_swallowed() {
        let mut tl = started().await;
        tl.broker.failing_topic = Some(T_STATE.into());
        tl.broker.failing_connects = 1;

        let outcome = tl.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Recovered {
                recovery: Recovery::ReconnectFailed(_),
                ..
            }
        ));
        assert_eq!(tl.broker.calls, vec![Call::Connect]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_resubscribe_is_attempted_once() {
        let mut tl = started().await;
        tl.broker.failing_topic = Some(T_STATE.into());
        tl.broker.failing_subscribes = 1;

        let outcome = tl.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Recovered {
                recovery: Recovery::ResubscribeFailed(_),
                ..
            }
        ));
        assert_eq!(
            tl.broker.calls,
            vec![Call::Connect, Call::Subscribe(SET.into())]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn disconnected_cycle_fails_closed_without_publishing() {
        let mut tl = started().await;
        tl.broker.state = ConnectionState::Disconnected;
        tl.broker.failing_connects = 1;

        let outcome = tl.tick().await;
        assert!(matches!(
            outcome,
            TickOutcome::Recovered {
                fault: NetworkFault::NotConnected,
                ..
            }
        ));
        assert_eq!(tl.broker.count(|c| matches!(c, Call::Publish { .. })), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn every_faulted_cycle_retries_once_more() {
        let mut tl = started().await;
        tl.broker.state = ConnectionState::Disconnected;
        tl.broker.failing_connects = 3;

        for _ in 0..3 {
            tl.tick().await;
        }
        assert_eq!(tl.broker.count(|c| *c == Call::Connect), 3);

        assert!(matches!(tl.tick().await, TickOutcome::Recovered { recovery: Recovery::Restored, .. }));
        assert!(matches!(tl.tick().await, TickOutcome::Completed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn commands_survive_reconnect() {
        let mut tl = started().await;
        tl.broker.failing_topic = Some(P_STATE.into());
        tl.tick().await;
        tl.broker.failing_topic = None;
        tl.broker.calls.clear();

        tl.broker.push_command(SET, b"ON");
        assert!(matches!(tl.tick().await, TickOutcome::Completed(_)));
        assert_eq!(tl.router.state(), SwitchState::On);
        assert_eq!(tl.broker.calls[0], publish(SW_STATE, "ON", false));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_startup_is_reannounced_after_recovery() {
        let mut broker = FakeBroker::new();
        broker.failing_connects = 1;
        let mut tl = build(broker, meter_frame(), Some(21.3));
        assert!(tl.start().await.is_err());

        // First cycle finds the link down and recovers it.
        assert!(matches!(
            tl.tick().await,
            TickOutcome::Recovered {
                recovery: Recovery::Restored,
                ..
            }
        ));
        tl.broker.calls.clear();

        // Next cycle announces before sampling.
        match tl.tick().await {
            TickOutcome::Completed(report) => assert!(report.reannounced),
            other => panic!("expected completed cycle, got {other:?}"),
        }
        let retained_configs = tl
            .broker
            .count(|c| matches!(c, Call::Publish { topic, retain: true, .. } if topic.ends_with("/config")));
        assert_eq!(retained_configs, 4);
        assert!(tl.broker.calls.contains(&publish(SW_STATE, "OFF", false)));
        assert!(tl.broker.calls.contains(&publish(IP_STATE, "192.168.0.42", true)));

        // And only once.
        tl.broker.calls.clear();
        match tl.tick().await {
            TickOutcome::Completed(report) => assert!(!report.reannounced),
            other => panic!("expected completed cycle, got {other:?}"),
        }
    }
}
