use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use ems_engine::{EmsEvent, EngineHandle, OutboundCommand, PowerUpdateRequest, SessionStartRequest};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::messages::{
    BessCommandMessage, BessStatusMessage, ChargerTelemetryMessage, PowerLimitCommand, Priority,
    SessionStartCommand, SessionStartMessage, SessionStopMessage, SessionUpdateMessage,
};
use crate::topics::{InboundKind, Topics};

/// Outbound commands kept while the broker is unreachable; the oldest entry
/// is dropped on overflow.
pub const OUTBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct FabricConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub site_id: String,
}

pub struct FabricAdapter;

impl FabricAdapter {
    /// Spawn the two fabric tasks: the eventloop driver (decode and enqueue,
    /// nothing else) and the publisher (drain the command channel through a
    /// bounded backlog).
    pub fn start(
        config: FabricConfig,
        engine: EngineHandle,
        commands: mpsc::Receiver<OutboundCommand>,
        connected: Arc<AtomicBool>,
    ) {
        let topics = Topics::new(&config.site_id);
        let client_id = format!("ems-{}", config.site_id);
        let mut options =
            MqttOptions::new(client_id, config.broker_host.clone(), config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);

        tokio::spawn(drive_eventloop(
            eventloop,
            client.clone(),
            topics.clone(),
            engine,
            connected,
        ));
        tokio::spawn(publish_commands(client, topics, commands));
    }
}

/// Poll the broker connection forever. Reconnection is implicit: polling
/// after an error re-dials, and every ConnAck re-subscribes.
async fn drive_eventloop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Topics,
    engine: EngineHandle,
    connected: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                connected.store(true, Ordering::Relaxed);
                info!("connected to the message fabric");
                for filter in topics.subscriptions() {
                    if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce).await {
                        error!(error = %err, filter = %filter, "subscription failed");
                    }
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let Some(kind) = topics.classify(&publish.topic) else {
                    debug!(topic = %publish.topic, "unrecognised topic, ignored");
                    continue;
                };
                match decode_inbound(kind, &publish.payload) {
                    Ok(event) => {
                        if !engine.send(event).await {
                            warn!("coordinator gone, inbound message dropped");
                        }
                    }
                    Err(err) => {
                        error!(
                            topic = %publish.topic,
                            error = %err,
                            "protocol error, message discarded"
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(err) => {
                if connected.swap(false, Ordering::Relaxed) {
                    warn!(error = %err, "fabric connection lost, reconnecting");
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Translate one decoded device message into the coordinator's vocabulary.
fn decode_inbound(kind: InboundKind, payload: &[u8]) -> Result<EmsEvent, serde_json::Error> {
    let event = match kind {
        InboundKind::SessionStart { .. } => {
            let message: SessionStartMessage = serde_json::from_slice(payload)?;
            EmsEvent::SessionStart {
                request: SessionStartRequest {
                    session_id: Some(message.session_id),
                    charger_id: message.charger_id,
                    connector_id: message.connector_id,
                    vehicle_max_power: message.vehicle_max_power,
                    user_id: message.user_id,
                    rfid_tag: message.rfid_tag,
                    timestamp: message.timestamp,
                    // the charger originated this session, no announcement
                    announce: false,
                },
                reply: None,
            }
        }
        InboundKind::SessionStop { .. } => {
            let message: SessionStopMessage = serde_json::from_slice(payload)?;
            EmsEvent::SessionStop {
                session_id: message.session_id,
                total_energy: message.total_energy,
                reply: None,
            }
        }
        InboundKind::SessionUpdate { .. } => {
            let message: SessionUpdateMessage = serde_json::from_slice(payload)?;
            EmsEvent::PowerUpdate {
                request: PowerUpdateRequest {
                    session_id: message.session_id,
                    consumed_power: message.consumed_power,
                    vehicle_max_power: message.vehicle_max_power,
                    total_energy: Some(message.energy_delivered),
                    vehicle_soc: message.vehicle_soc,
                    timestamp: message.timestamp,
                },
                reply: None,
            }
        }
        InboundKind::Telemetry { .. } => {
            let message: ChargerTelemetryMessage = serde_json::from_slice(payload)?;
            EmsEvent::ChargerTelemetry {
                charger_id: message.charger_id,
                connector_id: message.connector_id,
                session_id: message.session_id,
                power_kw: message.power / 1000.0,
                vehicle_soc: message.vehicle_soc,
                timestamp: message.timestamp,
            }
        }
        InboundKind::BessStatus => {
            let message: BessStatusMessage = serde_json::from_slice(payload)?;
            EmsEvent::BatteryTelemetry {
                soc: message.soc,
                power: message.power,
                timestamp: message.timestamp,
            }
        }
    };
    Ok(event)
}

async fn publish_commands(
    client: AsyncClient,
    topics: Topics,
    mut commands: mpsc::Receiver<OutboundCommand>,
) {
    let mut backlog: VecDeque<OutboundCommand> = VecDeque::new();
    let mut retry = tokio::time::interval(Duration::from_secs(1));
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        enqueue(&mut backlog, command);
                        flush(&client, &topics, &mut backlog);
                    }
                    None => break,
                }
            }
            _ = retry.tick() => {
                flush(&client, &topics, &mut backlog);
            }
        }
    }
}

fn enqueue(backlog: &mut VecDeque<OutboundCommand>, command: OutboundCommand) {
    if backlog.len() == OUTBOUND_BUFFER {
        backlog.pop_front();
        warn!("outbound buffer full, dropped the oldest command");
    }
    backlog.push_back(command);
}

fn flush(client: &AsyncClient, topics: &Topics, backlog: &mut VecDeque<OutboundCommand>) {
    while let Some(command) = backlog.front() {
        let (topic, payload) = match encode(topics, command) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, "unencodable outbound command dropped");
                backlog.pop_front();
                continue;
            }
        };
        match client.try_publish(topic, QoS::AtLeastOnce, false, payload) {
            Ok(()) => {
                backlog.pop_front();
            }
            Err(err) => {
                debug!(error = %err, "publish deferred, fabric not ready");
                break;
            }
        }
    }
}

fn encode(
    topics: &Topics,
    command: &OutboundCommand,
) -> Result<(String, Vec<u8>), serde_json::Error> {
    match command {
        OutboundCommand::PowerLimit {
            charger_id,
            connector_id,
            power_limit,
        } => {
            let message = PowerLimitCommand {
                timestamp: Utc::now(),
                charger_id: charger_id.clone(),
                connector_id: *connector_id,
                power_limit: *power_limit,
                priority: Priority::Normal,
            };
            Ok((
                topics.power_limit(charger_id, *connector_id),
                serde_json::to_vec(&message)?,
            ))
        }
        OutboundCommand::StartSession {
            charger_id,
            session_id,
            connector_id,
            vehicle_max_power,
        } => {
            let message = SessionStartCommand {
                timestamp: Utc::now(),
                session_id: session_id.clone(),
                connector_id: *connector_id,
                vehicle_max_power: *vehicle_max_power,
            };
            Ok((
                topics.session_start_command(charger_id),
                serde_json::to_vec(&message)?,
            ))
        }
        OutboundCommand::Bess(command) => {
            let message = BessCommandMessage {
                timestamp: Utc::now(),
                command: command.kind,
                power: command.power,
            };
            Ok((topics.bess_command(), serde_json::to_vec(&message)?))
        }
    }
}
