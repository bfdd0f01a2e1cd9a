use std::time::Duration;

use bytes::Bytes;
use rumqttc::v5::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, StateError,
    mqttbytes::{
        QoS,
        v5::{ConnectProperties, DisconnectReasonCode, Packet, Publish, PublishProperties},
    },
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use super::{
    Connector, CreditWindow, Delivery, QueueChannel, QueueError, REDELIVERY_HEADER, Resolution,
};
use crate::config::QueueConfig;

/// how long the broker keeps the session (and its queued messages) after we drop
const SESSION_EXPIRY_SECS: u32 = 60 * 60 * 24;
/// rumqttc refuses anything shorter
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Queue bound to an MQTT v5 broker.
///
/// The queue is a shared subscription, so every worker (and every process)
/// subscribed under the same group competes for messages. Acks are manual and
/// the credit window is advertised to the broker as `receive_maximum`.
pub struct MqttConnector {
    cfg: QueueConfig,
}

impl MqttConnector {
    pub fn new(cfg: QueueConfig) -> Self {
        Self { cfg }
    }
}

impl Connector for MqttConnector {
    type Channel = MqttChannel;

    async fn connect(&self, worker_id: usize) -> Result<MqttChannel, QueueError> {
        MqttChannel::connect(&self.cfg, worker_id).await
    }
}

pub struct MqttChannel {
    client: AsyncClient,
    rx: mpsc::Receiver<Result<Delivery<Publish>, QueueError>>,
    topic: String,
    dead_letter: String,
    driver: JoinHandle<()>,
}

impl MqttChannel {
    pub async fn connect(cfg: &QueueConfig, worker_id: usize) -> Result<Self, QueueError> {
        // same id for the same slot across restarts, so the session is resumed
        let client_id = format!("{}_{worker_id}", cfg.client_id());
        let mut opts = MqttOptions::new(client_id, cfg.host.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(
            cfg.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        opts.set_clean_start(false);
        opts.set_manual_acks(true);

        // replaces every connect property, so receive maximum goes in after
        let mut props = ConnectProperties::new();
        props.session_expiry_interval = Some(SESSION_EXPIRY_SECS);
        opts.set_connect_properties(props);
        opts.set_receive_maximum(Some(u16::try_from(cfg.credit_window).unwrap_or(u16::MAX)));
        if let (Some(username), Some(password)) = (&cfg.username, &cfg.password) {
            opts.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(opts, 10);

        // subscribing again to an existing shared subscription is a no-op
        client
            .subscribe(cfg.subscription(), QoS::AtLeastOnce)
            .await?;

        let window = CreditWindow::new(cfg.credit_window);
        let (tx, rx) = mpsc::channel(window.size());
        let driver = tokio::spawn(drive(eventloop, window, tx));

        Ok(Self {
            client,
            rx,
            topic: cfg.name.clone(),
            dead_letter: cfg.dead_letter_topic(),
            driver,
        })
    }

    async fn republish(
        &self,
        topic: &str,
        payload: Bytes,
        redeliveries: u32,
    ) -> Result<(), QueueError> {
        let properties = PublishProperties {
            user_properties: vec![(REDELIVERY_HEADER.to_string(), redeliveries.to_string())],
            ..Default::default()
        };
        self.client
            .publish_with_properties(topic, QoS::AtLeastOnce, false, payload, properties)
            .await?;
        Ok(())
    }
}

impl QueueChannel for MqttChannel {
    type Tag = Publish;

    async fn next(&mut self) -> Option<Result<Delivery<Publish>, QueueError>> {
        self.rx.recv().await
    }

    async fn resolve(
        &mut self,
        delivery: Delivery<Publish>,
        resolution: Resolution,
    ) -> Result<(), QueueError> {
        let Delivery {
            payload,
            redeliveries,
            tag,
            credit,
        } = delivery;

        match resolution {
            Resolution::Ack => {}
            Resolution::Requeue => {
                self.republish(&self.topic, payload, redeliveries + 1).await?
            }
            Resolution::DeadLetter => {
                self.republish(&self.dead_letter, payload, redeliveries).await?
            }
        }

        self.client.ack(&tag).await?;
        drop(credit);
        Ok(())
    }
}

impl Drop for MqttChannel {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Polls the connection and forwards publishes, each holding one credit.
/// Dropping `tx` tells the worker the consumer is gone.
async fn drive(
    mut eventloop: EventLoop,
    window: CreditWindow,
    tx: mpsc::Sender<Result<Delivery<Publish>, QueueError>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let credit = match window.try_acquire() {
                    Some(credit) => credit,
                    None => {
                        warn!(
                            window = window.size(),
                            "broker exceeded credit window, holding delivery"
                        );
                        match window.acquire().await {
                            Ok(credit) => credit,
                            Err(e) => {
                                error!("{e}");
                                return;
                            }
                        }
                    }
                };

                let delivery = Delivery {
                    payload: publish.payload.clone(),
                    redeliveries: redelivery_count(publish.properties.as_ref()),
                    tag: publish,
                    credit,
                };
                if tx.send(Ok(delivery)).await.is_err() {
                    debug!("worker went away");
                    return;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => info!("connected"),
            Ok(_) => {}
            // rumqttc surfaces a broker DISCONNECT as an error
            Err(ConnectionError::MqttState(StateError::ServerDisconnect {
                reason_code,
                reason_string,
            })) if consumer_cancelled(reason_code) => {
                info!(?reason_code, ?reason_string, "broker cancelled consumer");
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        }
    }
}

/// Disconnect reasons that end the consumer instead of counting as a fault.
/// A taken over session means another process owns this slot's client id.
fn consumer_cancelled(reason: DisconnectReasonCode) -> bool {
    matches!(
        reason,
        DisconnectReasonCode::NormalDisconnection
            | DisconnectReasonCode::ServerShuttingDown
            | DisconnectReasonCode::AdministrativeAction
            | DisconnectReasonCode::SessionTakenOver
    )
}

fn redelivery_count(properties: Option<&PublishProperties>) -> u32 {
    properties
        .and_then(|props| {
            props
                .user_properties
                .iter()
                .find(|(k, _)| k == REDELIVERY_HEADER)
        })
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0)
}
