use bytes::Bytes;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub device_id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    pub keepalive: Duration,
    pub client_id: String,
}

impl DeviceConfig {
    pub fn raw_topic(&self) -> String {
        format!("{}/{}/brainwaves/raw", self.topic_prefix, self.device_id)
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keepalive);
        if let Some(username) = &self.username {
            options.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        options
    }
}

/// A live subscription to the headset's raw feed.
///
/// Payloads are pushed into the channel handed to [`DeviceSession::connect`]; the
/// sender is dropped when the session is released, which ends the ingest loop.
pub struct DeviceSession {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl DeviceSession {
    pub fn connect(config: DeviceConfig, tx: mpsc::Sender<Bytes>) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_device_feed(config, tx, cancel.clone()));
        Self { cancel, handle }
    }

    /// Unsubscribe, disconnect from the broker, and stop forwarding.
    pub async fn release(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::warn!(error=%err, "device feed task failed");
        }
    }
}

async fn run_device_feed(config: DeviceConfig, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) {
    let topic = config.raw_topic();

    loop {
        let (client, mut eventloop) = AsyncClient::new(config.mqtt_options(), 32);

        if let Err(err) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            tracing::warn!(error=%err, "failed to subscribe to device feed; retrying");
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(SUBSCRIBE_RETRY_DELAY) => continue,
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    close_session(&client, &mut eventloop, &topic).await;
                    return;
                }
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::SubAck(_))) => {
                        tracing::info!(topic=%topic, "subscribed to brainwave feed");
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if tx.send(publish.payload).await.is_err() {
                            tracing::info!("stream consumer closed; leaving device feed");
                            close_session(&client, &mut eventloop, &topic).await;
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!(error=%err, "device connection dropped; reconnecting");
                        break;
                    }
                },
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(RECONNECT_DELAY) => {}
        }
    }
}

async fn close_session(client: &AsyncClient, eventloop: &mut EventLoop, topic: &str) {
    if let Err(err) = client.unsubscribe(topic.to_string()).await {
        tracing::debug!(error=%err, topic, "device unsubscribe request failed");
    }
    if let Err(err) = client.disconnect().await {
        tracing::debug!(error=%err, "device disconnect request failed");
        return;
    }
    // Drive the event loop until the disconnect packet is actually written.
    let drained = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("timed out waiting for device disconnect");
    }
    tracing::info!("device session released");
}
