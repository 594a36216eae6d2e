use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, TlsConfiguration,
    Transport,
};
use rustls::RootCertStore;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use super::{ConnectSettings, ConnectionHandler, MqttConnection, MqttMessage};
use crate::error::TransportError;

const MQTT_TLS_PORT: u16 = 8883;

/// Production MQTT connection on top of the rumqttc async client. The
/// event loop runs as a task on the client-owned runtime and maps rumqttc
/// events to the provisioning notifications.
pub(crate) struct RumqttConnection {
    runtime: Handle,
    cancellation: CancellationToken,
    client: Option<AsyncClient>,
}

impl RumqttConnection {
    pub(crate) fn new(runtime: Handle, cancellation: CancellationToken) -> RumqttConnection {
        RumqttConnection {
            runtime,
            cancellation,
            client: None,
        }
    }

    fn tls_configuration(settings: &ConnectSettings) -> Result<TlsConfiguration, TransportError> {
        let mut roots = RootCertStore::empty();
        match &settings.trusted_certificate {
            Some(pem) => {
                for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                    let cert = cert.map_err(|e| {
                        TransportError::Tls(format!("invalid trusted certificate: {e}"))
                    })?;
                    roots.add(cert).map_err(|e| {
                        TransportError::Tls(format!("rejected trusted certificate: {e}"))
                    })?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
        let config = match &settings.device_certificate {
            Some(identity) => {
                let certs = rustls_pemfile::certs(&mut identity.certificate_pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| {
                        TransportError::Tls(format!("invalid device certificate: {e}"))
                    })?;
                let key = rustls_pemfile::private_key(&mut identity.private_key_pem.as_slice())
                    .map_err(|e| TransportError::Tls(format!("invalid device private key: {e}")))?
                    .ok_or_else(|| {
                        TransportError::Tls("the device private key PEM contains no key".into())
                    })?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| TransportError::Tls(format!("device certificate rejected: {e}")))?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(TlsConfiguration::Rustls(Arc::new(config)))
    }
}

impl MqttConnection for RumqttConnection {
    fn connect(
        &mut self,
        settings: ConnectSettings,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(), TransportError> {
        let tls = Self::tls_configuration(&settings)?;

        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.endpoint.clone(),
            MQTT_TLS_PORT,
        );
        options.set_keep_alive(settings.keep_alive);
        options.set_credentials(
            settings.user_name.clone(),
            settings.password.clone().unwrap_or_default(),
        );
        options.set_transport(Transport::tls_with_config(tls));
        options.set_clean_session(false);

        let (client, eventloop) = AsyncClient::new(options, 10);
        self.client = Some(client);

        let cancellation = self.cancellation.clone();
        let connect_timeout = settings.connect_timeout;
        self.runtime.spawn(async move {
            log::debug!("MQTT task is starting.");
            pump(eventloop, handler, cancellation, connect_timeout).await;
            log::debug!("MQTT task has ended.");
        });

        Ok(())
    }

    fn subscribe(&mut self, topic_filter: &str) -> Result<(), TransportError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError::Request("the MQTT client is not connected".into()))?;
        client
            .try_subscribe(topic_filter, QoS::AtMostOnce)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError::Request("the MQTT client is not connected".into()))?;
        client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            // The request queue may already be gone; nothing left to do then.
            _ = client.try_disconnect();
        }
        self.cancellation.cancel();
    }
}

/// Drives the rumqttc event loop until cancellation, the first connection
/// error, or the outgoing disconnect packet. There is no reconnect here: a
/// lost provisioning connection is terminal for the registration attempt.
async fn pump(
    mut eventloop: rumqttc::EventLoop,
    handler: Arc<dyn ConnectionHandler>,
    cancellation: CancellationToken,
    connect_timeout: Duration,
) {
    let connect_deadline = tokio::time::Instant::now() + connect_timeout;
    let mut connected = false;

    loop {
        let event = tokio::select! {
            _ = cancellation.cancelled() => {
                log::debug!("Stopping MQTT because of cancellation");
                return;
            }
            _ = tokio::time::sleep_until(connect_deadline), if !connected => {
                log::warn!("The MQTT connection was not acknowledged within the connect timeout");
                handler.connect_notify(false);
                return;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                connected = ack.code == ConnectReturnCode::Success;
                if !connected {
                    log::warn!("The provisioning service refused the connection: {:?}", ack.code);
                }
                handler.connect_notify(connected);
                if !connected {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                log::trace!("Received = {:?}", publish);
                handler.receive_notify(MqttMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                log::debug!("Registration response subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("Stopping MQTT because of disconnect packet");
                cancellation.cancel();
                return;
            }
            Ok(event) => {
                log::trace!("MQTT event: {event:?}");
            }
            Err(e) => {
                log::debug!("Error in MQTT: {e:?}");
                if connected {
                    handler.disconnect_notify();
                } else {
                    handler.connect_notify(false);
                }
                return;
            }
        }
    }
}
