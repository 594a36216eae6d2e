//! The serialized reactor behind the provisioning protocol: one task
//! drains the pending-event bits and feeds the periodic tick, running the
//! per-event action handlers under the context lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectSettings, ConnectionHandler, MqttMessage};
use crate::dps::response::RegisterResponse;
use crate::dps::{self, topics};
use crate::error::ProvisioningError;

use super::context::{Context, Shared, StepOutcome};
use super::events;
use super::state::State;

/// Largest response payload accepted from the service. Larger payloads
/// would span multiple receive buffers and are refused.
pub(crate) const RESPONSE_PAYLOAD_MAX: usize = 4096;

/// Runs until cancelled, dispatching whenever event bits are posted and on
/// every one-second tick.
pub(crate) async fn run(shared: Arc<Shared>, cancellation: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => {
                log::debug!("Stopping the provisioning dispatcher because of cancellation");
                return;
            }
            _ = shared.events.posted() => dispatch(&shared, shared.events.drain(), false),
            _ = tick.tick() => dispatch(&shared, shared.events.drain(), true),
        }
    }
}

/// One dispatch pass under the context lock. The handler order is fixed:
/// timer first, then CONNECT, SUBSCRIBE, RESPONSE, REQUEST, DISCONNECT.
/// A response racing a disconnect into the same pass is therefore still
/// delivered before the disconnect is acted on.
pub(crate) fn dispatch(shared: &Arc<Shared>, pending: u32, tick: bool) {
    let mut context = shared.lock();

    if tick {
        process_timer(shared, &mut context);
    }
    if pending & events::CONNECT != 0 {
        process_connect(shared, &mut context);
    }
    if pending & events::SUBSCRIBE != 0 {
        subscribe(shared, &mut context);
    }
    if pending & events::RESPONSE != 0 {
        process_service_response(shared, &mut context);
    }
    if pending & events::REQUEST != 0 {
        send_register_request(shared, &mut context);
    }
    if pending & events::DISCONNECT != 0 {
        process_disconnect(shared, &mut context);
    }
}

fn process_connect(shared: &Arc<Shared>, context: &mut Context) {
    if context.state != State::Connect {
        return;
    }

    let config = &shared.config;
    let settings = ConnectSettings {
        endpoint: config.endpoint.clone(),
        client_id: config.registration_id.clone(),
        user_name: context.credentials.user_name.clone(),
        password: context.credentials.sas_token.clone(),
        keep_alive: config.keep_alive,
        connect_timeout: config.connect_timeout,
        trusted_certificate: config.trusted_certificate.clone(),
        device_certificate: context.device_certificate.clone(),
    };

    log::debug!("Connecting to the provisioning service at {}", config.endpoint);
    let handler = Arc::clone(shared) as Arc<dyn ConnectionHandler>;
    if let Err(e) = context.connection.connect(settings, handler) {
        shared.update_state(context, StepOutcome::Failed(e.into()));
    }
}

fn process_timer(shared: &Arc<Shared>, context: &mut Context) {
    if context.retry_countdown == 0 {
        return;
    }
    if context.retry_countdown == 1 {
        shared.events.post(events::REQUEST);
    }
    context.retry_countdown -= 1;
}

fn subscribe(shared: &Arc<Shared>, context: &mut Context) {
    if context.state != State::Subscribe {
        return;
    }

    match context.connection.subscribe(topics::RESPONSE_TOPIC_FILTER) {
        Ok(()) => {
            shared.update_state(context, StepOutcome::InProgress);
            shared.events.post(events::REQUEST);
        }
        Err(e) => shared.update_state(context, StepOutcome::Failed(e.into())),
    }
}

fn send_register_request(shared: &Arc<Shared>, context: &mut Context) {
    if context.state != State::Request {
        return;
    }

    // A held response means this is a follow-up query for its operation.
    let topic = match context.current_response.take() {
        Some(response) => topics::query_status_publish_topic(&response.operation_id),
        None => topics::register_publish_topic(),
    };
    let payload = dps::register_payload(&shared.config.registration_id);

    log::debug!("Publishing registration request to {topic}");
    match context.connection.publish(&topic, payload) {
        Ok(()) => shared.update_state(context, StepOutcome::InProgress),
        Err(e) => shared.update_state(context, StepOutcome::Failed(e.into())),
    }
}

fn process_service_response(shared: &Arc<Shared>, context: &mut Context) {
    if context.state != State::WaitingForResponse {
        return;
    }

    let message = match context.last_response.take() {
        Some(message) => message,
        None => {
            log::warn!("Response event with no response pending");
            return;
        }
    };

    if message.payload.len() > RESPONSE_PAYLOAD_MAX {
        shared.update_state(
            context,
            StepOutcome::Failed(ProvisioningError::MessageTooLong),
        );
        return;
    }

    let response = match RegisterResponse::parse(&message.topic, &message.payload) {
        Ok(response) => response,
        Err(e) => {
            log::error!("Failed to parse registration response: {e:?}");
            shared.update_state(
                context,
                StepOutcome::Failed(ProvisioningError::SdkCore(e.to_string())),
            );
            return;
        }
    };

    log::debug!(
        "Registration response: status {}, operation {:?} is {:?}",
        response.status,
        response.operation_id,
        response.operation_status
    );

    if response.is_assigned() {
        context.current_response = Some(response);
        shared.update_state(context, StepOutcome::Assigned);
    } else if response.retry_after_seconds == 0 {
        // A zero retry-after is a terminal rejection.
        let status = response.status;
        shared.update_state(
            context,
            StepOutcome::Failed(ProvisioningError::ServerResponse { status }),
        );
    } else {
        context.retry_countdown = response.retry_after_seconds;
        context.current_response = Some(response);
        shared.update_state(context, StepOutcome::InProgress);
    }
}

fn process_disconnect(shared: &Arc<Shared>, context: &mut Context) {
    // Stale disconnect notifications after completion are harmless.
    if context.state.is_in_progress() {
        shared.update_state(
            context,
            StepOutcome::Failed(ProvisioningError::Disconnected),
        );
    }
}

impl ConnectionHandler for Shared {
    fn connect_notify(&self, success: bool) {
        let mut context = self.lock();
        if success {
            if context.state == State::Connect {
                self.update_state(&mut context, StepOutcome::InProgress);
                self.events.post(events::SUBSCRIBE);
            }
        } else {
            self.events.post(events::DISCONNECT);
        }
    }

    fn receive_notify(&self, message: MqttMessage) {
        let mut context = self.lock();
        if context.last_response.is_some() {
            // Probably a duplicate from the service; the pending one wins.
            log::debug!("Dropping a registration response received while one is pending");
            return;
        }
        context.last_response = Some(message);
        self.events.post(events::RESPONSE);
    }

    fn disconnect_notify(&self) {
        self.events.post(events::DISCONNECT);
    }
}
