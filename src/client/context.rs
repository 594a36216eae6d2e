use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::connection::{DeviceCertificate, MqttConnection, MqttMessage};
use crate::dps::response::RegisterResponse;
use crate::error::ProvisioningError;

use super::events::EventSet;
use super::state::State;
use super::CompletionCallback;

/// Combined size limit for the MQTT user name and the SAS token.
pub(crate) const CREDENTIALS_BUFFER_SIZE: usize = 1024;

/// The MQTT login material. The user name is fixed at initialization; the
/// SAS token is written by the SAS builder. Their combined length never
/// exceeds [`CREDENTIALS_BUFFER_SIZE`].
pub(crate) struct Credentials {
    pub user_name: String,
    pub sas_token: Option<String>,
}

impl Credentials {
    pub(crate) fn new(user_name: String) -> Result<Credentials, ProvisioningError> {
        if user_name.len() > CREDENTIALS_BUFFER_SIZE {
            return Err(ProvisioningError::InsufficientBuffer);
        }
        Ok(Credentials {
            user_name,
            sas_token: None,
        })
    }

    pub(crate) fn set_sas_token(&mut self, sas_token: String) -> Result<(), ProvisioningError> {
        if self.user_name.len() + sas_token.len() > CREDENTIALS_BUFFER_SIZE {
            return Err(ProvisioningError::InsufficientBuffer);
        }
        self.sas_token = Some(sas_token);
        Ok(())
    }
}

/// Immutable per-client configuration.
pub(crate) struct ClientConfig {
    pub endpoint: String,
    pub id_scope: String,
    pub registration_id: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    pub trusted_certificate: Option<Vec<u8>>,
}

/// Outcome of one action handler, fed to [`Shared::update_state`].
pub(crate) enum StepOutcome {
    /// The protocol advanced; move to the next state.
    InProgress,
    /// The service assigned the device; terminal success.
    Assigned,
    /// Terminal failure.
    Failed(ProvisioningError),
}

/// The mutable registration record. Only ever touched under the context
/// lock in [`Shared`].
pub(crate) struct Context {
    pub state: State,
    /// Latched on the first terminal transition, never overwritten.
    pub result: Option<Result<(), ProvisioningError>>,
    pub credentials: Credentials,
    pub device_certificate: Option<DeviceCertificate>,
    pub connection: Box<dyn MqttConnection>,
    /// At most one received publish awaiting the dispatcher; surplus
    /// packets are dropped as duplicates.
    pub last_response: Option<MqttMessage>,
    /// Most recent parsed response. Held while polling, so the next
    /// request queries the same operation, and in DONE for the device-info
    /// getter.
    pub current_response: Option<RegisterResponse>,
    /// Seconds until the next request; zero means inactive, one fires on
    /// this tick.
    pub retry_countdown: u32,
    pub on_complete: Option<CompletionCallback>,
}

/// Everything the public client, the dispatcher task and the MQTT
/// callbacks share.
pub(crate) struct Shared {
    pub config: ClientConfig,
    pub context: Mutex<Context>,
    /// Parks callers blocked in `register`; notified on every terminal
    /// transition.
    pub completion: Condvar,
    pub events: EventSet,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Context> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies an action outcome to the state machine.
    ///
    /// Pending outcomes advance along the transition table; terminal ones
    /// latch the result, wake every waiter and fire the completion
    /// callback. Once a terminal state is reached, further outcomes are
    /// no-ops.
    pub(crate) fn update_state(&self, context: &mut Context, outcome: StepOutcome) {
        if context.state.is_terminal() {
            return;
        }

        match outcome {
            StepOutcome::InProgress => match context.state.advanced() {
                Some(next) => {
                    log::debug!("Provisioning state {:?} -> {:?}", context.state, next);
                    context.state = next;
                }
                None => log::error!("No pending transition from state {:?}", context.state),
            },
            StepOutcome::Assigned => {
                log::info!("Device registration completed successfully");
                context.state = State::Done;
                self.complete(context, Ok(()));
            }
            StepOutcome::Failed(e) => {
                log::warn!("Provisioning failed in state {:?}: {e}", context.state);
                context.state = State::Error;
                self.complete(context, Err(e));
            }
        }
    }

    fn complete(&self, context: &mut Context, result: Result<(), ProvisioningError>) {
        context.result = Some(result.clone());
        self.completion.notify_all();
        if let Some(on_complete) = context.on_complete.take() {
            on_complete(result);
        }
    }
}
