use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::connection::rumqtt::RumqttConnection;
use crate::connection::{DeviceCertificate, MqttConnection};
use crate::dps;
use crate::error::ProvisioningError;

use context::{ClientConfig, Context, Credentials, Shared, StepOutcome};
use state::State;

mod context;
mod dispatcher;
mod events;
mod state;

/// Upper bound on DNS resolution plus the initial TLS and MQTT connect.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
/// MQTT keep-alive for the provisioning connection.
const KEEP_ALIVE: Duration = Duration::from_secs(4 * 60);
/// Validity of a generated SAS token, in seconds.
const TOKEN_EXPIRY_SECS: i64 = 3600;

type HmacSha256 = Hmac<Sha256>;

/// Callback invoked once the registration reaches a terminal outcome,
/// at most once per registration.
///
/// It runs on the dispatcher task while the client's internal lock is
/// held, so it must not call back into the client.
pub type CompletionCallback = Box<dyn FnOnce(Result<(), ProvisioningError>) + Send>;

/// The IoT Hub assignment produced by a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IotHubDeviceInfo {
    /// Hostname of the IoT Hub the device was assigned to.
    pub iothub_hostname: String,
    /// Device ID registered in that hub.
    pub device_id: String,
}

/// A builder for [`ProvisioningClient`] carrying the enrollment identity
/// and the connection options.
pub struct ProvisioningClientBuilder {
    endpoint: String,
    id_scope: String,
    registration_id: String,
    trusted_certificate: Option<Vec<u8>>,
    symmetric_key: Option<String>,
    device_certificate: Option<DeviceCertificate>,
    completion_callback: Option<CompletionCallback>,
    connect_timeout: Duration,
    keep_alive: Duration,
}

impl ProvisioningClientBuilder {
    /// Creates a new [`ProvisioningClientBuilder`] with the identity of one
    /// enrollment:
    ///
    /// * `endpoint`: The hostname of the Device Provisioning Service
    ///   instance, for example `global.azure-devices-provisioning.net`.
    /// * `id_scope`: The ID scope of the enrollment.
    /// * `registration_id`: The registration ID the device presents; it
    ///   also becomes the MQTT client ID.
    pub fn new(
        endpoint: impl Into<String>,
        id_scope: impl Into<String>,
        registration_id: impl Into<String>,
    ) -> Self {
        ProvisioningClientBuilder {
            endpoint: endpoint.into(),
            id_scope: id_scope.into(),
            registration_id: registration_id.into(),
            trusted_certificate: None,
            symmetric_key: None,
            device_certificate: None,
            completion_callback: None,
            connect_timeout: CONNECT_TIMEOUT,
            keep_alive: KEEP_ALIVE,
        }
    }

    /// Set the PEM-encoded root certificate used to validate the service.
    /// Without it the platform trust roots are used.
    pub fn with_trusted_certificate(mut self, certificate_pem: Vec<u8>) -> Self {
        self.trusted_certificate = Some(certificate_pem);
        self
    }

    /// Set the base64-encoded symmetric enrollment key. A SAS token for it
    /// is derived during [`ProvisioningClientBuilder::build`].
    pub fn with_symmetric_key(mut self, symmetric_key: impl Into<String>) -> Self {
        self.symmetric_key = Some(symmetric_key.into());
        self
    }

    /// Set the X.509 device identity presented during the TLS handshake.
    pub fn with_device_certificate(mut self, certificate: DeviceCertificate) -> Self {
        self.device_certificate = Some(certificate);
        self
    }

    /// Set the callback invoked once the registration completes. See
    /// [`CompletionCallback`] for the restrictions it runs under.
    pub fn with_completion_callback(
        mut self,
        callback: impl FnOnce(Result<(), ProvisioningError>) + Send + 'static,
    ) -> Self {
        self.completion_callback = Some(Box::new(callback));
        self
    }

    /// Override the default connect timeout of 20 seconds.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Override the default MQTT keep-alive of 4 minutes.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Build the [`ProvisioningClient`]. The registration itself does not
    /// start until the first call to
    /// [`register`](ProvisioningClient::register).
    pub fn build(self) -> Result<ProvisioningClient, ProvisioningError> {
        let runtime = new_runtime()?;
        let cancellation = CancellationToken::new();
        let connection = Box::new(RumqttConnection::new(
            runtime.handle().clone(),
            cancellation.child_token(),
        ));
        self.start(runtime, cancellation, connection)
    }

    fn start(
        self,
        runtime: Runtime,
        cancellation: CancellationToken,
        connection: Box<dyn MqttConnection>,
    ) -> Result<ProvisioningClient, ProvisioningError> {
        let mut client = self.assemble(connection, cancellation)?;
        runtime.spawn(dispatcher::run(
            Arc::clone(&client.shared),
            client.cancellation.clone(),
        ));
        client.runtime = Some(runtime);
        Ok(client)
    }

    fn assemble(
        mut self,
        connection: Box<dyn MqttConnection>,
        cancellation: CancellationToken,
    ) -> Result<ProvisioningClient, ProvisioningError> {
        if self.endpoint.is_empty() {
            return Err(ProvisioningError::InvalidParameter("endpoint"));
        }
        if self.id_scope.is_empty() {
            return Err(ProvisioningError::InvalidParameter("id_scope"));
        }
        if self.registration_id.is_empty() {
            return Err(ProvisioningError::InvalidParameter("registration_id"));
        }

        let symmetric_key = self.symmetric_key.take();
        let credentials =
            Credentials::new(dps::user_name(&self.id_scope, &self.registration_id))?;

        let shared = Arc::new(Shared {
            config: ClientConfig {
                endpoint: self.endpoint,
                id_scope: self.id_scope,
                registration_id: self.registration_id,
                connect_timeout: self.connect_timeout,
                keep_alive: self.keep_alive,
                trusted_certificate: self.trusted_certificate,
            },
            context: Mutex::new(Context {
                state: State::Init,
                result: None,
                credentials,
                device_certificate: self.device_certificate,
                connection,
                last_response: None,
                current_response: None,
                retry_countdown: 0,
                on_complete: self.completion_callback,
            }),
            completion: Condvar::new(),
            events: events::EventSet::default(),
        });

        let client = ProvisioningClient {
            shared,
            runtime: None,
            cancellation,
        };

        if let Some(key) = symmetric_key {
            client.set_symmetric_key(&key)?;
        }

        Ok(client)
    }

    #[cfg(test)]
    pub(crate) fn build_for_test(
        self,
        connection: Box<dyn MqttConnection>,
    ) -> Result<ProvisioningClient, ProvisioningError> {
        self.assemble(connection, CancellationToken::new())
    }

    #[cfg(test)]
    pub(crate) fn build_for_test_with_dispatcher(
        self,
        connection: Box<dyn MqttConnection>,
    ) -> Result<ProvisioningClient, ProvisioningError> {
        self.start(new_runtime()?, CancellationToken::new(), connection)
    }
}

fn new_runtime() -> Result<Runtime, ProvisioningError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .map_err(|e| ProvisioningError::SdkCore(format!("unable to build tokio runtime: {e}")))
}

/// A client performing one device registration against the Device
/// Provisioning Service.
///
/// The protocol runs in the background on a dispatcher task; callers
/// observe it through [`register`](ProvisioningClient::register) and, on
/// success, read the assignment with
/// [`iothub_device_info`](ProvisioningClient::iothub_device_info).
pub struct ProvisioningClient {
    shared: Arc<Shared>,
    runtime: Option<Runtime>,
    cancellation: CancellationToken,
}

impl ProvisioningClient {
    /// Starts the registration if it has not started yet and waits up to
    /// `wait` for a terminal outcome.
    ///
    /// Returns `Ok(())` once the device is assigned,
    /// [`ProvisioningError::Pending`] when the wait expires while the
    /// protocol keeps running in the background (a later call observes the
    /// same registration; there is no restart), or the latched error of a
    /// failed registration.
    pub fn register(&self, wait: Duration) -> Result<(), ProvisioningError> {
        let mut context = self.shared.lock();

        if context.state == State::Init {
            // The protocol starts on the first register call.
            self.shared.update_state(&mut context, StepOutcome::InProgress);
            self.shared.events.post(events::CONNECT);
        }

        if !wait.is_zero() && context.state.is_in_progress() {
            let (guard, _) = self
                .shared
                .completion
                .wait_timeout_while(context, wait, |context| context.state.is_in_progress())
                .unwrap_or_else(PoisonError::into_inner);
            context = guard;
        }

        match context.state {
            State::Done => Ok(()),
            State::Error => match context.result.clone() {
                Some(Err(e)) => Err(e),
                _ => Err(ProvisioningError::Disconnected),
            },
            _ => Err(ProvisioningError::Pending),
        }
    }

    /// Derives a SAS token from the base64-encoded symmetric enrollment
    /// key and installs it as the MQTT password, valid for one hour.
    pub fn set_symmetric_key(&self, symmetric_key: &str) -> Result<(), ProvisioningError> {
        if symmetric_key.is_empty() {
            return Err(ProvisioningError::InvalidParameter("symmetric_key"));
        }
        let key = BASE64
            .decode(symmetric_key)
            .map_err(|_| ProvisioningError::InvalidParameter("symmetric_key"))?;

        let config = &self.shared.config;
        let expiry = Utc::now().timestamp() + TOKEN_EXPIRY_SECS;
        let to_sign = dps::sas::signature(&config.id_scope, &config.registration_id, expiry);

        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC accepts keys of any length");
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        let signature = urlencoding::encode(&signature);

        let password =
            dps::sas::password(&config.id_scope, &config.registration_id, &signature, expiry);

        self.shared.lock().credentials.set_sas_token(password)
    }

    /// Installs the X.509 device identity presented during the TLS
    /// handshake.
    pub fn set_device_certificate(
        &self,
        certificate: DeviceCertificate,
    ) -> Result<(), ProvisioningError> {
        if certificate.certificate_pem.is_empty() || certificate.private_key_pem.is_empty() {
            return Err(ProvisioningError::InvalidParameter("certificate"));
        }
        self.shared.lock().device_certificate = Some(certificate);
        Ok(())
    }

    /// Installs the callback invoked on the terminal transition. Replaces
    /// a previously installed callback.
    pub fn set_completion_callback(
        &self,
        callback: impl FnOnce(Result<(), ProvisioningError>) + Send + 'static,
    ) {
        self.shared.lock().on_complete = Some(Box::new(callback));
    }

    /// Returns the assignment of a successfully registered device, or
    /// [`ProvisioningError::WrongState`] while the registration has not
    /// succeeded.
    pub fn iothub_device_info(&self) -> Result<IotHubDeviceInfo, ProvisioningError> {
        let context = self.shared.lock();
        if context.state != State::Done {
            return Err(ProvisioningError::WrongState);
        }
        let response = context
            .current_response
            .as_ref()
            .ok_or(ProvisioningError::WrongState)?;

        Ok(IotHubDeviceInfo {
            iothub_hostname: response.assigned_hub().to_owned(),
            device_id: response.device_id().to_owned(),
        })
    }

    /// Copies the assignment into caller-provided buffers, the way
    /// C-style consumers expect it: the hostname is NUL-terminated, the
    /// device ID is not. Returns the hostname and device-ID lengths, the
    /// NUL excluded, or [`ProvisioningError::InsufficientBuffer`] when a
    /// buffer is too small.
    pub fn iothub_device_info_into(
        &self,
        iothub_hostname: &mut [u8],
        device_id: &mut [u8],
    ) -> Result<(usize, usize), ProvisioningError> {
        let context = self.shared.lock();
        if context.state != State::Done {
            return Err(ProvisioningError::WrongState);
        }
        let response = context
            .current_response
            .as_ref()
            .ok_or(ProvisioningError::WrongState)?;

        let hostname = response.assigned_hub().as_bytes();
        let device = response.device_id().as_bytes();

        // The hostname needs one extra byte for the terminator.
        if hostname.len() >= iothub_hostname.len() || device.len() > device_id.len() {
            return Err(ProvisioningError::InsufficientBuffer);
        }

        iothub_hostname[..hostname.len()].copy_from_slice(hostname);
        iothub_hostname[hostname.len()] = 0;
        device_id[..device.len()].copy_from_slice(device);

        Ok((hostname.len(), device.len()))
    }

    /// Tears the client down: wakes every waiter with a terminal outcome,
    /// disconnects from the service and stops the background tasks.
    /// Dropping the client has the same effect.
    pub fn deinitialize(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        {
            let mut context = self.shared.lock();
            context.on_complete = None;
            if !context.state.is_terminal() {
                context.state = State::Error;
                if context.result.is_none() {
                    context.result = Some(Err(ProvisioningError::Disconnected));
                }
            }
            context.last_response = None;
            context.current_response = None;
            context.connection.disconnect();
            self.shared.completion.notify_all();
        }

        self.cancellation.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for ProvisioningClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::thread;

    use crate::connection::{ConnectSettings, ConnectionHandler, MqttMessage};
    use crate::error::TransportError;

    use super::*;

    const ASSIGNED_TOPIC: &str = "$dps/registrations/res/200/?$rid=1";
    const ASSIGNED_PAYLOAD: &str = r#"{"operationId":"4.op1","status":"assigned","registrationState":{"assignedHub":"hub1.azure-devices.net","deviceId":"mydev"}}"#;
    const ASSIGNING_TOPIC: &str = "$dps/registrations/res/202/?$rid=1&retry-after=3";
    const ASSIGNING_PAYLOAD: &str = r#"{"operationId":"op2","status":"assigning"}"#;

    #[derive(Default)]
    struct MockState {
        handler: Option<Arc<dyn ConnectionHandler>>,
        connect_count: usize,
        subscriptions: Vec<String>,
        publishes: Vec<String>,
        auto_respond: bool,
    }

    /// Scripted MQTT layer: records every operation and, in auto mode,
    /// raises the notifications a cooperative service would.
    #[derive(Clone)]
    struct MockConnection {
        state: Arc<StdMutex<MockState>>,
    }

    impl MockConnection {
        fn new(auto_respond: bool) -> MockConnection {
            MockConnection {
                state: Arc::new(StdMutex::new(MockState {
                    auto_respond,
                    ..MockState::default()
                })),
            }
        }

        fn connect_count(&self) -> usize {
            self.state.lock().unwrap().connect_count
        }

        fn publishes(&self) -> Vec<String> {
            self.state.lock().unwrap().publishes.clone()
        }

        fn subscriptions(&self) -> Vec<String> {
            self.state.lock().unwrap().subscriptions.clone()
        }
    }

    impl MqttConnection for MockConnection {
        fn connect(
            &mut self,
            _settings: ConnectSettings,
            handler: Arc<dyn ConnectionHandler>,
        ) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.connect_count += 1;
            state.handler = Some(Arc::clone(&handler));
            if state.auto_respond {
                // Acknowledge from another thread, the way the MQTT layer
                // would.
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    handler.connect_notify(true);
                });
            }
            Ok(())
        }

        fn subscribe(&mut self, topic_filter: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.push(topic_filter.to_owned());
            Ok(())
        }

        fn publish(&mut self, topic: &str, _payload: Vec<u8>) -> Result<(), TransportError> {
            let mut state = self.state.lock().unwrap();
            state.publishes.push(topic.to_owned());
            if state.auto_respond {
                let handler = state.handler.clone().expect("publish before connect");
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    handler.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
                });
            }
            Ok(())
        }

        fn disconnect(&mut self) {}
    }

    fn message(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_owned(),
            payload: payload.as_bytes().to_vec(),
        }
    }

    fn builder() -> ProvisioningClientBuilder {
        ProvisioningClientBuilder::new("global.azure-devices-provisioning.net", "0ne00000001", "mydev")
    }

    fn client_with_mock() -> (ProvisioningClient, MockConnection) {
        let mock = MockConnection::new(false);
        let client = builder()
            .build_for_test(Box::new(mock.clone()))
            .expect("Unable to build test client");
        (client, mock)
    }

    /// Drains the pending events and runs one dispatch pass, the same code
    /// path the dispatcher task runs.
    fn pump(client: &ProvisioningClient) {
        let pending = client.shared.events.drain();
        dispatcher::dispatch(&client.shared, pending, false);
    }

    fn tick(client: &ProvisioningClient) {
        let pending = client.shared.events.drain();
        dispatcher::dispatch(&client.shared, pending, true);
    }

    fn state_of(client: &ProvisioningClient) -> State {
        client.shared.lock().state
    }

    /// Drives the client from INIT to WAITING_FOR_RESPONSE with the first
    /// register request published.
    fn drive_to_waiting(client: &ProvisioningClient, mock: &MockConnection) {
        assert!(matches!(
            client.register(Duration::ZERO),
            Err(ProvisioningError::Pending)
        ));
        pump(client); // CONNECT
        assert_eq!(mock.connect_count(), 1);
        client.shared.connect_notify(true);
        pump(client); // SUBSCRIBE
        assert_eq!(mock.subscriptions(), vec!["$dps/registrations/res/#"]);
        pump(client); // REQUEST
        assert_eq!(
            mock.publishes(),
            vec!["$dps/registrations/PUT/iotdps-register/?$rid=1"]
        );
        assert_eq!(state_of(client), State::WaitingForResponse);
    }

    #[test]
    fn register_returns_assignment_on_immediate_success() {
        let mock = MockConnection::new(true);
        let client = builder()
            .build_for_test_with_dispatcher(Box::new(mock.clone()))
            .expect("Unable to build test client");

        client
            .register(Duration::from_secs(600))
            .expect("registration should succeed");

        let info = client.iothub_device_info().expect("assignment must be readable");
        assert_eq!(info.iothub_hostname, "hub1.azure-devices.net");
        assert_eq!(info.device_id, "mydev");
    }

    #[test]
    fn copies_device_info_with_nul_terminated_hostname() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);
        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        pump(&client);

        let mut hostname = [0xffu8; 64];
        let mut device = [0u8; 64];
        let (hostname_len, device_len) = client
            .iothub_device_info_into(&mut hostname, &mut device)
            .expect("buffers are large enough");
        assert_eq!(&hostname[..hostname_len], b"hub1.azure-devices.net");
        assert_eq!(hostname[hostname_len], 0);
        assert_eq!(&device[..device_len], b"mydev");

        // The hostname buffer must fit the terminator too.
        let mut exact = [0u8; 22];
        let mut device = [0u8; 5];
        assert!(matches!(
            client.iothub_device_info_into(&mut exact, &mut device),
            Err(ProvisioningError::InsufficientBuffer)
        ));
        let mut with_nul = [0u8; 23];
        client
            .iothub_device_info_into(&mut with_nul, &mut device)
            .expect("exact-size device buffer is enough");
    }

    #[test]
    fn polls_with_query_status_until_assigned() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        client
            .shared
            .receive_notify(message(ASSIGNING_TOPIC, ASSIGNING_PAYLOAD));
        pump(&client);
        assert_eq!(state_of(&client), State::Request);

        // The request fires on the tick where the countdown would reach
        // zero: exactly three ticks for retry-after=3.
        tick(&client);
        tick(&client);
        assert_eq!(client.shared.events.pending(), 0);
        tick(&client);
        assert_eq!(client.shared.events.pending(), events::REQUEST);
        assert_eq!(state_of(&client), State::Request);

        pump(&client);
        let publishes = mock.publishes();
        assert_eq!(publishes.len(), 2);
        assert_eq!(
            publishes[1],
            "$dps/registrations/GET/iotdps-get-operationstatus/?$rid=1&operationId=op2"
        );

        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        pump(&client);
        client.register(Duration::ZERO).expect("assignment reached");
    }

    #[test]
    fn server_error_without_retry_is_terminal() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        client.shared.receive_notify(message(
            "$dps/registrations/res/429/?$rid=1&retry-after=0",
            r#"{"operationId":"op3","status":"failed"}"#,
        ));
        pump(&client);

        assert!(matches!(
            client.register(Duration::ZERO),
            Err(ProvisioningError::ServerResponse { status: 429 })
        ));
        assert!(matches!(
            client.iothub_device_info(),
            Err(ProvisioningError::WrongState)
        ));
    }

    #[test]
    fn disconnect_mid_flight_fails_and_latches() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        client.shared.disconnect_notify();
        pump(&client);
        assert!(matches!(
            client.register(Duration::ZERO),
            Err(ProvisioningError::Disconnected)
        ));

        // Once terminal, further events are no-ops.
        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        pump(&client);
        tick(&client);
        assert_eq!(state_of(&client), State::Error);
        assert!(matches!(
            client.register(Duration::ZERO),
            Err(ProvisioningError::Disconnected)
        ));
    }

    #[test]
    fn response_in_the_same_pass_beats_the_disconnect() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        // Both events land before the next dispatch pass; the fixed
        // handler order delivers the response first.
        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        client.shared.disconnect_notify();
        pump(&client);

        client.register(Duration::ZERO).expect("late response still wins");
    }

    #[test]
    fn wait_expires_but_the_protocol_continues() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        assert!(matches!(
            client.register(Duration::from_millis(50)),
            Err(ProvisioningError::Pending)
        ));

        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        pump(&client);

        client
            .register(Duration::from_secs(600))
            .expect("second register observes the latched outcome");
        // No second protocol start happened.
        assert_eq!(mock.connect_count(), 1);
    }

    #[test]
    fn duplicate_responses_are_dropped() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        client
            .shared
            .receive_notify(message(ASSIGNING_TOPIC, ASSIGNING_PAYLOAD));
        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        pump(&client);

        // Only the first response reached the handler.
        assert_eq!(state_of(&client), State::Request);
        assert_eq!(client.shared.lock().retry_countdown, 3);
        assert!(client.shared.lock().last_response.is_none());
    }

    #[test]
    fn oversized_responses_are_refused() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        let oversized = "x".repeat(dispatcher::RESPONSE_PAYLOAD_MAX + 1);
        client.shared.receive_notify(message(ASSIGNED_TOPIC, &oversized));
        pump(&client);

        assert!(matches!(
            client.register(Duration::ZERO),
            Err(ProvisioningError::MessageTooLong)
        ));
    }

    #[test]
    fn malformed_responses_are_terminal() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        client.shared.receive_notify(message(ASSIGNED_TOPIC, "not json"));
        pump(&client);

        assert!(matches!(
            client.register(Duration::ZERO),
            Err(ProvisioningError::SdkCore(_))
        ));
    }

    #[test]
    fn completion_callback_fires_exactly_once() {
        let (client, mock) = client_with_mock();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in_callback = Arc::clone(&calls);
        client.set_completion_callback(move |result| {
            assert!(result.is_ok());
            calls_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        drive_to_waiting(&client, &mock);
        client.shared.receive_notify(message(ASSIGNED_TOPIC, ASSIGNED_PAYLOAD));
        pump(&client);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        client.shared.disconnect_notify();
        pump(&client);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_result_is_latched() {
        let (client, _mock) = client_with_mock();
        let mut context = client.shared.lock();
        client
            .shared
            .update_state(&mut context, StepOutcome::Failed(ProvisioningError::Disconnected));
        client.shared.update_state(&mut context, StepOutcome::Assigned);
        assert_eq!(context.state, State::Error);
        assert!(matches!(context.result, Some(Err(ProvisioningError::Disconnected))));
    }

    #[test]
    fn builder_rejects_empty_identity() {
        let mock = MockConnection::new(false);
        let result = ProvisioningClientBuilder::new("", "scope", "dev")
            .build_for_test(Box::new(mock.clone()));
        assert!(matches!(result, Err(ProvisioningError::InvalidParameter("endpoint"))));

        let result = ProvisioningClientBuilder::new("endpoint", "scope", "")
            .build_for_test(Box::new(mock));
        assert!(matches!(
            result,
            Err(ProvisioningError::InvalidParameter("registration_id"))
        ));
    }

    #[test]
    fn symmetric_key_installs_a_registration_sas_token() {
        let (client, _mock) = client_with_mock();
        client
            .set_symmetric_key("a2V5")
            .expect("valid base64 key must be accepted");

        let context = client.shared.lock();
        let sas = context.credentials.sas_token.as_ref().expect("token installed");
        assert!(sas.starts_with("SharedAccessSignature sr=0ne00000001%2Fregistrations%2Fmydev&sig="));
        assert!(sas.contains("&se="));
        assert!(sas.ends_with("&skn=registration"));
    }

    #[test]
    fn symmetric_key_must_be_base64() {
        let (client, _mock) = client_with_mock();
        assert!(matches!(
            client.set_symmetric_key("%%%"),
            Err(ProvisioningError::InvalidParameter("symmetric_key"))
        ));
        assert!(matches!(
            client.set_symmetric_key(""),
            Err(ProvisioningError::InvalidParameter("symmetric_key"))
        ));
    }

    #[test]
    fn terminal_failure_wakes_parked_waiters() {
        let (client, mock) = client_with_mock();
        drive_to_waiting(&client, &mock);

        let client = Arc::new(client);
        let waiter = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.register(Duration::from_secs(30)))
        };
        // Let the waiter park before failing the registration.
        thread::sleep(Duration::from_millis(50));

        {
            let mut context = client.shared.lock();
            client.shared.update_state(
                &mut context,
                StepOutcome::Failed(ProvisioningError::Disconnected),
            );
        }

        let result = waiter.join().expect("waiter must not panic");
        assert!(matches!(result, Err(ProvisioningError::Disconnected)));
    }
}
