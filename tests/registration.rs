//! End-to-end registration against a live Device Provisioning Service
//! instance. Needs an individual enrollment with a symmetric key and the
//! following environment variables:
//!
//! - `AZIOT_PROVISIONING_TEST_ENDPOINT` (defaults to the global endpoint)
//! - `AZIOT_PROVISIONING_TEST_ID_SCOPE`
//! - `AZIOT_PROVISIONING_TEST_REGISTRATION_ID`
//! - `AZIOT_PROVISIONING_TEST_SYMMETRIC_KEY`

use std::time::Duration;

use aziot_provisioning::ProvisioningClientBuilder;

#[test]
#[ignore]
fn registers_against_live_dps() {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("rumqtt=warn,debug"),
    )
    .init();

    let endpoint = std::env::var("AZIOT_PROVISIONING_TEST_ENDPOINT")
        .unwrap_or_else(|_| String::from("global.azure-devices-provisioning.net"));
    let id_scope = std::env::var("AZIOT_PROVISIONING_TEST_ID_SCOPE")
        .expect("The environment variable AZIOT_PROVISIONING_TEST_ID_SCOPE is not set.");
    let registration_id = std::env::var("AZIOT_PROVISIONING_TEST_REGISTRATION_ID")
        .expect("The environment variable AZIOT_PROVISIONING_TEST_REGISTRATION_ID is not set.");
    let symmetric_key = std::env::var("AZIOT_PROVISIONING_TEST_SYMMETRIC_KEY")
        .expect("The environment variable AZIOT_PROVISIONING_TEST_SYMMETRIC_KEY is not set.");

    let client = ProvisioningClientBuilder::new(endpoint, id_scope, registration_id)
        .with_symmetric_key(symmetric_key)
        .build()
        .expect("Unable to create the provisioning client");

    client
        .register(Duration::from_secs(600))
        .expect("The registration did not complete");

    let info = client
        .iothub_device_info()
        .expect("The assignment must be readable after a successful registration");
    println!("{info:#?}");
}
