//! Two services sharing one broker: the doctor service answers
//! `doctor.check_schedule` by asking the auth service to verify the caller's
//! token, then announces the lookup as a domain event.
//!
//! Runs against the in-process broker by default; set `RABBITMQ_URL` to use
//! a real one.
//!
//! ```text
//! RUST_LOG=bookmesh=debug cargo run --example doctor_service
//! ```

use bookmesh::naming::{exchange_name, AUTH_VERIFY_TOKEN, DOCTOR_CHECK_SCHEDULE};
use bookmesh::{
    BridgeError, Deadline, EventOptions, ExchangeKind, MemoryBroker, Request, Service, ServiceConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckScheduleRequest {
    schedule_id: String,
    token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Schedule {
    id: String,
    is_available: bool,
}

fn build(name: &str, broker: Option<&MemoryBroker>) -> anyhow::Result<Service> {
    Ok(match broker {
        Some(broker) => Service::in_memory(name, broker.clone()),
        None => Service::new(ServiceConfig::from_env(name)?),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let broker = std::env::var("RABBITMQ_URL")
        .is_err()
        .then(MemoryBroker::new);

    let auth = build("auth-service", broker.as_ref())?;
    auth.connect().await?;
    auth.register_function(AUTH_VERIFY_TOKEN, |request: Request| async move {
        match request.field("token").and_then(|t| t.as_str()) {
            Some("demo-token") => Ok(json!({ "userId": "U1", "role": "patient" })),
            _ => Err(BridgeError::handler_error("invalid token")),
        }
    })
    .await?;

    let doctor = build("doctor-service", broker.as_ref())?;
    doctor.connect().await?;

    let client = doctor.client();
    let events = doctor.events();
    doctor
        .register_function(DOCTOR_CHECK_SCHEDULE, move |request: Request| {
            let client = client.clone();
            let events = events.clone();
            async move {
                let params: CheckScheduleRequest = request.deserialize_payload()?;
                let deadline = request
                    .deadline
                    .unwrap_or_else(|| Deadline::after(Duration::from_secs(2)));

                let claims = client
                    .call_within(AUTH_VERIFY_TOKEN, json!({ "token": params.token }), deadline)
                    .await?;
                if claims.is_failure() {
                    return Err(BridgeError::handler_error("caller not authenticated"));
                }

                events
                    .publish_event(
                        &exchange_name("doctor"),
                        ExchangeKind::Fanout,
                        "doctor.schedule_checked",
                        json!({ "scheduleId": params.schedule_id }),
                        EventOptions::default(),
                    )
                    .await?;

                Ok(Schedule {
                    id: params.schedule_id,
                    is_available: true,
                })
            }
        })
        .await?;

    let caller = doctor.client();
    for token in ["demo-token", "stolen-token"] {
        let reply = caller
            .call_within(
                DOCTOR_CHECK_SCHEDULE,
                json!({ "scheduleId": "S1", "token": token }),
                Deadline::after(Duration::from_secs(3)),
            )
            .await?;

        match reply.decode::<Schedule>()? {
            Some(schedule) => info!("Schedule {} available: {}", schedule.id, schedule.is_available),
            None => warn!("Schedule lookup with {} returned no result", token),
        }
    }

    info!("Doctor service stats: {:?}", doctor.stats().await);

    doctor.shutdown().await?;
    auth.shutdown().await?;
    Ok(())
}
