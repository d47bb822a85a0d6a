//! Basic session example
//!
//! Usage:
//!   STOREFRONT_API_URL=http://localhost:8080 STOREFRONT_SESSION_SECRET=dev \
//!   ACCESS_TOKEN=... REFRESH_TOKEN=... cargo run --example basic_send

use serde_json::{json, Value};
use storefront_rs_client::{
    ApiClient, ApiRequest, CredentialEnvelope, CredentialStore, PaymentsApi, SessionClient,
    SessionConfig, SessionEvent, StoreConfig,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SessionConfig::from_env()?;
    let store = CredentialStore::from_config(&StoreConfig::from_env()?)?;

    println!("=== Storefront Rust Client Example ===");
    println!("Endpoint: {}", config.base_url);
    println!();

    let client = SessionClient::connect(config, store)?;

    // Redirect-to-login hook
    let mut events = client.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::Expired { reason } = event {
                println!("! Session expired ({reason}), please sign in again");
            }
        }
    });

    // Seed a session from the environment if the store is empty
    if client.store().load().is_none() {
        let access = std::env::var("ACCESS_TOKEN")?;
        let refresh = std::env::var("REFRESH_TOKEN")?;
        client.sign_in(CredentialEnvelope::new(access, refresh, "demo-admin")?)?;
        println!("✓ Session stored");
    }

    // Any authenticated call; an expired token is refreshed transparently
    let response = client.send(ApiRequest::get("/orders")).await?;
    println!("GET /orders -> {}", response.status);
    println!();

    // Critical payment call under its retry budget
    let payments = PaymentsApi::new(client.clone());
    match payments
        .create_order::<_, Value>(&json!({ "amount": 4200, "currency": "INR" }))
        .await
    {
        Ok(order) => println!("✓ Payment order created: {order}"),
        Err(e) => {
            println!("! Failed to create payment order: {e}");
            payments
                .record_failure(&json!({ "stage": "create-order", "error": e.to_string() }))
                .await;
        }
    }

    Ok(())
}
