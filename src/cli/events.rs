use crate::service::EventClient;
use crate::store::event::parse_details;
use chrono::{DateTime, Utc};

pub async fn add(
    service_url: &str,
    event_type: &str,
    details: Option<&str>,
    timestamp: Option<DateTime<Utc>>,
) -> Result<(), Box<dyn std::error::Error>> {
    let details = parse_details(details.unwrap_or_default())?;
    let client = EventClient::new(service_url)?;
    let result = client
        .add(event_type, &details, timestamp.unwrap_or_else(Utc::now))
        .await?;

    match result.key {
        Some(key) => println!("Stored event {}", key),
        None => println!("Event suppressed by rate limiter"),
    }
    Ok(())
}

pub async fn get(service_url: &str, key: u64) -> Result<(), Box<dyn std::error::Error>> {
    let client = EventClient::new(service_url)?;
    let event = client.get_event(key).await?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

pub async fn keys(service_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = EventClient::new(service_url)?;
    for key in client.get_keys().await? {
        println!("{}", key);
    }
    Ok(())
}

pub async fn delete(service_url: &str, key: u64) -> Result<(), Box<dyn std::error::Error>> {
    let client = EventClient::new(service_url)?;
    client.delete(key).await?;
    println!("Deleted event {}", key);
    Ok(())
}

pub async fn upload_now(service_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = EventClient::new(service_url)?;
    client.upload_now().await?;
    println!("Upload requested");
    Ok(())
}
