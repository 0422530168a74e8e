// ABOUTME: Example: subscribe to a change-event topic and print decoded events.
// ABOUTME: Reads credentials from the environment; see the variable names below.

use grapevine_auth::AuthConfig;
use grapevine_client::{ChannelConfig, Client, ReplayStart, SubscriptionNotice};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let endpoint = std::env::var("GRAPEVINE_ENDPOINT")
        .unwrap_or_else(|_| "https://api.pubsub.example.com:7443".to_string());
    let topic = std::env::var("GRAPEVINE_TOPIC")
        .unwrap_or_else(|_| "/data/AccountChangeEvent".to_string());

    let auth = AuthConfig::UserSupplied {
        access_token: std::env::var("GRAPEVINE_ACCESS_TOKEN")?,
        instance_url: std::env::var("GRAPEVINE_INSTANCE_URL")?,
        organization_id: std::env::var("GRAPEVINE_ORG_ID").ok(),
    };

    let client = Client::connect(&auth, &ChannelConfig::new(endpoint)).await?;
    let mut subscription = client.subscribe(&topic, 10, ReplayStart::Latest).await?;

    while let Some(notice) = subscription.next().await {
        match notice {
            SubscriptionNotice::Data(event) => {
                println!("replay {} -> {}", event.replay_id, event.payload);
            }
            SubscriptionNotice::Error(e) => eprintln!("error: {e}"),
            SubscriptionNotice::Keepalive { latest_replay_id } => {
                eprintln!("keepalive (latest replay {latest_replay_id})");
            }
            SubscriptionNotice::LastEvent => {
                eprintln!("budget exhausted, requesting 10 more");
                subscription.request_more(10).await?;
            }
            SubscriptionNotice::Status(state) => {
                eprintln!("received {}/{}", state.received, state.requested);
            }
            SubscriptionNotice::End => {
                eprintln!("stream ended");
                break;
            }
        }
    }

    Ok(())
}
