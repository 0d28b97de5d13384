//! Subscribes to world events and mirrors them with cached snapshots.

use modlink::{LinkClient, LinkOptions};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modlink=debug".into()),
        )
        .init();

    let client = LinkClient::connect("localhost:4711", LinkOptions::new()).await?;
    let mut events = client.subscribe();

    println!("Watching world events (ctrl-c to stop)...");
    loop {
        let event = events.recv().await?;
        println!("[{}] {} {:?}", event.target, event.name, event.args);

        // The event already updated the cache, so this is a local read.
        let snapshot = client.snapshot(&event.target).await?;
        println!("  snapshot v{}: {}", snapshot.version, snapshot.attrs);
    }
}
