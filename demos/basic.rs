//! Minimal round-trip against a running mod instance.

use modlink::{Command, LinkClient, LinkOptions};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = LinkOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        .with_read_timeout(Duration::from_secs(5));

    let client = LinkClient::connect("localhost:4711", options).await?;

    client.post_chat("Hello from Rust!").await?;

    let block = client.get_block(0, 64, 0).await?;
    println!("Block at (0, 64, 0): {}", block.kind);

    let pos = client.player_position().await?;
    println!("Player at {}", pos);

    client.set_block(0, 65, 0, "stone").await?;
    println!("Placed stone above the origin");

    // Raw command access for anything the typed surface does not cover.
    let result = client
        .submit(Command::new("world.get_height").arg((0i64, 0i64, 0i64)))
        .await?;
    println!("world.get_height -> {:?}", result);

    Ok(())
}
