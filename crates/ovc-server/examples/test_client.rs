// Quick integration probe: connect to a running server, authenticate with a
// code minted via /vc login, exercise the group surface, then disconnect.
// Run with: cargo run -p ovc-server --example test_client -- alice ABCDEF

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use ovc_protocol::signal::{ClientMessage, ServerMessage};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let username = args.next().unwrap_or_else(|| "alice".into());
    let auth_code = args.next().unwrap_or_else(|| "ABCDEF".into());

    let (ws, _) = connect_async("ws://127.0.0.1:9090/voice").await?;
    println!("[OK] connected to ws://127.0.0.1:9090/voice");
    let (mut sink, mut stream) = ws.split();

    send(
        &mut sink,
        &ClientMessage::Authenticate {
            username,
            auth_code,
        },
    )
    .await?;
    println!("[OK] sent authenticate");
    read_and_print(&mut stream).await?;

    send(
        &mut sink,
        &ClientMessage::CreateGroup {
            group_name: "probe".into(),
            settings: None,
        },
    )
    .await?;
    println!("[OK] sent create_group");
    read_and_print(&mut stream).await?;

    send(&mut sink, &ClientMessage::Ping { timestamp: 12345 }).await?;
    println!("[OK] sent ping");
    read_and_print(&mut stream).await?;

    send(&mut sink, &ClientMessage::Disconnect {}).await?;
    println!("[OK] sent disconnect");

    Ok(())
}

async fn send<S>(sink: &mut S, msg: &ClientMessage) -> Result<(), Box<dyn std::error::Error>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + 'static,
{
    sink.send(Message::Text(serde_json::to_string(msg)?)).await?;
    Ok(())
}

async fn read_and_print<S>(stream: &mut S) -> Result<(), Box<dyn std::error::Error>>
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    // Keep reading until the server goes quiet for half a second.
    loop {
        match timeout(Duration::from_millis(500), stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => println!("  <- {msg:?}"),
                    Err(_) => println!("  <- (unparsed) {text}"),
                }
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Ok(()),
            Err(_) => return Ok(()),
        }
    }
}
