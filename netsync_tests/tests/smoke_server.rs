use netsync_shared::net::{read_frame, write_frame, ClientMsg, ServerMsg};
use netsync_tests::spawn_server;
use tokio::net::TcpStream;

/// Smoke test: server answers a raw status request and shuts down cleanly.
#[tokio::test]
async fn server_answers_status_over_raw_socket() -> anyhow::Result<()> {
    let server = spawn_server(8).await?;
    let mut stream = TcpStream::connect(server.local_addr()).await?;

    write_frame(&mut stream, &ClientMsg::RequestServerStatus {}, None).await?;
    let reply: Option<ServerMsg> = read_frame(&mut stream).await?;
    let Some(ServerMsg::ServerStatus(status)) = reply else {
        anyhow::bail!("expected serverStatus, got {reply:?}");
    };
    assert!(status.online);
    assert_eq!(status.max_players, 8);
    assert_eq!(status.current_players, 0);
    assert!(status.has_space);

    server.shutdown().await;
    let reply: Option<ServerMsg> = read_frame(&mut stream).await?;
    assert!(matches!(reply, Some(ServerMsg::Disconnect { reason }) if reason == "server-close"));
    Ok(())
}
