//! Agent-side scenarios against hand-rolled fake tunnel servers.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use tunnel_agent::{AgentConfig, TunnelAgent};

const WAIT: Duration = Duration::from_secs(5);

fn start_agent(tunnel_addr: String, server_addr: String, worker_count: usize) -> TunnelAgent {
    let config = AgentConfig {
        tunnel_addr,
        server_addr,
        worker_count,
        keep_alive_period: Duration::from_secs(20),
    };
    let mut agent = TunnelAgent::new(config).expect("create agent");
    agent.start();
    agent
}

/// Reserve an address nothing listens on.
async fn unreachable_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    addr.to_string()
}

#[tokio::test]
async fn workers_survive_an_unreachable_server() {
    // Every dial is refused; the workers must keep looping (with
    // backoff) and still drain promptly on shutdown.
    let tunnel_addr = unreachable_addr().await;
    let backend_addr = unreachable_addr().await;

    let agent = start_agent(tunnel_addr, backend_addr, 2);
    sleep(Duration::from_millis(300)).await;

    timeout(WAIT, agent.shutdown()).await.expect("agent drain");
}

#[tokio::test]
async fn wrong_greeting_is_dropped_and_redialed() {
    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tunnel");
    let tunnel_addr = tunnel_listener.local_addr().expect("tunnel addr");
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let backend_addr = backend_listener.local_addr().expect("backend addr");

    let agent = start_agent(tunnel_addr.to_string(), backend_addr.to_string(), 1);

    // First contact: greet with a wrong byte. The agent must close the
    // socket without replying.
    let (mut bad, _) = timeout(WAIT, tunnel_listener.accept())
        .await
        .expect("no first dial")
        .expect("accept");
    bad.write_all(&[0x09]).await.expect("bad greeting");
    let mut buf = [0u8; 1];
    let n = timeout(WAIT, bad.read(&mut buf))
        .await
        .expect("agent did not close bad tunnel")
        .expect("read");
    assert_eq!(n, 0, "agent should close a mis-greeted tunnel");

    // The worker redials immediately; the proper greeting earns the
    // reply byte and a backend connection.
    let (mut good, _) = timeout(WAIT, tunnel_listener.accept())
        .await
        .expect("no redial")
        .expect("accept");
    good.write_all(&[0x01]).await.expect("greeting");
    timeout(WAIT, good.read_exact(&mut buf))
        .await
        .expect("no handshake reply")
        .expect("read reply");
    assert_eq!(buf[0], 0x02);

    let (_backend_conn, _) = timeout(WAIT, backend_listener.accept())
        .await
        .expect("agent did not dial the backend")
        .expect("backend accept");

    timeout(WAIT, agent.shutdown()).await.expect("agent drain");
}

#[tokio::test]
async fn tunnel_bytes_reach_the_backend() {
    let tunnel_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind tunnel");
    let tunnel_addr = tunnel_listener.local_addr().expect("tunnel addr");
    let backend_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind backend");
    let backend_addr = backend_listener.local_addr().expect("backend addr");

    let agent = start_agent(tunnel_addr.to_string(), backend_addr.to_string(), 1);

    let (mut tunnel, _) = timeout(WAIT, tunnel_listener.accept())
        .await
        .expect("no dial")
        .expect("accept");
    tunnel.write_all(&[0x01]).await.expect("greeting");
    let mut buf = [0u8; 1];
    timeout(WAIT, tunnel.read_exact(&mut buf))
        .await
        .expect("no handshake reply")
        .expect("read reply");
    assert_eq!(buf[0], 0x02);

    let (mut backend_conn, _) = timeout(WAIT, backend_listener.accept())
        .await
        .expect("agent did not dial the backend")
        .expect("backend accept");

    // Application bytes flow only after the handshake, in both
    // directions.
    tunnel.write_all(b"knock").await.expect("tunnel write");
    let mut knock = [0u8; 5];
    timeout(WAIT, backend_conn.read_exact(&mut knock))
        .await
        .expect("payload did not reach backend")
        .expect("backend read");
    assert_eq!(&knock, b"knock");

    backend_conn.write_all(b"reply").await.expect("backend write");
    let mut reply = [0u8; 5];
    timeout(WAIT, tunnel.read_exact(&mut reply))
        .await
        .expect("payload did not reach tunnel")
        .expect("tunnel read");
    assert_eq!(&reply, b"reply");

    timeout(WAIT, agent.shutdown()).await.expect("agent drain");
}
