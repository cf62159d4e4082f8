use std::{future::Future, sync::Arc};

use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    notify::{self, Delivery},
    request::Request,
    resp_value::{FrameError, RespValue},
    response::Response,
    state::State,
};

/// Accept connections until `shutdown` resolves.
///
/// Handlers run on the multi-threaded runtime: a write to a notifying store
/// may block on its subscriber and is moved off the reactor with
/// `block_in_place`.
pub async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "accepted connection");
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        warn!(%peer, error = %e, "connection closed with error");
                    }
                });
            }
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// Subscribe a fresh channel sink and log every key it receives on a
/// blocking task. The task ends once the store unsubscribes.
pub fn spawn_notification_drain(state: &State, delivery: Delivery) -> Option<JoinHandle<()>> {
    let store = state.notifying_store()?;
    let (sink, notifications) = notify::channel(delivery);
    store.subscribe(sink);

    Some(tokio::task::spawn_blocking(move || {
        for key in notifications {
            info!(key = %key, "key changed");
        }
        debug!("notification drain finished");
    }))
}

async fn handle_connection(mut stream: TcpStream, state: Arc<State>) -> anyhow::Result<()> {
    let mut input_buf = BytesMut::with_capacity(512);
    let mut output_buf = BytesMut::with_capacity(512);
    loop {
        if stream.read_buf(&mut input_buf).await? == 0 {
            if !input_buf.is_empty() {
                warn!(pending = input_buf.len(), "peer closed mid-frame");
            }
            return Ok(());
        }

        // A single read may hold several pipelined frames, or part of one.
        loop {
            output_buf.clear();
            let consumed = match RespValue::deserialize(&input_buf) {
                Ok((value, rest)) => {
                    let consumed = input_buf.len() - rest.len();
                    let response = match Request::parse(value) {
                        Ok(request) => {
                            debug!(?request, "handling request");
                            tokio::task::block_in_place(|| state.handle_request(&request))
                        }
                        Err(e) => {
                            debug!(error = %e, "rejected request");
                            Response::from(e)
                        }
                    };
                    response.serialize(&mut output_buf);
                    consumed
                }
                Err(FrameError::Incomplete) => break,
                Err(e) => {
                    // No way to find the next frame boundary after garbage.
                    Response::Error(format!("ERR protocol error: {e}")).serialize(&mut output_buf);
                    stream.write_all(&output_buf).await?;
                    return Err(e.into());
                }
            };
            stream.write_all(&output_buf).await?;
            input_buf.advance(consumed);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
        sync::oneshot,
        task::JoinHandle,
    };

    use super::{run, spawn_notification_drain};
    use crate::{config::StoreMode, notify::Delivery, state::State};

    async fn start(state: Arc<State>) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            run(listener, state, async move {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
        });
        (address, shutdown_tx, server)
    }

    fn command(args: &[&str]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", args.len());
        for arg in args {
            out.push_str(&format!("${}\r\n{}\r\n", arg.len(), arg));
        }
        out.into_bytes()
    }

    async fn read_exact_reply(stream: &mut TcpStream, expected: &[u8]) {
        let mut buf = vec![0; expected.len()];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ttl_round_trip() {
        let (address, shutdown, server) = start(Arc::new(State::new(StoreMode::Ttl))).await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        stream.write_all(&command(&["SET", "name", "Alice", "60s"])).await.unwrap();
        read_exact_reply(&mut stream, b"+OK\r\n").await;

        stream.write_all(&command(&["GET", "name"])).await.unwrap();
        read_exact_reply(&mut stream, b"$5\r\nAlice\r\n").await;

        stream.write_all(&command(&["GET", "nobody"])).await.unwrap();
        read_exact_reply(&mut stream, b"$-1\r\n").await;

        stream.write_all(&command(&["LIST"])).await.unwrap();
        read_exact_reply(&mut stream, b"*1\r\n$4\r\nname\r\n").await;

        stream.write_all(&command(&["SET", "k", "v", "0s"])).await.unwrap();
        read_exact_reply(&mut stream, b"+OK\r\n").await;
        stream.write_all(&command(&["TTL", "k"])).await.unwrap();
        read_exact_reply(&mut stream, b"$-1\r\n").await;

        shutdown.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn split_and_pipelined_frames() {
        let (address, shutdown, server) = start(Arc::new(State::new(StoreMode::Ttl))).await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        let set = command(&["SET", "a", "1", "1m"]);
        let (head, tail) = set.split_at(7);
        stream.write_all(head).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(tail).await.unwrap();
        read_exact_reply(&mut stream, b"+OK\r\n").await;

        let mut pipelined = command(&["PING"]);
        pipelined.extend(command(&["GET", "a"]));
        stream.write_all(&pipelined).await.unwrap();
        read_exact_reply(&mut stream, b"+PONG\r\n$1\r\n1\r\n").await;

        shutdown.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bad_requests_keep_connection_open() {
        let (address, shutdown, server) = start(Arc::new(State::new(StoreMode::Ttl))).await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        stream.write_all(&command(&["SET", "k", "v", "soon"])).await.unwrap();
        read_exact_reply(&mut stream, b"-ERR invalid TTL: invalid duration \"soon\"\r\n").await;

        stream.write_all(&command(&["SET", "k", "v"])).await.unwrap();
        read_exact_reply(&mut stream, b"-ERR 'set' requires a TTL\r\n").await;

        stream.write_all(&command(&["PING"])).await.unwrap();
        read_exact_reply(&mut stream, b"+PONG\r\n").await;

        shutdown.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn garbage_closes_connection() {
        let (address, shutdown, server) = start(Arc::new(State::new(StoreMode::Ttl))).await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        stream.write_all(b"?nonsense\r\n").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"-ERR protocol error"));

        shutdown.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_bulk_length_is_a_protocol_error() {
        let (address, shutdown, server) = start(Arc::new(State::new(StoreMode::Ttl))).await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        stream.write_all(b"$18446744073709551615\r\nab").await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"-ERR protocol error: invalid bulk string length\r\n");

        // The server itself is unharmed.
        let mut stream = TcpStream::connect(address).await.unwrap();
        stream.write_all(&command(&["PING"])).await.unwrap();
        read_exact_reply(&mut stream, b"+PONG\r\n").await;

        shutdown.send(()).unwrap();
        server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notify_mode_drains_notifications() {
        let state = Arc::new(State::new(StoreMode::Notify));
        let drain = spawn_notification_drain(&state, Delivery::blocking(0)).unwrap();
        let (address, shutdown, server) = start(Arc::clone(&state)).await;
        let mut stream = TcpStream::connect(address).await.unwrap();

        for key in ["a", "b", "c"] {
            stream.write_all(&command(&["SET", key, "v"])).await.unwrap();
            read_exact_reply(&mut stream, b"+OK\r\n").await;
        }
        stream.write_all(&command(&["GET", "b"])).await.unwrap();
        read_exact_reply(&mut stream, b"$1\r\nv\r\n").await;

        shutdown.send(()).unwrap();
        server.await.unwrap();

        state.notifying_store().unwrap().unsubscribe();
        tokio::time::timeout(Duration::from_secs(5), drain)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn no_drain_in_ttl_mode() {
        let state = State::new(StoreMode::Ttl);
        assert!(spawn_notification_drain(&state, Delivery::blocking(1)).is_none());
    }
}
