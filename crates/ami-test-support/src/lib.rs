// Mock AMI server for integration testing: binds a random port, sends the
// greeting line, then hands each accepted connection to a caller-supplied
// async handler. Modeled on this codebase's mock WebSocket server harness,
// generalized to a plain handler closure since AMI test scenarios vary
// widely in server-side behavior (immediate replies, EventList sequences,
// deliberately delayed replies, interleaved unsolicited events).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// A mock AMI server for integration testing.
///
/// Binds to `127.0.0.1:0` and exposes the actual bound port. Each test
/// spins up its own isolated instance and supplies a handler closure that
/// drives the connection's scripted behavior.
pub struct MockAmiServer {
    addr: SocketAddr,
    _task: JoinHandle<()>,
}

impl MockAmiServer {
    /// Start the server. `greeting` should not include the trailing
    /// `\r\n` — it is appended automatically. `handler` runs once per
    /// accepted connection, after the greeting has been written.
    pub async fn start<F, Fut>(greeting: &str, handler: F) -> std::io::Result<Self>
    where
        F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let greeting = format!("{greeting}\r\n");
        let handler = Arc::new(handler);

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut stream, _peer)) => {
                        let greeting = greeting.clone();
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            if stream.write_all(greeting.as_bytes()).await.is_err() {
                                return;
                            }
                            handler(stream).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Read bytes off `stream` until the AMI message terminator `\r\n\r\n` is
/// seen, and return the message including the terminator. Not optimized —
/// fine for test harness use.
pub async fn read_one_message(stream: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Extract the `ActionID` field from a raw client action message, panicking
/// if absent — test scenarios always send one.
pub fn extract_action_id(message: &str) -> String {
    message
        .lines()
        .find_map(|line| line.strip_prefix("ActionID: "))
        .expect("message has no ActionID field")
        .trim_end()
        .to_owned()
}
