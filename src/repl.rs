use std::net::SocketAddr;

use anyhow::Context;
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    config::ReplArgs,
    duration::{parse_ttl, DurationError},
    resp_value::{FrameError, RespValue},
};

#[derive(Debug, PartialEq)]
enum ReplCommand<'line> {
    Set {
        key: &'line str,
        value: &'line str,
        ttl: &'line str,
    },
    Get(&'line str),
    Ttl(&'line str),
    List,
    Exit,
}

#[derive(Debug, Error, PartialEq)]
enum ReplError {
    #[error("Invalid {0} command. Format: {1}")]
    Usage(&'static str, &'static str),
    #[error("Invalid TTL duration: {0}")]
    InvalidTtl(#[from] DurationError),
    #[error("Invalid command")]
    Unknown,
}

impl<'line> ReplCommand<'line> {
    /// `Ok(None)` for a blank line.
    fn parse(line: &'line str) -> Result<Option<Self>, ReplError> {
        let parts = line.split_whitespace().collect::<Vec<_>>();
        let Some((command, args)) = parts.split_first() else {
            return Ok(None);
        };
        let command = match (*command, args) {
            ("set", &[key, value, ttl]) => {
                parse_ttl(ttl)?;
                ReplCommand::Set { key, value, ttl }
            }
            ("set", _) => return Err(ReplError::Usage("set", "set key value ttl")),
            ("get", &[key]) => ReplCommand::Get(key),
            ("get", _) => return Err(ReplError::Usage("get", "get key")),
            ("ttl", &[key]) => ReplCommand::Ttl(key),
            ("ttl", _) => return Err(ReplError::Usage("ttl", "ttl key")),
            ("list", _) => ReplCommand::List,
            ("exit", _) => ReplCommand::Exit,
            _ => return Err(ReplError::Unknown),
        };
        Ok(Some(command))
    }

    fn args(&self) -> Vec<&'line str> {
        match *self {
            ReplCommand::Set { key, value, ttl } => vec!["SET", key, value, ttl],
            ReplCommand::Get(key) => vec!["GET", key],
            ReplCommand::Ttl(key) => vec!["TTL", key],
            ReplCommand::List => vec!["LIST"],
            ReplCommand::Exit => vec![],
        }
    }

    /// Prefix for a request that never got a reply.
    fn failure(&self) -> &'static str {
        match self {
            ReplCommand::Set { .. } => "Error setting key-value pair:",
            ReplCommand::Get(_) => "Error getting value by key:",
            ReplCommand::Ttl(_) => "Error getting TTL for key:",
            ReplCommand::List => "Error getting list of keys:",
            ReplCommand::Exit => "Error:",
        }
    }

    /// Text to print for `reply`, if any.
    fn render(&self, reply: &Reply) -> Option<String> {
        match (self, reply) {
            (_, Reply::Error(message)) => Some(format!("(error) {message}")),
            (ReplCommand::Set { .. } | ReplCommand::Exit, _) => None,
            (_, Reply::Status(status)) => Some(status.clone()),
            (ReplCommand::Get(_), Reply::Bulk(Some(value))) => Some(value.clone()),
            (ReplCommand::Get(_), _) => Some("(nil)".to_string()),
            (ReplCommand::Ttl(key), Reply::Bulk(Some(ttl))) => {
                Some(format!("TTL for key {key}: {ttl}"))
            }
            (ReplCommand::Ttl(key), _) => Some(format!("Key not found: {key}")),
            (ReplCommand::List, Reply::Array(keys)) => {
                Some(format!("Keys in cache: {}", keys.join(", ")))
            }
            (ReplCommand::List, Reply::Bulk(_)) => Some("Keys in cache: ".to_string()),
        }
    }
}

/// Owned copy of a server reply.
#[derive(Debug, PartialEq)]
enum Reply {
    Status(String),
    Error(String),
    Bulk(Option<String>),
    Array(Vec<String>),
}

impl From<RespValue<'_>> for Reply {
    fn from(value: RespValue<'_>) -> Self {
        match value {
            RespValue::SimpleString(s) => Reply::Status(s.to_string()),
            RespValue::SimpleError(s) => Reply::Error(s.to_string()),
            RespValue::Integer(n) => Reply::Status(n.to_string()),
            RespValue::BulkString(s) => Reply::Bulk(Some(s.to_string())),
            RespValue::OwnedBulkString(s) => Reply::Bulk(Some(s)),
            RespValue::NullBulkString | RespValue::NullArray => Reply::Bulk(None),
            RespValue::Array(elements) => Reply::Array(
                elements
                    .into_iter()
                    .map(|element| match element {
                        RespValue::BulkString(s) | RespValue::SimpleString(s) => s.to_string(),
                        other => format!("{other:?}"),
                    })
                    .collect(),
            ),
        }
    }
}

/// Client connection. A request that fails drops the stream, and the next
/// one dials the server again.
struct Connection {
    address: SocketAddr,
    stream: Option<TcpStream>,
    buf: BytesMut,
}

impl Connection {
    async fn connect(address: SocketAddr) -> anyhow::Result<Self> {
        let stream = Self::open(address).await?;
        Ok(Connection {
            address,
            stream: Some(stream),
            buf: BytesMut::with_capacity(512),
        })
    }

    async fn open(address: SocketAddr) -> anyhow::Result<TcpStream> {
        TcpStream::connect(address)
            .await
            .with_context(|| format!("failed to connect to {address}"))
    }

    async fn request(&mut self, args: &[&str]) -> anyhow::Result<Reply> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                self.buf.clear();
                let stream = Self::open(self.address).await?;
                debug!(address = %self.address, "reconnected");
                stream
            }
        };
        let reply = Self::exchange(&mut stream, &mut self.buf, args).await?;
        self.stream = Some(stream);
        Ok(reply)
    }

    async fn exchange(
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        args: &[&str],
    ) -> anyhow::Result<Reply> {
        let mut out = BytesMut::new();
        RespValue::Array(args.iter().copied().map(RespValue::BulkString).collect())
            .serialize(&mut out);
        stream.write_all(&out).await?;

        loop {
            match RespValue::deserialize(&buf[..]) {
                Ok((value, rest)) => {
                    let consumed = buf.len() - rest.len();
                    let reply = Reply::from(value);
                    buf.advance(consumed);
                    return Ok(reply);
                }
                Err(FrameError::Incomplete) => {}
                Err(e) => return Err(e.into()),
            }
            if stream.read_buf(buf).await? == 0 {
                anyhow::bail!("server closed the connection");
            }
        }
    }
}

pub async fn run(args: ReplArgs) -> anyhow::Result<()> {
    let address = args.address();
    let mut connection = Connection::connect(address).await?;
    debug!(%address, "connected");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(format!("{address}>").as_bytes()).await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            return Ok(());
        };
        let command = match ReplCommand::parse(&line) {
            Ok(Some(ReplCommand::Exit)) => {
                println!("Exiting...");
                return Ok(());
            }
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{e}");
                continue;
            }
        };

        let reply = match connection.request(&command.args()).await {
            Ok(reply) => reply,
            Err(e) => {
                println!("{} {e:#}", command.failure());
                continue;
            }
        };
        if let Some(text) = command.render(&reply) {
            println!("{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    use super::{Connection, Reply, ReplCommand, ReplError};
    use crate::{
        config::StoreMode, duration::DurationError, resp_value::RespValue, server, state::State,
    };

    #[test]
    fn parses_commands() {
        assert_eq!(
            ReplCommand::parse("set name Alice 60s"),
            Ok(Some(ReplCommand::Set {
                key: "name",
                value: "Alice",
                ttl: "60s",
            }))
        );
        assert_eq!(ReplCommand::parse("  get name "), Ok(Some(ReplCommand::Get("name"))));
        assert_eq!(ReplCommand::parse("ttl name"), Ok(Some(ReplCommand::Ttl("name"))));
        assert_eq!(ReplCommand::parse("list"), Ok(Some(ReplCommand::List)));
        assert_eq!(ReplCommand::parse("exit"), Ok(Some(ReplCommand::Exit)));
        assert_eq!(ReplCommand::parse("   "), Ok(None));
    }

    #[test]
    fn reports_mistakes() {
        assert_eq!(
            ReplCommand::parse("set name Alice"),
            Err(ReplError::Usage("set", "set key value ttl"))
        );
        assert_eq!(
            ReplCommand::parse("get"),
            Err(ReplError::Usage("get", "get key"))
        );
        assert_eq!(
            ReplCommand::parse("set k v forever"),
            Err(ReplError::InvalidTtl(DurationError::Invalid(
                "forever".to_string()
            )))
        );
        assert_eq!(ReplCommand::parse("del k"), Err(ReplError::Unknown));
        assert_eq!(
            ReplError::Usage("ttl", "ttl key").to_string(),
            "Invalid ttl command. Format: ttl key"
        );
    }

    #[test]
    fn renders_replies() {
        let get = ReplCommand::Get("name");
        assert_eq!(
            get.render(&Reply::Bulk(Some("Alice".into()))).as_deref(),
            Some("Alice")
        );
        assert_eq!(get.render(&Reply::Bulk(None)).as_deref(), Some("(nil)"));

        let ttl = ReplCommand::Ttl("name");
        assert_eq!(
            ttl.render(&Reply::Bulk(Some("59.9s".into()))).as_deref(),
            Some("TTL for key name: 59.9s")
        );
        assert_eq!(
            ttl.render(&Reply::Bulk(None)).as_deref(),
            Some("Key not found: name")
        );

        assert_eq!(
            ReplCommand::List
                .render(&Reply::Array(vec!["a".into(), "b".into()]))
                .as_deref(),
            Some("Keys in cache: a, b")
        );

        let set = ReplCommand::Set {
            key: "k",
            value: "v",
            ttl: "1s",
        };
        assert_eq!(set.render(&Reply::Status("OK".into())), None);
        assert_eq!(
            set.render(&Reply::Error("ERR boom".into())).as_deref(),
            Some("(error) ERR boom")
        );
    }

    #[test]
    fn failure_prefixes() {
        assert_eq!(
            ReplCommand::Get("k").failure(),
            "Error getting value by key:"
        );
        assert_eq!(ReplCommand::List.failure(), "Error getting list of keys:");
    }

    #[tokio::test]
    async fn reconnects_after_a_failed_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let mut connection = Connection::connect(address).await.unwrap();

        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        assert!(connection.request(&["PING"]).await.is_err());

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 64];
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(b"+PONG\r\n").await.unwrap();
        });
        assert_eq!(
            connection.request(&["PING"]).await.unwrap(),
            Reply::Status("PONG".to_string())
        );
        server.await.unwrap();
    }

    #[test]
    fn converts_resp_values() {
        assert_eq!(Reply::from(RespValue::NullBulkString), Reply::Bulk(None));
        assert_eq!(Reply::from(RespValue::Integer(3)), Reply::Status("3".to_string()));
        assert_eq!(
            Reply::from(RespValue::Array(vec![RespValue::BulkString("k")])),
            Reply::Array(vec!["k".to_string()])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn talks_to_a_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(server::run(
            listener,
            Arc::new(State::new(StoreMode::Ttl)),
            async move {
                let _ = shutdown_rx.await;
            },
        ));

        let mut connection = Connection::connect(address).await.unwrap();
        let set = ReplCommand::parse("set name Alice 1m").unwrap().unwrap();
        assert_eq!(
            connection.request(&set.args()).await.unwrap(),
            Reply::Status("OK".to_string())
        );

        let get = ReplCommand::parse("get name").unwrap().unwrap();
        let reply = connection.request(&get.args()).await.unwrap();
        assert_eq!(get.render(&reply).as_deref(), Some("Alice"));

        let ttl = ReplCommand::parse("ttl name").unwrap().unwrap();
        let reply = connection.request(&ttl.args()).await.unwrap();
        assert!(ttl.render(&reply).unwrap().starts_with("TTL for key name: "));

        let list = ReplCommand::parse("list").unwrap().unwrap();
        let reply = connection.request(&list.args()).await.unwrap();
        assert_eq!(list.render(&reply).as_deref(), Some("Keys in cache: name"));

        shutdown_tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
