use std::{future::Future, net::SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncBufRead, AsyncWrite, BufReader},
    net::{TcpListener, TcpStream},
    select,
    sync::{broadcast, mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{ErrorReason, Message, MessageKind, Reply, read_line, write_line, write_unit},
    registry::GroupRegistry,
};

/// One request forwarded from a control connection to the dispatcher,
/// paired with the channel its reply must come back on.
type ControlRequest = (Message, oneshot::Sender<Reply>);

/// One logical broadcast: a topic and a preformatted body, delivered to
/// every subscriber as two adjacent frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastUnit {
    pub topic: String,
    pub body: String,
}

/// Maps one decoded request to a reply and an optional broadcast.
///
/// All registry access in the server funnels through here, on the one task
/// that owns the registry, so the registry itself stays lock-free.
fn dispatch(registry: &mut GroupRegistry, message: &Message) -> (Reply, Option<BroadcastUnit>) {
    match message.kind {
        MessageKind::CreateGroup => {
            if message.user.is_empty() || message.group.is_empty() {
                return (Reply::Error(ErrorReason::InvalidArgs), None);
            }
            if !registry.create_group(&message.group) {
                return (Reply::Error(ErrorReason::GroupExistsOrInvalid), None);
            }
            // The creator is the group's first member.
            registry.join_group(&message.group, &message.user);
            (Reply::Ok, None)
        }
        MessageKind::JoinGroup => {
            if message.user.is_empty() || message.group.is_empty() {
                return (Reply::Error(ErrorReason::InvalidArgs), None);
            }
            if !registry.group_exists(&message.group) {
                return (Reply::Error(ErrorReason::NoSuchGroup), None);
            }
            registry.join_group(&message.group, &message.user);
            (Reply::Ok, None)
        }
        MessageKind::Send => {
            if message.user.is_empty() || message.group.is_empty() {
                return (Reply::Error(ErrorReason::InvalidArgs), None);
            }
            if !registry.group_exists(&message.group) {
                return (Reply::Error(ErrorReason::NoSuchGroup), None);
            }
            if !registry.is_member(&message.group, &message.user) {
                return (Reply::Error(ErrorReason::NotAMember), None);
            }
            let unit = BroadcastUnit {
                topic: message.group.clone(),
                body: format!("{}: {}", message.user, message.text),
            };
            (Reply::Ok, Some(unit))
        }
        MessageKind::Unknown => (Reply::Error(ErrorReason::UnknownCommand), None),
    }
}

pub struct Server {
    control: TcpListener,
    broadcast: TcpListener,
}

impl Server {
    pub fn new(control: TcpListener, broadcast: TcpListener) -> Self {
        Self { control, broadcast }
    }

    pub fn control_addr(&self) -> std::io::Result<SocketAddr> {
        self.control.local_addr()
    }

    pub fn broadcast_addr(&self) -> std::io::Result<SocketAddr> {
        self.broadcast.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        // Buffers a modest backlog before slow subscribers start dropping units.
        let (bus, _) = broadcast::channel(128);
        // Capacity one: the dispatcher takes requests strictly one at a time.
        let (requests, request_inbox) = mpsc::channel(1);
        tokio::spawn(run_dispatcher(request_inbox, bus.clone()));

        let Server { control, broadcast } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server shutting down");
                    break;
                }
                accepted = control.accept() => {
                    handle_control_accept(accepted, &requests);
                }
                accepted = broadcast.accept() => {
                    handle_broadcast_accept(accepted, &bus);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Owns the registry. Requests are served strictly one at a time; the reply
/// is handed back before any associated unit reaches the bus.
async fn run_dispatcher(
    mut requests: mpsc::Receiver<ControlRequest>,
    bus: broadcast::Sender<BroadcastUnit>,
) {
    let mut registry = GroupRegistry::new();

    while let Some((message, reply_to)) = requests.recv().await {
        let (reply, unit) = dispatch(&mut registry, &message);
        debug!(kind = message.kind.as_str(), reply = %reply.encode(), "dispatched request");

        if reply_to.send(reply).is_err() {
            debug!("requester went away before its reply was delivered");
        }
        if let Some(unit) = unit {
            // Fire and forget: with no subscribers the unit is simply dropped.
            if bus.send(unit).is_err() {
                debug!("no broadcast subscribers connected");
            }
        }
    }
}

fn handle_control_accept(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    requests: &mpsc::Sender<ControlRequest>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(%peer, "control connection opened");
            let requests = requests.clone();
            tokio::spawn(async move {
                match handle_control_connection(stream, requests).await {
                    Ok(()) => debug!(%peer, "control connection closed"),
                    Err(err) => warn!(%peer, error = ?err, "control connection closed with error"),
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept control connection"),
    }
}

fn handle_broadcast_accept(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    bus: &broadcast::Sender<BroadcastUnit>,
) {
    match result {
        Ok((stream, peer)) => {
            debug!(%peer, "broadcast subscriber connected");
            let inbox = bus.subscribe();
            tokio::spawn(async move {
                if let Err(err) = handle_broadcast_connection(stream, inbox).await {
                    debug!(%peer, error = ?err, "broadcast subscriber dropped");
                }
            });
        }
        Err(err) => warn!(error = ?err, "failed to accept broadcast connection"),
    }
}

async fn handle_control_connection(
    stream: TcpStream,
    requests: mpsc::Sender<ControlRequest>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = writer;
    serve_control(&mut reader, &mut writer, &requests).await
}

/// One request line in, exactly one reply line out, until the peer closes.
/// Every line gets a reply; an unparseable one earns `ERROR|unknown_command`
/// from the dispatcher rather than ending the connection.
async fn serve_control<R, W>(
    reader: &mut R,
    writer: &mut W,
    requests: &mpsc::Sender<ControlRequest>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(line) = read_line(reader).await? {
        let message = Message::decode(&line);
        let (reply_tx, reply_rx) = oneshot::channel();
        if requests.send((message, reply_tx)).await.is_err() {
            anyhow::bail!("dispatcher is gone");
        }
        let reply = reply_rx.await.context("dispatcher dropped a pending reply")?;
        write_line(writer, &reply.encode()).await?;
    }
    Ok(())
}

/// Write-only fan-out leg: forward every bus unit to this subscriber. A
/// lagged receiver skips what it missed and carries on.
async fn handle_broadcast_connection(
    stream: TcpStream,
    mut inbox: broadcast::Receiver<BroadcastUnit>,
) -> Result<()> {
    let mut writer = stream;

    loop {
        match inbox.recv().await {
            Ok(unit) => write_unit(&mut writer, &unit.topic, &unit.body).await?,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "subscriber lagging; dropping missed broadcasts");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_room() -> GroupRegistry {
        let mut registry = GroupRegistry::new();
        let (reply, _) = dispatch(&mut registry, &Message::create_group("alice", "room"));
        assert_eq!(reply, Reply::Ok);
        registry
    }

    #[test]
    fn create_auto_joins_the_creator() {
        let mut registry = GroupRegistry::new();
        let (reply, unit) = dispatch(&mut registry, &Message::create_group("alice", "room"));
        assert_eq!(reply, Reply::Ok);
        assert!(unit.is_none());
        assert!(registry.is_member("room", "alice"));
    }

    #[test]
    fn create_requires_user_and_group() {
        let mut registry = GroupRegistry::new();
        for message in [
            Message::create_group("", "room"),
            Message::create_group("alice", ""),
        ] {
            let (reply, unit) = dispatch(&mut registry, &message);
            assert_eq!(reply, Reply::Error(ErrorReason::InvalidArgs));
            assert!(unit.is_none());
        }
        assert!(!registry.group_exists("room"));
    }

    #[test]
    fn create_rejects_duplicates_and_keeps_membership() {
        let mut registry = registry_with_room();
        let (reply, _) = dispatch(&mut registry, &Message::create_group("bob", "room"));
        assert_eq!(reply, Reply::Error(ErrorReason::GroupExistsOrInvalid));
        assert!(registry.is_member("room", "alice"));
        assert!(!registry.is_member("room", "bob"));
    }

    #[test]
    fn join_requires_an_existing_group() {
        let mut registry = registry_with_room();

        let (reply, _) = dispatch(&mut registry, &Message::join_group("bob", "missing_room"));
        assert_eq!(reply, Reply::Error(ErrorReason::NoSuchGroup));

        let (reply, _) = dispatch(&mut registry, &Message::join_group("bob", "room"));
        assert_eq!(reply, Reply::Ok);
        // Re-joining is not an error.
        let (reply, _) = dispatch(&mut registry, &Message::join_group("bob", "room"));
        assert_eq!(reply, Reply::Ok);
        assert!(registry.is_member("room", "bob"));
    }

    #[test]
    fn join_requires_user_and_group() {
        let mut registry = registry_with_room();
        let (reply, _) = dispatch(&mut registry, &Message::join_group("", "room"));
        assert_eq!(reply, Reply::Error(ErrorReason::InvalidArgs));
    }

    #[test]
    fn send_is_gated_on_membership() {
        let mut registry = registry_with_room();

        let (reply, unit) = dispatch(&mut registry, &Message::send("bob", "room", "hi"));
        assert_eq!(reply, Reply::Error(ErrorReason::NotAMember));
        assert!(unit.is_none());

        dispatch(&mut registry, &Message::join_group("bob", "room"));
        let (reply, unit) = dispatch(&mut registry, &Message::send("bob", "room", "hi"));
        assert_eq!(reply, Reply::Ok);
        assert_eq!(
            unit,
            Some(BroadcastUnit {
                topic: "room".to_string(),
                body: "bob: hi".to_string(),
            })
        );
    }

    #[test]
    fn send_to_a_missing_group_fails() {
        let mut registry = registry_with_room();
        let (reply, unit) = dispatch(&mut registry, &Message::send("alice", "other", "hi"));
        assert_eq!(reply, Reply::Error(ErrorReason::NoSuchGroup));
        assert!(unit.is_none());
    }

    #[test]
    fn send_body_keeps_embedded_delimiters() {
        let mut registry = registry_with_room();
        let (_, unit) = dispatch(&mut registry, &Message::send("alice", "room", "a|b|c"));
        assert_eq!(unit.expect("broadcast").body, "alice: a|b|c");
    }

    #[test]
    fn unrecognized_requests_get_unknown_command() {
        let mut registry = GroupRegistry::new();
        for line in ["", "gibberish", "DELETE_GROUP|alice|room|"] {
            let (reply, unit) = dispatch(&mut registry, &Message::decode(line));
            assert_eq!(reply, Reply::Error(ErrorReason::UnknownCommand));
            assert!(unit.is_none());
        }
    }

    async fn ask(requests: &mpsc::Sender<ControlRequest>, message: Message) -> Reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        requests
            .send((message, reply_tx))
            .await
            .expect("dispatcher should be running");
        reply_rx.await.expect("dispatcher should reply")
    }

    #[tokio::test]
    async fn dispatcher_replies_then_publishes() {
        let (bus, _) = broadcast::channel(8);
        let mut inbox = bus.subscribe();
        let (requests, request_inbox) = mpsc::channel(1);
        tokio::spawn(run_dispatcher(request_inbox, bus));

        assert_eq!(
            ask(&requests, Message::create_group("alice", "room")).await,
            Reply::Ok
        );
        assert_eq!(
            ask(&requests, Message::send("alice", "room", "hi")).await,
            Reply::Ok
        );

        let unit = inbox.recv().await.expect("published unit");
        assert_eq!(
            unit,
            BroadcastUnit {
                topic: "room".to_string(),
                body: "alice: hi".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn control_session_replies_per_line() {
        let (bus, _) = broadcast::channel(8);
        let (requests, request_inbox) = mpsc::channel(1);
        tokio::spawn(run_dispatcher(request_inbox, bus));

        let (client, server) = tokio::io::duplex(1024);
        let (server_read, mut server_write) = tokio::io::split(server);
        let session = tokio::spawn(async move {
            let mut reader = BufReader::new(server_read);
            serve_control(&mut reader, &mut server_write, &requests).await
        });

        let mut client = BufReader::new(client);

        write_line(&mut client, "CREATE_GROUP|alice|room|").await.unwrap();
        assert_eq!(read_line(&mut client).await.unwrap().unwrap(), "OK");

        write_line(&mut client, "SEND|bob|room|hi").await.unwrap();
        assert_eq!(
            read_line(&mut client).await.unwrap().unwrap(),
            "ERROR|not_a_member"
        );

        write_line(&mut client, "nonsense").await.unwrap();
        assert_eq!(
            read_line(&mut client).await.unwrap().unwrap(),
            "ERROR|unknown_command"
        );

        drop(client);
        session.await.unwrap().expect("clean close");
    }
}
