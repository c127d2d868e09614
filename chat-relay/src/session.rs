use std::sync::Arc;

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncWrite},
    select,
};
use tracing::{debug, info};

use crate::{
    command::{BANNER, Directive},
    directory::{Directory, Sink},
    envelope::{Envelope, read_envelope, timestamp, write_envelope},
};

/// One client connection, from accept to termination.
///
/// The session first waits for a `RegisterRequest` with a free username,
/// then relays the client's chat until it says `Bye`, disconnects, sends
/// something undecodable, or is evicted by a broadcaster that could not
/// write to it.
pub struct Session<R, W> {
    reader: R,
    sink: Sink<W>,
    directory: Arc<Directory<W>>,
    username: Option<String>,
}

impl<R, W> Session<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, directory: Arc<Directory<W>>) -> Self {
        Self {
            reader,
            sink: Sink::new(writer),
            directory,
            username: None,
        }
    }

    /// Drives the session to completion. Termination always runs, and the
    /// error that ended the session, if any, is handed back for logging.
    pub async fn run(mut self) -> Result<()> {
        let outcome = self.drive().await;
        self.terminate().await;
        outcome
    }

    async fn drive(&mut self) -> Result<()> {
        if !self.await_registration().await? {
            return Ok(());
        }
        self.relay().await
    }

    /// Returns false if the connection closed before a name was accepted.
    async fn await_registration(&mut self) -> Result<bool> {
        loop {
            let Some(envelope) = read_envelope(&mut self.reader).await? else {
                return Ok(false);
            };
            let Envelope::RegisterRequest { username } = envelope else {
                debug!("ignoring envelope received before registration");
                continue;
            };

            // Hold the writer so nothing reaches the client ahead of its result.
            let mut writer = self.sink.lock().await;
            match self.directory.register(&username, &self.sink).await {
                Ok(users) => {
                    self.username = Some(username.clone());
                    write_envelope(&mut *writer, &Envelope::RegisterResult { ok: true }).await?;
                    drop(writer);

                    info!(%username, ?users, "client joined");
                    self.directory
                        .broadcast(&username, true, &Envelope::joined(users, &username))
                        .await;
                    return Ok(true);
                }
                Err(error) => {
                    debug!(%error, "registration rejected");
                    write_envelope(&mut *writer, &Envelope::RegisterResult { ok: false }).await?;
                }
            }
        }
    }

    async fn relay(&mut self) -> Result<()> {
        let Some(username) = self.username.clone() else {
            return Ok(());
        };

        loop {
            // Retirement wins over frames already queued by the client.
            let inbound = select! {
                biased;

                _ = self.sink.retired() => {
                    debug!(%username, "session retired by the relay");
                    return Ok(());
                }
                inbound = read_envelope(&mut self.reader) => inbound?,
            };

            let Some(envelope) = inbound else {
                return Ok(());
            };
            if !self.dispatch(&username, envelope).await || self.sink.is_retired() {
                return Ok(());
            }
        }
    }

    /// Routes one inbound envelope. Returns false when the client asked to leave.
    async fn dispatch(&self, username: &str, envelope: Envelope) -> bool {
        let Envelope::Chat { body, sent_at, .. } = envelope else {
            debug!(%username, "ignoring non-chat envelope");
            return true;
        };

        match Directive::parse(&body) {
            Directive::Leave => return false,
            Directive::Whisper { target, text } => {
                let whisper = Envelope::whisper(username, target, text);
                if !self.directory.send_to(target, &whisper).await {
                    debug!(%username, %target, "dropping whisper to unknown user");
                }
            }
            Directive::Banner => {
                let banner = Envelope::chat(username, BANNER, true);
                self.directory.broadcast(username, true, &banner).await;
            }
            Directive::Say => {
                let chat = Envelope::Chat {
                    from: username.to_string(),
                    body: body.clone(),
                    sent_at: if sent_at.is_empty() { timestamp() } else { sent_at },
                    to_self: false,
                };
                self.directory.broadcast(username, false, &chat).await;
            }
            Directive::Ignore => debug!(%username, %body, "dropping malformed command"),
        }
        true
    }

    /// Removes the entry, closes the connection and tells everyone left.
    /// Safe to call more than once.
    async fn terminate(&mut self) {
        let username = self.username.take();

        let remaining = match &username {
            Some(username) => match self.directory.remove(username, &self.sink).await {
                Some(remaining) => Some(remaining),
                // Evicted by a broadcaster. Stay quiet if the name already
                // belongs to a newer connection.
                None => {
                    let users = self.directory.usernames().await;
                    (!users.contains(username)).then_some(users)
                }
            },
            None => None,
        };

        if let Err(error) = self.sink.close().await {
            debug!(?error, "failed to close connection cleanly");
        }

        if let (Some(username), Some(users)) = (username, remaining) {
            info!(%username, ?users, "client disconnected");
            self.directory
                .broadcast(&username, false, &Envelope::left(users, &username))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::{AsyncWriteExt, BufReader, DuplexStream},
        task::JoinHandle,
        time::timeout,
    };

    use super::*;

    type Relayed = Arc<Directory<DuplexStream>>;

    /// Separate pipes per direction, so either side can be cut on its own.
    struct TestClient {
        reader: BufReader<DuplexStream>,
        writer: DuplexStream,
        session: JoinHandle<Result<()>>,
    }

    impl TestClient {
        fn connect(directory: &Relayed) -> Self {
            let (writer, server_in) = tokio::io::duplex(8192);
            let (server_out, reader) = tokio::io::duplex(8192);
            let session = Session::new(BufReader::new(server_in), server_out, Arc::clone(directory));

            Self {
                reader: BufReader::new(reader),
                writer,
                session: tokio::spawn(session.run()),
            }
        }

        async fn send(&mut self, envelope: Envelope) {
            write_envelope(&mut self.writer, &envelope)
                .await
                .expect("send envelope");
        }

        async fn register(&mut self, username: &str) -> bool {
            self.send(Envelope::RegisterRequest {
                username: username.into(),
            })
            .await;
            match self.recv().await {
                Some(Envelope::RegisterResult { ok }) => ok,
                other => panic!("expected register result, got {other:?}"),
            }
        }

        async fn say(&mut self, body: &str) {
            self.send(Envelope::Chat {
                from: String::new(),
                body: body.into(),
                sent_at: String::new(),
                to_self: false,
            })
            .await;
        }

        async fn recv(&mut self) -> Option<Envelope> {
            timeout(Duration::from_millis(300), read_envelope(&mut self.reader))
                .await
                .ok()
                .and_then(|read| read.ok())
                .flatten()
        }
    }

    #[tokio::test]
    async fn duplicate_name_can_retry_with_another() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut alice = TestClient::connect(&directory);
        assert!(alice.register("alice").await);
        alice.recv().await.expect("own roster");

        let mut second = TestClient::connect(&directory);
        assert!(!second.register("alice").await);
        assert!(second.register("alicia").await);

        assert_eq!(
            second.recv().await,
            Some(Envelope::RosterDelta {
                users: vec!["alice".into(), "alicia".into()],
                joined: Some("alicia".into()),
                left: None,
            })
        );
    }

    #[tokio::test]
    async fn ignores_chat_before_registration() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut client = TestClient::connect(&directory);

        client.say("too early").await;
        assert!(client.register("alice").await);
        assert!(matches!(
            client.recv().await,
            Some(Envelope::RosterDelta { joined: Some(_), .. })
        ));
    }

    #[tokio::test]
    async fn undecodable_frame_ends_the_session() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut alice = TestClient::connect(&directory);
        let mut bob = TestClient::connect(&directory);
        assert!(alice.register("alice").await);
        assert!(bob.register("bob").await);
        alice.recv().await.expect("alice roster");
        alice.recv().await.expect("bob joined");
        bob.recv().await.expect("bob roster");

        bob.writer.write_all(b"{not json}\n").await.expect("write");
        let outcome = timeout(Duration::from_secs(1), bob.session)
            .await
            .expect("session should finish")
            .expect("session task");
        assert!(outcome.is_err());

        assert_eq!(
            alice.recv().await,
            Some(Envelope::RosterDelta {
                users: vec!["alice".into()],
                joined: None,
                left: Some("bob".into()),
            })
        );
        assert!(!directory.contains("bob").await);
    }

    #[tokio::test]
    async fn broken_recipient_is_terminated_instead_of_sender() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut alice = TestClient::connect(&directory);
        let mut bob = TestClient::connect(&directory);
        let mut carol = TestClient::connect(&directory);
        assert!(alice.register("alice").await);
        assert!(bob.register("bob").await);
        assert!(carol.register("carol").await);
        for _ in 0..3 {
            alice.recv().await.expect("alice roster");
        }
        carol.recv().await.expect("carol roster");

        // Bob stops reading but keeps his inbound pipe open, so his session
        // only learns about the failure through eviction.
        let TestClient {
            reader: bob_reader,
            writer: _bob_writer,
            session: bob_session,
        } = bob;
        drop(bob_reader);

        alice.say("still here?").await;
        timeout(Duration::from_secs(1), bob_session)
            .await
            .expect("bob's session should be retired")
            .expect("session task")
            .expect("eviction is a clean exit");

        assert!(matches!(
            carol.recv().await,
            Some(Envelope::Chat { ref body, .. }) if body == "still here?"
        ));
        assert_eq!(
            carol.recv().await,
            Some(Envelope::RosterDelta {
                users: vec!["alice".into(), "carol".into()],
                joined: None,
                left: Some("bob".into()),
            })
        );
        assert!(directory.contains("alice").await);
        assert!(!alice.session.is_finished());
    }

    #[tokio::test]
    async fn chat_keeps_client_timestamp_and_overrides_sender() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut alice = TestClient::connect(&directory);
        let mut bob = TestClient::connect(&directory);
        assert!(alice.register("alice").await);
        assert!(bob.register("bob").await);
        bob.recv().await.expect("bob roster");

        alice
            .send(Envelope::Chat {
                from: "mallory".into(),
                body: "hi".into(),
                sent_at: "12:34:56".into(),
                to_self: true,
            })
            .await;

        assert_eq!(
            bob.recv().await,
            Some(Envelope::Chat {
                from: "alice".into(),
                body: "hi".into(),
                sent_at: "12:34:56".into(),
                to_self: false,
            })
        );
    }

    #[tokio::test]
    async fn banner_reaches_sender_too() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut alice = TestClient::connect(&directory);
        assert!(alice.register("alice").await);
        alice.recv().await.expect("roster");

        alice.say("/a").await;
        assert!(matches!(
            alice.recv().await,
            Some(Envelope::Chat { ref from, ref body, to_self: true, .. })
                if from == "alice" && body == BANNER
        ));
    }

    #[tokio::test]
    async fn bye_drains_directory_when_last() {
        let directory: Relayed = Arc::new(Directory::default());
        let mut alice = TestClient::connect(&directory);
        assert!(alice.register("alice").await);
        alice.recv().await.expect("roster");

        alice.say("Bye").await;
        timeout(Duration::from_secs(1), directory.drained())
            .await
            .expect("directory should drain");
        timeout(Duration::from_secs(1), &mut alice.session)
            .await
            .expect("session should finish")
            .expect("session task")
            .expect("bye is a clean exit");
        assert_eq!(alice.recv().await, None);
    }

    /// Alice, bob and carol registered, with every roster delta consumed.
    async fn three_registered(directory: &Relayed) -> (TestClient, TestClient, TestClient) {
        let mut alice = TestClient::connect(directory);
        let mut bob = TestClient::connect(directory);
        let mut carol = TestClient::connect(directory);
        assert!(alice.register("alice").await);
        assert!(bob.register("bob").await);
        assert!(carol.register("carol").await);
        for _ in 0..3 {
            alice.recv().await.expect("alice roster");
        }
        for _ in 0..2 {
            bob.recv().await.expect("bob roster");
        }
        carol.recv().await.expect("carol roster");
        (alice, bob, carol)
    }

    // The steps between cutting bob's pipe and awaiting his session never
    // yield, so his session only wakes once it is evicted with chats queued.
    #[tokio::test]
    async fn evicted_session_stops_relaying_queued_chats() {
        let directory: Relayed = Arc::new(Directory::default());
        let (mut alice, bob, mut carol) = three_registered(&directory).await;
        let TestClient {
            reader: bob_reader,
            writer: mut bob_writer,
            session: bob_session,
        } = bob;
        drop(bob_reader);

        for n in 0..5 {
            let chat = Envelope::chat("bob", format!("queued {n}"), false);
            write_envelope(&mut bob_writer, &chat)
                .await
                .expect("queue chat");
        }
        let ping = Envelope::chat("alice", "ping", false);
        assert!(!directory.send_to("bob", &ping).await);
        assert!(!directory.contains("bob").await);

        timeout(Duration::from_secs(1), bob_session)
            .await
            .expect("bob's session should be retired")
            .expect("session task")
            .expect("eviction is a clean exit");

        assert_eq!(
            carol.recv().await,
            Some(Envelope::RosterDelta {
                users: vec!["alice".into(), "carol".into()],
                joined: None,
                left: Some("bob".into()),
            })
        );
        assert_eq!(carol.recv().await, None);
        assert!(matches!(
            alice.recv().await,
            Some(Envelope::RosterDelta { left: Some(ref name), .. }) if name == "bob"
        ));
        assert_eq!(alice.recv().await, None);
    }

    #[tokio::test]
    async fn evicted_name_claimed_again_is_not_announced_as_left() {
        let directory: Relayed = Arc::new(Directory::default());
        let (_alice, bob, mut carol) = three_registered(&directory).await;
        let TestClient {
            reader: bob_reader,
            writer: _bob_writer,
            session: bob_session,
        } = bob;
        drop(bob_reader);

        let ping = Envelope::chat("alice", "ping", false);
        assert!(!directory.send_to("bob", &ping).await);
        let (replacement, _replacement_rx) = tokio::io::duplex(8192);
        directory
            .register("bob", &Sink::new(replacement))
            .await
            .expect("name is free after eviction");

        timeout(Duration::from_secs(1), bob_session)
            .await
            .expect("bob's session should be retired")
            .expect("session task")
            .expect("eviction is a clean exit");

        assert_eq!(carol.recv().await, None);
        assert!(directory.contains("bob").await);
    }
}
