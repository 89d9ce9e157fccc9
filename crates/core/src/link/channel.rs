//! The secured channel: per-recipient encrypted multiplexing over one
//! framed stream.
//!
//! All channel state lives inside a single task; the [`SecuredChannel`]
//! handle is a cheap clone that talks to it over a commander, so observer
//! tables and the query correlator never need a lock. Inbound traffic is
//! routed by the recipient UUID of the envelope: to the registered observer
//! when there is one, into a bounded missed-message buffer when that
//! recipient has never had one, and to the floor after an observer
//! cancelled.

use log::*;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::storage::Car;
use crate::stream::{MessageStream, StreamMessage};
use crate::wire::crypto::SessionCrypto;
use crate::wire::model::{OperationType, WireQuery, WireQueryResponse};
use crate::{Error, Result};

/// Most messages buffered per recipient while it has no observer
pub const MISSED_MESSAGE_CAP: usize = 64;

/// Addressing for one encrypted write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageParams {
    /// Feature on the head unit the payload is for
    pub recipient: Uuid,
    /// Operation to stamp on the envelope.
    ///
    /// [`OperationType::Disconnect`] is receive-only and is rejected.
    pub operation: OperationType,
}

/// A query as features see it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
    /// Feature-defined request bytes
    pub request: Vec<u8>,
    /// Optional request detail
    pub parameters: Option<Vec<u8>>,
}

/// A response as features see it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// Correlation id of the query this answers
    pub id: i32,
    /// Whether the responder could satisfy the query
    pub is_successful: bool,
    /// Feature-defined response bytes
    pub response: Vec<u8>,
}

/// An inbound query delivered to a query observer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedQuery {
    /// Correlation id to echo in the response
    pub id: i32,
    /// Recipient UUID to address the response to
    pub sender: Uuid,
    /// The query itself
    pub query: Query,
}

/// Out-of-band notifications for the owner of the channel
#[derive(Debug)]
pub enum ChannelEvent {
    /// The channel hit a fatal fault; disconnect the peripheral
    UnrecoverableError(Error),
    /// The head unit asked us to drop the connection
    DisconnectRequested,
}

/// Releases an observer slot when cancelled.
///
/// Dropping the handle without cancelling leaves the slot occupied; the
/// slot is also reclaimed if the observer's receiver goes away.
#[derive(Debug)]
pub struct ObservationHandle {
    commander: mpsc::Sender<Command>,
    recipient: Uuid,
    kind: ObserverKind,
    id: u64,
}

impl ObservationHandle {
    /// Release the observer slot
    pub async fn cancel(self) {
        let _ = self
            .commander
            .send(Command::Unobserve {
                recipient: self.recipient,
                kind: self.kind,
                id: self.id,
            })
            .await;
    }
}

/// Stream of messages for one observed recipient
#[derive(Debug)]
pub struct MessageObserver {
    receiver: mpsc::Receiver<Vec<u8>>,
    /// Handle releasing this observer's slot
    pub handle: ObservationHandle,
}

impl MessageObserver {
    /// Next message, in arrival order. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.receiver.recv().await
    }
}

/// Stream of queries for one observed recipient
#[derive(Debug)]
pub struct QueryObserver {
    receiver: mpsc::Receiver<ReceivedQuery>,
    /// Handle releasing this observer's slot
    pub handle: ObservationHandle,
}

impl QueryObserver {
    /// Next query, in arrival order. `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<ReceivedQuery> {
        self.receiver.recv().await
    }
}

/// Stream of head-unit disconnect requests
#[derive(Debug)]
pub struct DisconnectObserver {
    receiver: mpsc::Receiver<()>,
}

impl DisconnectObserver {
    /// Resolves each time a disconnect request arrives
    pub async fn recv(&mut self) -> Option<()> {
        self.receiver.recv().await
    }
}

/// Response future for [`SecuredChannel::send_query`].
///
/// Exactly one of the response or an [`Error::InvalidChannel`] teardown
/// resolution happens, never both.
#[derive(Debug)]
pub struct PendingQuery {
    receiver: oneshot::Receiver<QueryResponse>,
}

impl PendingQuery {
    /// Wait for the peer's response
    pub async fn response(self) -> Result<QueryResponse> {
        self.receiver.await.map_err(|_| Error::InvalidChannel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObserverKind {
    Message,
    Query,
}

enum Command {
    WriteEncrypted {
        payload: Vec<u8>,
        params: MessageParams,
        done: oneshot::Sender<Result<()>>,
    },
    SendQuery {
        query: Query,
        recipient: Uuid,
        sender: Uuid,
        done: oneshot::Sender<Result<PendingQuery>>,
    },
    SendQueryResponse {
        response: QueryResponse,
        recipient: Uuid,
        done: oneshot::Sender<Result<()>>,
    },
    ObserveMessages {
        recipient: Uuid,
        done: oneshot::Sender<Result<(u64, mpsc::Receiver<Vec<u8>>)>>,
    },
    ObserveQueries {
        recipient: Uuid,
        done: oneshot::Sender<Result<(u64, mpsc::Receiver<ReceivedQuery>)>>,
    },
    ObserveDisconnects {
        done: oneshot::Sender<mpsc::Receiver<()>>,
    },
    Unobserve {
        recipient: Uuid,
        kind: ObserverKind,
        id: u64,
    },
}

/// Handle to an established secure channel
#[derive(Clone)]
pub struct SecuredChannel {
    car: Car,
    commander: mpsc::Sender<Command>,
}

impl std::fmt::Debug for SecuredChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecuredChannel")
            .field("car", &self.car.id)
            .finish_non_exhaustive()
    }
}

impl SecuredChannel {
    /// Take ownership of `stream` and `crypto` and start multiplexing.
    ///
    /// The returned receiver carries the channel's fatal faults and
    /// disconnect requests for the connection's owner.
    pub fn establish(
        car: Car,
        stream: MessageStream,
        crypto: SessionCrypto,
    ) -> (SecuredChannel, mpsc::Receiver<ChannelEvent>) {
        Self::establish_with_query_id(car, stream, crypto, 0)
    }

    pub(crate) fn establish_with_query_id(
        car: Car,
        stream: MessageStream,
        crypto: SessionCrypto,
        next_query_id: i32,
    ) -> (SecuredChannel, mpsc::Receiver<ChannelEvent>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::channel(8);
        let task = ChannelTask {
            crypto,
            stream,
            commands: command_rx,
            events: event_tx,
            message_observers: HashMap::new(),
            query_observers: HashMap::new(),
            observed_messages: HashSet::new(),
            observed_queries: HashSet::new(),
            missed_messages: HashMap::new(),
            missed_queries: HashMap::new(),
            pending_queries: HashMap::new(),
            disconnect_observers: Vec::new(),
            next_query_id,
            next_observer_id: 0,
        };
        tokio::task::spawn(task.run());
        (
            SecuredChannel {
                car,
                commander: command_tx,
            },
            event_rx,
        )
    }

    /// The car on the other end
    pub fn car(&self) -> &Car {
        &self.car
    }

    /// Encrypt `payload` and write it with the given addressing.
    ///
    /// Resolves once the message is fully on the wire; that resolution is
    /// the write-completion signal.
    pub async fn write_encrypted(&self, payload: Vec<u8>, params: MessageParams) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::WriteEncrypted {
            payload,
            params,
            done: done_tx,
        })
        .await?;
        done_rx.await.map_err(|_| Error::InvalidChannel)?
    }

    /// Send a query to `recipient`, identifying `sender` as the feature the
    /// response should be addressed to.
    ///
    /// Query ids count up by one per call and wrap to zero past
    /// `i32::MAX`.
    pub async fn send_query(
        &self,
        query: Query,
        recipient: Uuid,
        sender: Uuid,
    ) -> Result<PendingQuery> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::SendQuery {
            query,
            recipient,
            sender,
            done: done_tx,
        })
        .await?;
        done_rx.await.map_err(|_| Error::InvalidChannel)?
    }

    /// Answer a query received from `recipient`
    pub async fn send_query_response(
        &self,
        response: QueryResponse,
        recipient: Uuid,
    ) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::SendQueryResponse {
            response,
            recipient,
            done: done_tx,
        })
        .await?;
        done_rx.await.map_err(|_| Error::InvalidChannel)?
    }

    /// Observe client messages addressed to `recipient`.
    ///
    /// Messages that arrived before the first observer registered are
    /// delivered first, in arrival order, then live traffic follows. At
    /// most one message observer may exist per recipient.
    pub async fn observe_messages(&self, recipient: Uuid) -> Result<MessageObserver> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::ObserveMessages {
            recipient,
            done: done_tx,
        })
        .await?;
        let (id, receiver) = done_rx.await.map_err(|_| Error::InvalidChannel)??;
        Ok(MessageObserver {
            receiver,
            handle: ObservationHandle {
                commander: self.commander.clone(),
                recipient,
                kind: ObserverKind::Message,
                id,
            },
        })
    }

    /// Observe queries addressed to `recipient`; same replay and
    /// exclusivity rules as [`observe_messages`](Self::observe_messages).
    pub async fn observe_queries(&self, recipient: Uuid) -> Result<QueryObserver> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::ObserveQueries {
            recipient,
            done: done_tx,
        })
        .await?;
        let (id, receiver) = done_rx.await.map_err(|_| Error::InvalidChannel)??;
        Ok(QueryObserver {
            receiver,
            handle: ObservationHandle {
                commander: self.commander.clone(),
                recipient,
                kind: ObserverKind::Query,
                id,
            },
        })
    }

    /// Observe head-unit disconnect requests. Any number may register.
    pub async fn observe_disconnect_requests(&self) -> Result<DisconnectObserver> {
        let (done_tx, done_rx) = oneshot::channel();
        self.command(Command::ObserveDisconnects { done: done_tx })
            .await?;
        let receiver = done_rx.await.map_err(|_| Error::InvalidChannel)?;
        Ok(DisconnectObserver { receiver })
    }

    async fn command(&self, command: Command) -> Result<()> {
        self.commander
            .send(command)
            .await
            .map_err(|_| Error::InvalidChannel)
    }
}

struct Observer<T> {
    id: u64,
    sender: mpsc::Sender<T>,
}

struct ChannelTask {
    crypto: SessionCrypto,
    stream: MessageStream,
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<ChannelEvent>,
    message_observers: HashMap<Uuid, Observer<Vec<u8>>>,
    query_observers: HashMap<Uuid, Observer<ReceivedQuery>>,
    /// Recipients that have had an observer at some point. Traffic for a
    /// recipient in this set with no current observer is dropped, not
    /// buffered.
    observed_messages: HashSet<Uuid>,
    observed_queries: HashSet<Uuid>,
    missed_messages: HashMap<Uuid, VecDeque<Vec<u8>>>,
    missed_queries: HashMap<Uuid, VecDeque<ReceivedQuery>>,
    pending_queries: HashMap<i32, oneshot::Sender<QueryResponse>>,
    disconnect_observers: Vec<mpsc::Sender<()>>,
    next_query_id: i32,
    next_observer_id: u64,
}

impl ChannelTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        // Every handle dropped; the channel dies with them
                        break;
                    };
                    self.handle_command(command).await;
                }
                message = self.stream.recv() => {
                    match message {
                        Ok(message) => {
                            if let Err(e) = self.handle_message(message).await {
                                self.report_fatal(e).await;
                                break;
                            }
                        }
                        Err(e) => {
                            self.report_fatal(e).await;
                            break;
                        }
                    }
                }
            }
        }
        // Outstanding query futures resolve with InvalidChannel as their
        // oneshot senders drop here
        trace!("Secured channel finished");
    }

    async fn report_fatal(&mut self, error: Error) {
        error!("Secured channel is unrecoverable: {error}");
        let _ = self
            .events
            .send(ChannelEvent::UnrecoverableError(error))
            .await;
    }

    fn allocate_query_id(&mut self) -> i32 {
        let id = self.next_query_id;
        self.next_query_id = if self.next_query_id == i32::MAX {
            0
        } else {
            self.next_query_id + 1
        };
        id
    }

    fn allocate_observer_id(&mut self) -> u64 {
        self.next_observer_id += 1;
        self.next_observer_id
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::WriteEncrypted {
                payload,
                params,
                done,
            } => {
                let _ = done.send(self.write_encrypted(payload, params).await);
            }
            Command::SendQuery {
                query,
                recipient,
                sender,
                done,
            } => {
                let _ = done.send(self.send_query(query, recipient, sender).await);
            }
            Command::SendQueryResponse {
                response,
                recipient,
                done,
            } => {
                let wire = WireQueryResponse {
                    id: response.id,
                    is_successful: response.is_successful,
                    response: response.response,
                };
                let result = match wire.serialize() {
                    Ok(bytes) => {
                        self.write_encrypted(
                            bytes,
                            MessageParams {
                                recipient,
                                operation: OperationType::QueryResponse,
                            },
                        )
                        .await
                    }
                    Err(e) => Err(e.into()),
                };
                let _ = done.send(result);
            }
            Command::ObserveMessages { recipient, done } => {
                let _ = done.send(self.observe_messages(recipient));
            }
            Command::ObserveQueries { recipient, done } => {
                let _ = done.send(self.observe_queries(recipient));
            }
            Command::ObserveDisconnects { done } => {
                let (tx, rx) = mpsc::channel(4);
                self.disconnect_observers.push(tx);
                let _ = done.send(rx);
            }
            Command::Unobserve {
                recipient,
                kind,
                id,
            } => match kind {
                ObserverKind::Message => {
                    if self
                        .message_observers
                        .get(&recipient)
                        .is_some_and(|o| o.id == id)
                    {
                        self.message_observers.remove(&recipient);
                    }
                }
                ObserverKind::Query => {
                    if self
                        .query_observers
                        .get(&recipient)
                        .is_some_and(|o| o.id == id)
                    {
                        self.query_observers.remove(&recipient);
                    }
                }
            },
        }
    }

    async fn write_encrypted(&mut self, payload: Vec<u8>, params: MessageParams) -> Result<()> {
        if params.operation == OperationType::Disconnect {
            return Err(crate::ProtocolError::UnexpectedMessage(
                "phones do not send disconnect",
            )
            .into());
        }
        let ciphertext = self.crypto.encrypt(&payload)?;
        self.stream
            .send(StreamMessage {
                recipient: params.recipient,
                operation: params.operation,
                payload: ciphertext,
                is_encrypted: true,
            })
            .await
            .map_err(|e| match e {
                Error::Transport(_) => Error::InvalidChannel,
                other => other,
            })
    }

    async fn send_query(
        &mut self,
        query: Query,
        recipient: Uuid,
        sender: Uuid,
    ) -> Result<PendingQuery> {
        let id = self.allocate_query_id();
        let wire = WireQuery {
            id,
            sender,
            request: query.request,
            parameters: query.parameters.unwrap_or_default(),
        };
        let bytes = wire.serialize()?;
        self.write_encrypted(
            bytes,
            MessageParams {
                recipient,
                operation: OperationType::Query,
            },
        )
        .await?;
        let (tx, rx) = oneshot::channel();
        self.pending_queries.insert(id, tx);
        Ok(PendingQuery { receiver: rx })
    }

    fn observe_messages(&mut self, recipient: Uuid) -> Result<(u64, mpsc::Receiver<Vec<u8>>)> {
        if self.message_observers.contains_key(&recipient) {
            return Err(Error::ObserverAlreadyRegistered);
        }
        let id = self.allocate_observer_id();
        let (tx, rx) = mpsc::channel(MISSED_MESSAGE_CAP * 2);
        if let Some(missed) = self.missed_messages.remove(&recipient) {
            for message in missed {
                // Capacity covers the whole buffer; replay cannot block
                let _ = tx.try_send(message);
            }
        }
        self.observed_messages.insert(recipient);
        self.message_observers
            .insert(recipient, Observer { id, sender: tx });
        Ok((id, rx))
    }

    fn observe_queries(
        &mut self,
        recipient: Uuid,
    ) -> Result<(u64, mpsc::Receiver<ReceivedQuery>)> {
        if self.query_observers.contains_key(&recipient) {
            return Err(Error::ObserverAlreadyRegistered);
        }
        let id = self.allocate_observer_id();
        let (tx, rx) = mpsc::channel(MISSED_MESSAGE_CAP * 2);
        if let Some(missed) = self.missed_queries.remove(&recipient) {
            for query in missed {
                let _ = tx.try_send(query);
            }
        }
        self.observed_queries.insert(recipient);
        self.query_observers
            .insert(recipient, Observer { id, sender: tx });
        Ok((id, rx))
    }

    async fn handle_message(&mut self, message: StreamMessage) -> Result<()> {
        let payload = if message.is_encrypted {
            self.crypto.decrypt(&message.payload)?
        } else {
            message.payload
        };
        match message.operation {
            OperationType::EncryptionHandshake => {
                warn!("Ignoring handshake traffic on an established channel");
            }
            OperationType::ClientMessage => {
                self.deliver_message(message.recipient, payload).await;
            }
            OperationType::Query => {
                let wire = WireQuery::deserialize(&payload)?;
                let received = ReceivedQuery {
                    id: wire.id,
                    sender: wire.sender,
                    query: Query {
                        request: wire.request,
                        parameters: if wire.parameters.is_empty() {
                            None
                        } else {
                            Some(wire.parameters)
                        },
                    },
                };
                self.deliver_query(message.recipient, received).await;
            }
            OperationType::QueryResponse => {
                let wire = WireQueryResponse::deserialize(&payload)?;
                match self.pending_queries.remove(&wire.id) {
                    Some(tx) => {
                        let _ = tx.send(QueryResponse {
                            id: wire.id,
                            is_successful: wire.is_successful,
                            response: wire.response,
                        });
                    }
                    None => {
                        // Unknown ids are dropped without ceremony
                        debug!("Dropping query response with unknown id {}", wire.id);
                    }
                }
            }
            OperationType::Disconnect => {
                debug!("Head unit requested disconnect");
                self.disconnect_observers
                    .retain(|observer| observer.try_send(()).is_ok());
                let _ = self.events.send(ChannelEvent::DisconnectRequested).await;
            }
        }
        Ok(())
    }

    async fn deliver_message(&mut self, recipient: Uuid, payload: Vec<u8>) {
        if let Some(observer) = self.message_observers.get(&recipient) {
            if observer.sender.send(payload.clone()).await.is_ok() {
                return;
            }
            // Receiver went away; reclaim the slot
            self.message_observers.remove(&recipient);
        }
        if self.observed_messages.contains(&recipient) {
            debug!("Dropping message for cancelled observer of {recipient}");
            return;
        }
        let buffer = self.missed_messages.entry(recipient).or_default();
        if buffer.len() >= MISSED_MESSAGE_CAP {
            warn!("Missed-message buffer for {recipient} overflowed, dropping oldest");
            buffer.pop_front();
        }
        buffer.push_back(payload);
    }

    async fn deliver_query(&mut self, recipient: Uuid, query: ReceivedQuery) {
        if let Some(observer) = self.query_observers.get(&recipient) {
            if observer.sender.send(query.clone()).await.is_ok() {
                return;
            }
            self.query_observers.remove(&recipient);
        }
        if self.observed_queries.contains(&recipient) {
            debug!("Dropping query for cancelled observer of {recipient}");
            return;
        }
        let buffer = self.missed_queries.entry(recipient).or_default();
        if buffer.len() >= MISSED_MESSAGE_CAP {
            warn!("Missed-query buffer for {recipient} overflowed, dropping oldest");
            buffer.pop_front();
        }
        buffer.push_back(query);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockPeripheral, MockRemote, MockSessionContext};
    use crate::stream::MessageStreamVersion;
    use crate::wire::model::{DeviceMessage, Packet};
    use assert_matches::assert_matches;
    use env_logger::Env;

    fn init() {
        let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .is_test(true)
            .try_init();
    }

    const WRITE_CHAR: Uuid = uuid::uuid!("5e2a68a5-27be-43f9-8d1e-4546976fabd7");
    const FEATURE: Uuid = uuid::uuid!("00000000-0000-0000-0000-00000000f00d");
    const KEY: &[u8] = b"channel-test-key";

    /// Head-unit side of an established channel, speaking the mock cipher
    struct FakeCar {
        remote: MockRemote,
        crypto: MockSessionContext,
    }

    impl FakeCar {
        async fn send(&self, operation: OperationType, recipient: Uuid, plaintext: &[u8]) {
            let payload = self.crypto.apply(plaintext);
            let envelope = DeviceMessage {
                recipient,
                is_encrypted: true,
                operation,
                payload,
                original_size: 0,
            };
            let packet = Packet {
                message_id: 99,
                packet_number: 1,
                total_packets: 1,
                payload: envelope.serialize().unwrap(),
            };
            self.remote
                .notify(WRITE_CHAR, packet.serialize().unwrap())
                .await;
        }

        async fn recv(&mut self) -> (OperationType, Uuid, Vec<u8>) {
            let (_, value) = self.remote.next_write().await.unwrap();
            let packet = Packet::deserialize(&value).unwrap();
            assert_eq!(packet.total_packets, 1, "test messages must fit one packet");
            let envelope = DeviceMessage::deserialize(&packet.payload).unwrap();
            let plaintext = self.crypto.apply(&envelope.payload);
            (envelope.operation, envelope.recipient, plaintext)
        }
    }

    fn establish_at(
        next_query_id: i32,
    ) -> (SecuredChannel, mpsc::Receiver<ChannelEvent>, FakeCar) {
        let (peripheral, remote) = MockPeripheral::connected(185);
        let notifications = remote.subscription(WRITE_CHAR);
        let stream = MessageStream::new(
            MessageStreamVersion::V2 { compression: false },
            peripheral,
            WRITE_CHAR,
            notifications,
        );
        let crypto = SessionCrypto::new(Box::new(MockSessionContext::new(KEY.to_vec())));
        let car = Car {
            id: Uuid::new_v4(),
            name: Some("Garage".to_string()),
        };
        let (channel, events) =
            SecuredChannel::establish_with_query_id(car, stream, crypto, next_query_id);
        (
            channel,
            events,
            FakeCar {
                remote,
                crypto: MockSessionContext::new(KEY.to_vec()),
            },
        )
    }

    fn establish() -> (SecuredChannel, mpsc::Receiver<ChannelEvent>, FakeCar) {
        establish_at(0)
    }

    #[tokio::test]
    async fn test_write_encrypted_roundtrip() {
        init();
        let (channel, _events, mut car) = establish();
        channel
            .write_encrypted(
                b"hello car".to_vec(),
                MessageParams {
                    recipient: FEATURE,
                    operation: OperationType::ClientMessage,
                },
            )
            .await
            .unwrap();
        let (operation, recipient, plaintext) = car.recv().await;
        assert_eq!(operation, OperationType::ClientMessage);
        assert_eq!(recipient, FEATURE);
        assert_eq!(plaintext, b"hello car");
    }

    #[tokio::test]
    async fn test_disconnect_is_never_sent() {
        init();
        let (channel, _events, _car) = establish();
        assert_matches!(
            channel
                .write_encrypted(
                    vec![],
                    MessageParams {
                        recipient: FEATURE,
                        operation: OperationType::Disconnect,
                    },
                )
                .await,
            Err(Error::Protocol(_))
        );
    }

    #[tokio::test]
    async fn test_query_response_roundtrip() {
        init();
        // Four queries already allocated; the next id must be 4
        let (channel, _events, mut car) = establish_at(4);
        let pending = channel
            .send_query(
                Query {
                    request: vec![0xAA, 0xBB],
                    parameters: None,
                },
                FEATURE,
                FEATURE,
            )
            .await
            .unwrap();

        let (operation, _, plaintext) = car.recv().await;
        assert_eq!(operation, OperationType::Query);
        let wire = WireQuery::deserialize(&plaintext).unwrap();
        assert_eq!(wire.id, 4);
        assert_eq!(wire.request, vec![0xAA, 0xBB]);

        // A response with an unknown id is silently dropped
        let stray = WireQueryResponse {
            id: 10,
            is_successful: false,
            response: vec![],
        };
        car.send(
            OperationType::QueryResponse,
            FEATURE,
            &stray.serialize().unwrap(),
        )
        .await;

        let real = WireQueryResponse {
            id: 4,
            is_successful: true,
            response: vec![0xCC],
        };
        car.send(
            OperationType::QueryResponse,
            FEATURE,
            &real.serialize().unwrap(),
        )
        .await;

        let response = pending.response().await.unwrap();
        assert!(response.is_successful);
        assert_eq!(response.response, vec![0xCC]);
    }

    #[tokio::test]
    async fn test_query_ids_wrap_to_zero() {
        init();
        let (channel, _events, mut car) = establish_at(i32::MAX);
        for expected in [i32::MAX, 0, 1] {
            channel
                .send_query(Query::default(), FEATURE, FEATURE)
                .await
                .unwrap();
            let (_, _, plaintext) = car.recv().await;
            assert_eq!(WireQuery::deserialize(&plaintext).unwrap().id, expected);
        }
    }

    #[tokio::test]
    async fn test_missed_messages_replay_in_order() {
        init();
        let (channel, _events, car) = establish();
        for n in 0..3u8 {
            car.send(OperationType::ClientMessage, FEATURE, &[n]).await;
        }
        // Queries for the same recipient are buffered independently
        let query = WireQuery {
            id: 1,
            sender: FEATURE,
            request: vec![0x0F],
            parameters: vec![],
        };
        car.send(OperationType::Query, FEATURE, &query.serialize().unwrap())
            .await;

        // Give the channel task a chance to buffer everything
        tokio::task::yield_now().await;
        let mut observer = channel.observe_messages(FEATURE).await.unwrap();
        for n in 0..3u8 {
            assert_eq!(observer.recv().await.unwrap(), vec![n]);
        }
        // Live traffic follows the replay
        car.send(OperationType::ClientMessage, FEATURE, &[9]).await;
        assert_eq!(observer.recv().await.unwrap(), vec![9]);

        let mut queries = channel.observe_queries(FEATURE).await.unwrap();
        let received = queries.recv().await.unwrap();
        assert_eq!(received.id, 1);
        assert_eq!(received.query.request, vec![0x0F]);
    }

    #[tokio::test]
    async fn test_second_observer_is_rejected_until_cancel() {
        init();
        let (channel, _events, car) = establish();
        let observer = channel.observe_messages(FEATURE).await.unwrap();
        assert_matches!(
            channel.observe_messages(FEATURE).await,
            Err(Error::ObserverAlreadyRegistered)
        );

        observer.handle.cancel().await;
        // Traffic in the gap is dropped, not buffered
        car.send(OperationType::ClientMessage, FEATURE, &[0x55]).await;
        tokio::task::yield_now().await;

        let mut second = channel.observe_messages(FEATURE).await.unwrap();
        car.send(OperationType::ClientMessage, FEATURE, &[0x66]).await;
        assert_eq!(second.recv().await.unwrap(), vec![0x66]);
    }

    #[tokio::test]
    async fn test_disconnect_request_notifies_observers() {
        init();
        let (channel, mut events, car) = establish();
        let mut observer = channel.observe_disconnect_requests().await.unwrap();
        car.send(OperationType::Disconnect, Uuid::nil(), &[]).await;
        assert_eq!(observer.recv().await, Some(()));
        assert_matches!(events.recv().await, Some(ChannelEvent::DisconnectRequested));
    }

    #[tokio::test]
    async fn test_teardown_resolves_pending_queries_with_invalid_channel() {
        init();
        let (channel, mut events, mut car) = establish();
        let pending = channel
            .send_query(Query::default(), FEATURE, FEATURE)
            .await
            .unwrap();
        car.recv().await;

        // A garbage packet kills the stream and with it the channel
        car.remote.notify(WRITE_CHAR, vec![0xFF, 0xFF, 0xFF]).await;
        assert_matches!(
            events.recv().await,
            Some(ChannelEvent::UnrecoverableError(_))
        );
        assert_matches!(pending.response().await, Err(Error::InvalidChannel));
    }
}
