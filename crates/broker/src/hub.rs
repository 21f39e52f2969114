//! The hub owns every routing table and is the single dispatch point for
//! parsed messages. It runs as one task; sessions talk to it over an mpsc
//! channel, so all core state is confined to this task and needs no locking.

use std::collections::HashMap;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use squawkbus_protocol::v1::{
    DataPacket, ForwardedMulticastData, ForwardedSubscriptionRequest, ForwardedUnicastData,
    Message, MulticastData, NotificationRequest, SubscriptionRequest, UnicastData,
};

use crate::authorization::{AuthorizationRepository, Role};
use crate::{BrokerError, SessionId};
use crate::notifications::{ListenOutcome, NotificationManager};
use crate::subscriptions::SubscriptionManager;

/// What a session task tells the hub.
pub enum SessionEvent {
    Connect {
        session: SessionId,
        client_id: String,
        host: String,
        user: String,
        tx: mpsc::Sender<Message>,
        cancel: CancellationToken,
    },
    Message {
        session: SessionId,
        message: Message,
    },
    Close {
        session: SessionId,
    },
    Shutdown,
}

struct SessionHandle {
    client_id: String,
    host: String,
    user: String,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
}

pub struct Hub {
    sessions: HashMap<SessionId, SessionHandle>,
    by_client_id: HashMap<String, SessionId>,
    subscriptions: SubscriptionManager,
    notifications: NotificationManager,
    authorizations: AuthorizationRepository,
}

type Outbound = (SessionId, Message);

impl Hub {
    pub fn new(authorizations: AuthorizationRepository) -> Self {
        Hub {
            sessions: HashMap::new(),
            by_client_id: HashMap::new(),
            subscriptions: SubscriptionManager::new(),
            notifications: NotificationManager::new(),
            authorizations,
        }
    }

    /// Process events until shutdown, then close every session.
    pub async fn run(authorizations: AuthorizationRepository, mut rx: mpsc::Receiver<SessionEvent>) {
        let mut hub = Hub::new(authorizations);
        while let Some(event) = rx.recv().await {
            if !hub.handle_event(event) {
                break;
            }
        }
        hub.close_all();
    }

    /// Apply one event. Returns false when the hub should stop.
    pub fn handle_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::Connect {
                session,
                client_id,
                host,
                user,
                tx,
                cancel,
            } => {
                tracing::debug!(session, %client_id, %user, "client connected");
                self.by_client_id.insert(client_id.clone(), session);
                self.sessions.insert(
                    session,
                    SessionHandle {
                        client_id,
                        host,
                        user,
                        tx,
                        cancel,
                    },
                );
            }
            SessionEvent::Message { session, message } => self.on_message(session, message),
            SessionEvent::Close { session } => {
                let outbound = self.drop_session(session);
                self.deliver(outbound);
            }
            SessionEvent::Shutdown => return false,
        }
        true
    }

    fn on_message(&mut self, session: SessionId, message: Message) {
        if !self.sessions.contains_key(&session) {
            // A message raced a close; the session is already gone.
            return;
        }

        match message {
            Message::SubscriptionRequest(m) => self.on_subscription_request(session, m),
            Message::NotificationRequest(m) => self.on_notification_request(session, m),
            Message::MulticastData(m) => self.on_multicast_data(session, m),
            Message::UnicastData(m) => self.on_unicast_data(session, m),
            Message::AuthenticationRequest(_) => {
                self.violation(session, "authentication request after login")
            }
            Message::AuthenticationResponse(_)
            | Message::ForwardedSubscriptionRequest(_)
            | Message::ForwardedMulticastData(_)
            | Message::ForwardedUnicastData(_) => {
                self.violation(session, "server-only message from client")
            }
        }
    }

    fn on_subscription_request(&mut self, session: SessionId, request: SubscriptionRequest) {
        let SubscriptionRequest { topic, is_add } = request;
        tracing::debug!(session, %topic, is_add, "subscription request");

        if self.subscriptions.on_subscribe(session, &topic, is_add) {
            let outbound = self.subscription_changed(session, &topic, is_add);
            self.deliver(outbound);
        }
    }

    fn on_notification_request(&mut self, session: SessionId, request: NotificationRequest) {
        let NotificationRequest { pattern, is_add } = request;
        tracing::debug!(session, %pattern, is_add, "notification request");

        match self.notifications.on_listen(session, &pattern, is_add) {
            ListenOutcome::InvalidPattern => {
                self.violation(session, "invalid notification pattern")
            }
            ListenOutcome::Registered => {
                // Bring the new listener up to date with the subscriptions
                // that already match its pattern.
                let image = match self.notifications.pattern(&pattern) {
                    Some(regex) => self.subscriptions.find_matches(regex),
                    None => Vec::new(),
                };

                let mut outbound = Vec::new();
                for (topic, subscribers) in image {
                    for subscriber in subscribers {
                        if subscriber == session {
                            continue;
                        }
                        let Some(handle) = self.sessions.get(&subscriber) else {
                            continue;
                        };
                        outbound.push((
                            session,
                            Message::ForwardedSubscriptionRequest(ForwardedSubscriptionRequest {
                                user: handle.user.clone(),
                                host: handle.host.clone(),
                                client_id: handle.client_id.clone(),
                                topic: topic.clone(),
                                is_add: true,
                            }),
                        ));
                    }
                }
                self.deliver(outbound);
            }
            ListenOutcome::Counted | ListenOutcome::Ignored => {}
        }
    }

    fn on_multicast_data(&mut self, publisher: SessionId, data: MulticastData) {
        let MulticastData {
            topic,
            data_packets,
        } = data;

        let Some(handle) = self.sessions.get(&publisher) else {
            return;
        };
        let user = handle.user.clone();
        let host = handle.host.clone();

        // Packets the publisher is not entitled to send are dropped before
        // fan-out; the session stays open.
        let entitlements = self.authorizations.entitlements(&user, &topic, Role::Publisher);
        let packets: Vec<DataPacket> = data_packets
            .into_iter()
            .filter(|p| p.is_authorized(&entitlements))
            .collect();
        if packets.is_empty() {
            return;
        }

        let subscribers: Vec<SessionId> = self.subscriptions.subscribers(&topic).collect();
        let mut outbound = Vec::new();
        for subscriber in subscribers {
            let Some(sub_handle) = self.sessions.get(&subscriber) else {
                continue;
            };
            let sub_user = sub_handle.user.clone();
            let entitlements = self
                .authorizations
                .entitlements(&sub_user, &topic, Role::Subscriber);
            let filtered: Vec<DataPacket> = packets
                .iter()
                .filter(|p| p.is_authorized(&entitlements))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }
            outbound.push((
                subscriber,
                Message::ForwardedMulticastData(ForwardedMulticastData {
                    user: user.clone(),
                    host: host.clone(),
                    feed: String::new(),
                    topic: topic.clone(),
                    content_type: String::new(),
                    data_packets: filtered,
                }),
            ));
        }
        self.deliver(outbound);
    }

    fn on_unicast_data(&mut self, sender: SessionId, data: UnicastData) {
        let UnicastData {
            client_id,
            topic,
            data_packets,
        } = data;

        let Some(handle) = self.sessions.get(&sender) else {
            return;
        };
        let user = handle.user.clone();
        let host = handle.host.clone();
        let sender_client_id = handle.client_id.clone();

        let Some(&target) = self.by_client_id.get(&client_id) else {
            tracing::debug!(%client_id, "unicast to unknown client dropped");
            return;
        };
        let Some(target_handle) = self.sessions.get(&target) else {
            return;
        };
        let target_user = target_handle.user.clone();

        let publisher_entitlements =
            self.authorizations.entitlements(&user, &topic, Role::Publisher);
        let subscriber_entitlements =
            self.authorizations
                .entitlements(&target_user, &topic, Role::Subscriber);
        let packets: Vec<DataPacket> = data_packets
            .into_iter()
            .filter(|p| {
                p.is_authorized(&publisher_entitlements) && p.is_authorized(&subscriber_entitlements)
            })
            .collect();
        if packets.is_empty() {
            return;
        }

        self.deliver(vec![(
            target,
            Message::ForwardedUnicastData(ForwardedUnicastData {
                user,
                host,
                client_id: sender_client_id,
                feed: String::new(),
                topic,
                content_type: String::new(),
                data_packets: packets,
            }),
        )]);
    }

    /// Messages for every listener whose pattern matches the changed topic.
    fn subscription_changed(
        &mut self,
        subscriber: SessionId,
        topic: &str,
        is_add: bool,
    ) -> Vec<Outbound> {
        let Some(handle) = self.sessions.get(&subscriber) else {
            return Vec::new();
        };
        let message = Message::ForwardedSubscriptionRequest(ForwardedSubscriptionRequest {
            user: handle.user.clone(),
            host: handle.host.clone(),
            client_id: handle.client_id.clone(),
            topic: topic.to_string(),
            is_add,
        });

        self.notifications
            .interested_listeners(subscriber, topic)
            .into_iter()
            .map(|listener| (listener, message.clone()))
            .collect()
    }

    fn violation(&mut self, session: SessionId, reason: &'static str) {
        tracing::warn!(session, reason, "closing session");
        let outbound = self.drop_session(session);
        self.deliver(outbound);
    }

    /// Remove the session from every table and cancel its tasks, returning
    /// the unsubscribe notifications its departure triggers.
    fn drop_session(&mut self, session: SessionId) -> Vec<Outbound> {
        let Some(handle) = self.sessions.remove(&session) else {
            return Vec::new();
        };
        tracing::debug!(session, client_id = %handle.client_id, "client disconnected");
        handle.cancel.cancel();
        self.by_client_id.remove(&handle.client_id);

        let removed_topics = self.subscriptions.on_disconnect(session);
        self.notifications.on_disconnect(session);

        let mut outbound = Vec::new();
        for topic in removed_topics {
            let message = Message::ForwardedSubscriptionRequest(ForwardedSubscriptionRequest {
                user: handle.user.clone(),
                host: handle.host.clone(),
                client_id: handle.client_id.clone(),
                topic: topic.clone(),
                is_add: false,
            });
            for listener in self.notifications.interested_listeners(session, &topic) {
                outbound.push((listener, message.clone()));
            }
        }
        outbound
    }

    /// Enqueue routed messages on their sessions' outbound queues. A session
    /// whose queue is full is dropped, which may itself trigger notifications;
    /// those are delivered in turn until nothing overflows.
    fn deliver(&mut self, outbound: Vec<Outbound>) {
        let mut pending = outbound;
        while !pending.is_empty() {
            let mut overflowed = Vec::new();
            for (session, message) in pending {
                let Some(handle) = self.sessions.get(&session) else {
                    continue;
                };
                match handle.tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        let error = BrokerError::OutboundOverflow;
                        tracing::warn!(session, %error, "dropping session");
                        overflowed.push(session);
                    }
                    Err(TrySendError::Closed(_)) => {
                        // The session task is already exiting; its close event
                        // will clean up.
                    }
                }
            }

            pending = Vec::new();
            for session in overflowed {
                pending.extend(self.drop_session(session));
            }
        }
    }

    fn close_all(&mut self) {
        tracing::info!("closing {} sessions", self.sessions.len());
        for handle in self.sessions.values() {
            handle.cancel.cancel();
        }
        self.sessions.clear();
        self.by_client_id.clear();
    }
}
