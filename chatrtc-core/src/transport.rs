//! In-memory chat transport
//!
//! [`ChatRoom`] stands in for the hosting chat system: every session is an
//! ordered broadcast of lines that every subscribed member sees, the author
//! included. It backs the CLI demo and the integration tests and is not
//! meant as a long-running chat store: history keeps only the most recent
//! lines of each session.

use crate::identity::ParticipantId;
use crate::signaling::{InboundPayload, SignalingTransport, TransportError};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Lines buffered per subscriber before it starts lagging
const DEFAULT_CAPACITY: usize = 1024;

/// Lines kept per session for [`ChatRoom::history`]
const DEFAULT_HISTORY_LIMIT: usize = 4096;

#[derive(Debug)]
struct Session {
    sender: broadcast::Sender<InboundPayload>,
    history: VecDeque<InboundPayload>,
}

#[derive(Debug)]
struct RoomInner {
    capacity: usize,
    history_limit: usize,
    sessions: Mutex<HashMap<String, Session>>,
}

impl RoomInner {
    fn session<'a>(&self, sessions: &'a mut HashMap<String, Session>, id: &str) -> &'a mut Session {
        sessions.entry(id.to_string()).or_insert_with(|| Session {
            sender: broadcast::channel(self.capacity).0,
            history: VecDeque::new(),
        })
    }
}

/// In-memory ordered chat
#[derive(Debug, Clone)]
pub struct ChatRoom {
    inner: Arc<RoomInner>,
}

impl Default for ChatRoom {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl ChatRoom {
    /// Create an empty room
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a room buffering `capacity` lines per subscriber
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_limits(capacity, DEFAULT_HISTORY_LIMIT)
    }

    /// Create a room buffering `capacity` lines per subscriber and keeping
    /// the last `history_limit` lines of each session
    #[must_use]
    pub fn with_limits(capacity: usize, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                capacity: capacity.max(1),
                history_limit: history_limit.max(1),
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Transport handle posting as `member`
    pub fn join(&self, member: impl Into<ParticipantId>) -> ChatRoomMember {
        ChatRoomMember {
            room: self.clone(),
            member: member.into(),
        }
    }

    /// Recent lines posted to `session_id`, oldest first
    pub fn history(&self, session_id: &str) -> Vec<InboundPayload> {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .map(|s| s.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Lines posted to `session_id` by `member` that start with `prefix`
    pub fn count_from(&self, session_id: &str, member: &str, prefix: &str) -> usize {
        self.history(session_id)
            .iter()
            .filter(|line| line.sender_id == *member && line.payload.starts_with(prefix))
            .count()
    }
}

/// One member's view of a [`ChatRoom`]
#[derive(Debug, Clone)]
pub struct ChatRoomMember {
    room: ChatRoom,
    member: ParticipantId,
}

impl ChatRoomMember {
    /// Member the handle posts as
    pub fn member(&self) -> &ParticipantId {
        &self.member
    }
}

#[async_trait]
impl SignalingTransport for ChatRoomMember {
    async fn send(&self, session_id: &str, payload: String) -> Result<(), TransportError> {
        let line = InboundPayload {
            payload,
            sender_id: self.member.clone(),
        };
        let inner = &self.room.inner;
        let mut sessions = inner.sessions.lock();
        let session = inner.session(&mut sessions, session_id);
        if session.history.len() == inner.history_limit {
            session.history.pop_front();
        }
        session.history.push_back(line.clone());
        // No subscribers is fine: the line still lands in history
        let _ = session.sender.send(line);
        Ok(())
    }

    fn subscribe(&self, session_id: &str) -> BoxStream<'static, InboundPayload> {
        let member = self.member.clone();
        let receiver = {
            let inner = &self.room.inner;
            let mut sessions = inner.sessions.lock();
            inner.session(&mut sessions, session_id).sender.subscribe()
        };
        BroadcastStream::new(receiver)
            .filter_map(move |item| {
                let line = match item {
                    Ok(line) => Some(line),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(%member, skipped, "Chat subscriber lagged, lines lost");
                        None
                    }
                };
                futures::future::ready(line)
            })
            .boxed()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_member_sees_every_line() {
        let room = ChatRoom::new();
        let alice = room.join("alice");
        let bob = room.join("bob");
        let mut alice_rx = alice.subscribe("s");
        let mut bob_rx = bob.subscribe("s");

        alice.send("s", "hi".to_string()).await.unwrap();
        bob.send("s", "hello".to_string()).await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            let first = rx.next().await.unwrap();
            let second = rx.next().await.unwrap();
            assert_eq!((first.payload.as_str(), first.sender_id.as_str()), ("hi", "alice"));
            assert_eq!((second.payload.as_str(), second.sender_id.as_str()), ("hello", "bob"));
        }
        assert_eq!(room.history("s").len(), 2);
        assert_eq!(room.count_from("s", "bob", "hel"), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let room = ChatRoom::new();
        let alice = room.join("alice");
        alice.send("one", "a".to_string()).await.unwrap();
        alice.send("two", "b".to_string()).await.unwrap();
        assert_eq!(room.history("one").len(), 1);
        assert_eq!(room.history("two")[0].payload, "b");
        assert!(room.history("three").is_empty());
    }

    #[tokio::test]
    async fn test_history_keeps_only_recent_lines() {
        let room = ChatRoom::with_limits(16, 3);
        let alice = room.join("alice");
        for i in 0..5 {
            alice.send("s", format!("line {i}")).await.unwrap();
        }
        let kept: Vec<String> = room.history("s").into_iter().map(|l| l.payload).collect();
        assert_eq!(kept, vec!["line 2", "line 3", "line 4"]);
    }
}
