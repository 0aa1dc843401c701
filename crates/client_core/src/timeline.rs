use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageStatus, RoomId, UserId},
    protocol::{MessagePayload, SenderSummary, WireMessageId},
};

/// One bubble in the active room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub message: MessagePayload,
    /// Set only on entries created locally by an optimistic send.
    pub client_temp_ts: Option<i64>,
}

impl TimelineEntry {
    pub fn is_pending(&self) -> bool {
        !self.message.is_confirmed() && self.message.status != MessageStatus::Failed
    }

    pub fn is_failed(&self) -> bool {
        self.message.status == MessageStatus::Failed
    }

    pub fn is_mine(&self, user_id: Option<UserId>) -> bool {
        user_id == Some(self.message.sender.id)
    }

    /// Stable key for list rendering. Pending entries all share the sentinel
    /// id, so the local timestamp and creation time disambiguate them.
    pub fn render_key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.message.id,
            self.client_temp_ts.unwrap_or(0),
            self.message
                .created_at
                .map(|created_at| created_at.to_rfc3339())
                .unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PendingKey {
    sender: UserId,
    content: String,
}

impl PendingKey {
    fn of(message: &MessagePayload) -> Self {
        Self {
            sender: message.sender.id,
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A pending entry was replaced in place by its confirmation.
    Confirmed {
        index: usize,
        client_temp_ts: Option<i64>,
    },
    Appended {
        index: usize,
    },
    /// Unconfirmed server echo of an entry that is already pending locally.
    EchoSuppressed,
}

/// Ordered message sequence of the active room plus the index of unresolved
/// pending entries.
///
/// Entries are only ever appended or replaced in place, so positions stored in
/// the pending index stay valid until the next `clear`.
#[derive(Debug, Default)]
pub struct MessageTimeline {
    entries: Vec<TimelineEntry>,
    pending: HashMap<PendingKey, VecDeque<usize>>,
    last_client_temp_ts: i64,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn unresolved_pending(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Drops every entry. The local timestamp counter survives so stamps stay
    /// monotonic across rooms.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
    }

    pub fn replace_history(&mut self, messages: Vec<MessagePayload>) {
        self.clear();
        for message in messages {
            self.push_entry(TimelineEntry {
                message,
                client_temp_ts: None,
            });
        }
    }

    /// Strictly increasing millisecond stamp, even when the clock stalls or
    /// steps back.
    pub fn next_client_temp_ts(&mut self, now_ms: i64) -> i64 {
        let stamp = now_ms.max(self.last_client_temp_ts + 1);
        self.last_client_temp_ts = stamp;
        stamp
    }

    pub fn push_pending(
        &mut self,
        room_id: RoomId,
        sender: SenderSummary,
        content: String,
        now: DateTime<Utc>,
    ) -> (usize, i64) {
        let client_temp_ts = self.next_client_temp_ts(now.timestamp_millis());
        let index = self.push_entry(TimelineEntry {
            message: MessagePayload {
                id: WireMessageId::pending(),
                room_id,
                sender,
                content,
                created_at: Some(now),
                status: MessageStatus::Sending,
            },
            client_temp_ts: Some(client_temp_ts),
        });
        (index, client_temp_ts)
    }

    /// Folds an inbound message into the sequence.
    ///
    /// A confirmed message resolves the oldest pending entry with the same
    /// sender and content, keeping its position. Anything else is appended.
    pub fn merge_incoming(&mut self, message: MessagePayload) -> MergeOutcome {
        let key = PendingKey::of(&message);
        if message.is_confirmed() {
            if let Some(index) = self.take_oldest_pending(&key) {
                let replaced = std::mem::replace(
                    &mut self.entries[index],
                    TimelineEntry {
                        message,
                        client_temp_ts: None,
                    },
                );
                return MergeOutcome::Confirmed {
                    index,
                    client_temp_ts: replaced.client_temp_ts,
                };
            }
        } else if self.pending.contains_key(&key) {
            return MergeOutcome::EchoSuppressed;
        }

        let index = self.push_entry(TimelineEntry {
            message,
            client_temp_ts: None,
        });
        MergeOutcome::Appended { index }
    }

    /// Gives up on a local pending entry. Returns its position if it was still
    /// waiting for a confirmation.
    pub fn fail_pending(&mut self, client_temp_ts: i64) -> Option<usize> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.client_temp_ts == Some(client_temp_ts) && entry.is_pending())?;
        let key = PendingKey::of(&self.entries[index].message);
        if let Some(queue) = self.pending.get_mut(&key) {
            queue.retain(|pending_index| *pending_index != index);
            if queue.is_empty() {
                self.pending.remove(&key);
            }
        }
        self.entries[index].message.status = MessageStatus::Failed;
        Some(index)
    }

    fn push_entry(&mut self, entry: TimelineEntry) -> usize {
        let index = self.entries.len();
        if entry.is_pending() {
            self.pending
                .entry(PendingKey::of(&entry.message))
                .or_default()
                .push_back(index);
        }
        self.entries.push(entry);
        index
    }

    fn take_oldest_pending(&mut self, key: &PendingKey) -> Option<usize> {
        let queue = self.pending.get_mut(key)?;
        let index = queue.pop_front();
        if queue.is_empty() {
            self.pending.remove(key);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use shared::domain::MessageId;

    use super::*;

    const ME: UserId = UserId(7);
    const OTHER: UserId = UserId(8);
    const ROOM: RoomId = RoomId(42);

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000 + ms).expect("timestamp")
    }

    fn confirmed(id: i64, sender: UserId, content: &str) -> MessagePayload {
        MessagePayload {
            id: WireMessageId::Numeric(id),
            room_id: ROOM,
            sender: SenderSummary::new(sender),
            content: content.into(),
            created_at: Some(at(500)),
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn confirmation_replaces_pending_entry_in_place() {
        let mut timeline = MessageTimeline::new();
        timeline.replace_history(vec![confirmed(1, OTHER, "hey")]);
        let (index, stamp) =
            timeline.push_pending(ROOM, SenderSummary::new(ME), "hello".into(), at(0));
        timeline.merge_incoming(confirmed(2, OTHER, "how are you"));

        let outcome = timeline.merge_incoming(confirmed(501, ME, "hello"));

        assert_eq!(
            outcome,
            MergeOutcome::Confirmed {
                index,
                client_temp_ts: Some(stamp)
            }
        );
        let contents: Vec<_> = timeline
            .entries()
            .iter()
            .map(|entry| entry.message.content.as_str())
            .collect();
        assert_eq!(contents, ["hey", "hello", "how are you"]);
        let hello = &timeline.entries()[index];
        assert_eq!(hello.message.id.confirmed(), Some(MessageId(501)));
        assert_eq!(hello.message.status, MessageStatus::Sent);
        assert_eq!(timeline.unresolved_pending(), 0);
    }

    #[test]
    fn duplicate_content_resolves_first_in_first_out() {
        let mut timeline = MessageTimeline::new();
        let (first, _) = timeline.push_pending(ROOM, SenderSummary::new(ME), "hi".into(), at(0));
        let (second, _) = timeline.push_pending(ROOM, SenderSummary::new(ME), "hi".into(), at(0));
        assert_eq!(timeline.unresolved_pending(), 2);

        assert!(matches!(
            timeline.merge_incoming(confirmed(10, ME, "hi")),
            MergeOutcome::Confirmed { index, .. } if index == first
        ));
        assert!(timeline.entries()[second].is_pending());
        assert!(matches!(
            timeline.merge_incoming(confirmed(11, ME, "hi")),
            MergeOutcome::Confirmed { index, .. } if index == second
        ));

        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline.unresolved_pending(), 0);
        assert_eq!(
            timeline.entries()[0].message.id.confirmed(),
            Some(MessageId(10))
        );
        assert_eq!(
            timeline.entries()[1].message.id.confirmed(),
            Some(MessageId(11))
        );
    }

    #[test]
    fn other_senders_and_unmatched_content_are_appended() {
        let mut timeline = MessageTimeline::new();
        timeline.push_pending(ROOM, SenderSummary::new(ME), "hello".into(), at(0));

        assert_eq!(
            timeline.merge_incoming(confirmed(3, OTHER, "hello")),
            MergeOutcome::Appended { index: 1 }
        );
        assert_eq!(
            timeline.merge_incoming(confirmed(4, ME, "something else")),
            MergeOutcome::Appended { index: 2 }
        );
        assert_eq!(timeline.unresolved_pending(), 1);
    }

    #[test]
    fn unconfirmed_echo_of_local_pending_is_suppressed() {
        let mut timeline = MessageTimeline::new();
        timeline.push_pending(ROOM, SenderSummary::new(ME), "hello".into(), at(0));

        let mut echo = confirmed(0, ME, "hello");
        echo.id = WireMessageId::pending();
        assert_eq!(timeline.merge_incoming(echo), MergeOutcome::EchoSuppressed);
        assert_eq!(timeline.len(), 1);

        timeline.merge_incoming(confirmed(501, ME, "hello"));
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline.unresolved_pending(), 0);
    }

    #[test]
    fn remote_temporary_message_is_replaced_by_its_confirmation() {
        let mut timeline = MessageTimeline::new();
        let mut remote_temp = confirmed(0, OTHER, "typing fast");
        remote_temp.id = WireMessageId::Temporary("temp-1-2".into());

        assert_eq!(
            timeline.merge_incoming(remote_temp),
            MergeOutcome::Appended { index: 0 }
        );
        assert!(matches!(
            timeline.merge_incoming(confirmed(77, OTHER, "typing fast")),
            MergeOutcome::Confirmed {
                index: 0,
                client_temp_ts: None
            }
        ));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn failed_entries_leave_the_pending_index() {
        let mut timeline = MessageTimeline::new();
        let (index, stamp) =
            timeline.push_pending(ROOM, SenderSummary::new(ME), "lost".into(), at(0));

        assert_eq!(timeline.fail_pending(stamp), Some(index));
        assert!(timeline.entries()[index].is_failed());
        assert_eq!(timeline.unresolved_pending(), 0);
        assert_eq!(timeline.fail_pending(stamp), None);

        assert_eq!(
            timeline.merge_incoming(confirmed(9, ME, "lost")),
            MergeOutcome::Appended { index: 1 }
        );
    }

    #[test]
    fn local_stamps_are_monotonic_and_keys_unique() {
        let mut timeline = MessageTimeline::new();
        let (_, a) = timeline.push_pending(ROOM, SenderSummary::new(ME), "x".into(), at(5));
        let (_, b) = timeline.push_pending(ROOM, SenderSummary::new(ME), "x".into(), at(5));
        let (_, c) = timeline.push_pending(ROOM, SenderSummary::new(ME), "x".into(), at(1));
        assert!(a < b && b < c);

        let keys: std::collections::HashSet<_> = timeline
            .entries()
            .iter()
            .map(TimelineEntry::render_key)
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(timeline.entries()[0].render_key().starts_with("-1-"));

        timeline.clear();
        assert!(timeline.next_client_temp_ts(0) > c);
    }
}
