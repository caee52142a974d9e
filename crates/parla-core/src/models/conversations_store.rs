use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conversation::{AudioEntry, Conversation, Message, sort_by_recency};
use super::persistence_queue::PersistenceQueue;
use crate::identity::Identity;
use crate::repositories::{
    AudioRow, ConversationRow, MessageRow, PersistenceGateway, RepositoryResult,
};
use crate::services::title_generator::{UNTITLED, derive_title, title_from_text};

const EVENT_CAPACITY: usize = 256;

/// Change notifications for whatever renders the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The conversation list, a title, or a conversation's content changed.
    ConversationsChanged,
    /// The displayed message list was replaced.
    CurrentMessagesChanged { conversation_id: Option<String> },
    /// Text appended to a reply that is still streaming.
    ReplyDelta {
        conversation_id: String,
        message_id: String,
        delta: String,
    },
    /// The current conversation held only audio and was deleted; leave audio mode.
    ResetToChatMode { conversation_id: String },
    /// An identity change finished loading (or clearing) conversations.
    Loaded { user_id: Option<String> },
}

#[derive(Default)]
struct StoreState {
    identity: Option<Identity>,
    /// Bumped on every identity change; background results from older generations are dropped.
    generation: u64,
    conversations: Vec<Conversation>,
    current_id: Option<String>,
    current_messages: Vec<Message>,
    streaming: HashSet<String>,
    is_loading: bool,
    is_initialized: bool,
    last_stamp: Option<DateTime<Utc>>,
}

impl StoreState {
    /// Current time, forced strictly past the previous stamp.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let next = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(next);
        next
    }

    fn find(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn is_current(&self, id: &str) -> bool {
        self.current_id.as_deref() == Some(id)
    }

    fn user_id(&self) -> Option<String> {
        self.identity.as_ref().map(|identity| identity.user_id.clone())
    }

    fn clear(&mut self) {
        self.conversations.clear();
        self.current_id = None;
        self.current_messages.clear();
    }

    /// The requested conversation, else the current one, else a new current one. Unknown
    /// ids are created. Returns the id and whether a new current conversation was opened.
    fn resolve_target(&mut self, requested: Option<&str>) -> (String, bool) {
        let mut opened = false;
        let id = match requested.map(str::to_string).or_else(|| self.current_id.clone()) {
            Some(id) => id,
            None => {
                let id = Uuid::new_v4().to_string();
                self.current_id = Some(id.clone());
                self.current_messages.clear();
                opened = true;
                id
            }
        };

        if self.find(&id).is_none() {
            let now = self.stamp();
            self.conversations.push(Conversation::new(id.clone(), now));
        }

        (id, opened)
    }
}

fn header_row(user_id: &str, conversation: &Conversation) -> ConversationRow {
    ConversationRow {
        id: conversation.id.clone(),
        user_id: user_id.to_string(),
        title: conversation.title.clone(),
        created_at: conversation.created_at,
        updated_at: conversation.updated_at,
    }
}

/// Add the messages of `incoming` whose id `messages` lacks, then order by timestamp.
fn merge_missing(messages: &mut Vec<Message>, incoming: Vec<Message>) {
    let known: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
    messages.extend(incoming.into_iter().filter(|m| !known.contains(&m.id)));
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

/// Canonical in-memory model of a user's conversations.
///
/// Cheap to clone; all clones share one state. Every operation applies locally first and
/// then hands a best-effort write to the [`PersistenceQueue`]. Write failures are logged
/// by the queue and never undo the local change. Nothing is mirrored while no identity is
/// set.
///
/// Must be created inside a tokio runtime.
#[derive(Clone)]
pub struct ConversationStore {
    state: Arc<Mutex<StoreState>>,
    queue: PersistenceQueue,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    pub fn new(gateway: Arc<dyn PersistenceGateway>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            queue: PersistenceQueue::spawn(gateway),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: StoreEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn emit(&self, events: Vec<StoreEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    /// Wait until every write issued so far has reached the gateway.
    pub async fn flush(&self) {
        self.queue.flush().await;
    }

    // Accessors

    /// All conversations, most recently updated first.
    pub fn conversations(&self) -> Vec<Conversation> {
        self.state.lock().conversations.clone()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.state.lock().find(id).cloned()
    }

    /// Materialized messages of a conversation; empty when unknown.
    pub fn messages_of(&self, id: &str) -> Vec<Message> {
        self.state
            .lock()
            .find(id)
            .map(|c| c.messages.clone())
            .unwrap_or_default()
    }

    pub fn current_id(&self) -> Option<String> {
        self.state.lock().current_id.clone()
    }

    pub fn current_messages(&self) -> Vec<Message> {
        self.state.lock().current_messages.clone()
    }

    pub fn current_audio_entries(&self) -> Vec<AudioEntry> {
        let state = self.state.lock();
        state
            .current_id
            .as_deref()
            .and_then(|id| state.find(id))
            .map(|c| c.audio_entries.clone())
            .unwrap_or_default()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.lock().identity.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.state.lock().is_loading
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().is_initialized
    }

    pub fn is_streaming(&self, id: &str) -> bool {
        self.state.lock().streaming.contains(id)
    }

    /// Mark a reply stream open for `id`. False if one already is.
    pub(crate) fn begin_stream(&self, id: &str) -> bool {
        self.state.lock().streaming.insert(id.to_string())
    }

    pub(crate) fn end_stream(&self, id: &str) {
        self.state.lock().streaming.remove(id);
    }

    // Mutations

    /// Open a new empty conversation and make it current.
    pub fn create_conversation(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.checkpoint_outgoing(&id);
        {
            let mut state = self.state.lock();
            let now = state.stamp();
            state.conversations.insert(0, Conversation::new(id.clone(), now));
            sort_by_recency(&mut state.conversations);
            state.current_id = Some(id.clone());
            state.current_messages.clear();
        }
        debug!(conversation_id = %id, "Created conversation");

        self.emit(vec![
            StoreEvent::ConversationsChanged,
            StoreEvent::CurrentMessagesChanged {
                conversation_id: Some(id.clone()),
            },
        ]);
        id
    }

    /// Append `message` to a conversation, idempotently by message id.
    ///
    /// Targets `conversation_id`, else the current conversation, else a new one. Returns the
    /// id the message landed in.
    pub fn append_message(&self, message: Message, conversation_id: Option<&str>) -> String {
        let mut events = Vec::new();
        let target;
        {
            let mut state = self.state.lock();
            let (id, opened) = state.resolve_target(conversation_id);
            target = id;
            let now = state.stamp();
            let user_id = state.user_id();

            let Some(conversation) = state.find_mut(&target) else {
                return target;
            };

            let duplicate = conversation.contains_message(&message.id);
            if duplicate {
                debug!(conversation_id = %target, message_id = %message.id, "Message already present");
            } else {
                conversation.messages.push(message.clone());
                conversation.updated_at = now;
                if conversation.title_is_provisional() {
                    let derived = derive_title(&conversation.messages);
                    if derived != UNTITLED {
                        conversation.title = derived;
                    }
                }
            }
            let header = user_id.as_deref().map(|user_id| header_row(user_id, conversation));

            if !duplicate {
                sort_by_recency(&mut state.conversations);
                events.push(StoreEvent::ConversationsChanged);
            }

            if state.is_current(&target)
                && !state.current_messages.iter().any(|m| m.id == message.id)
            {
                state.current_messages.push(message.clone());
                events.push(StoreEvent::CurrentMessagesChanged {
                    conversation_id: Some(target.clone()),
                });
            } else if opened {
                events.push(StoreEvent::CurrentMessagesChanged {
                    conversation_id: Some(target.clone()),
                });
            }

            // Replayed for duplicates too; the upsert is idempotent
            if let Some(header) = header {
                self.queue
                    .save_conversation(header, vec![MessageRow::from_message(&target, &message)]);
            }
        }

        self.emit(events);
        target
    }

    /// Replace the displayed message list. Not persisted.
    ///
    /// `update` runs under the store lock and must not call back into the store.
    pub fn replace_current_messages<F>(&self, update: F)
    where
        F: FnOnce(&[Message]) -> Vec<Message>,
    {
        let conversation_id = {
            let mut state = self.state.lock();
            let next = update(&state.current_messages);
            state.current_messages = next;
            state.current_id.clone()
        };
        self.publish(StoreEvent::CurrentMessagesChanged { conversation_id });
    }

    pub fn set_current_messages(&self, messages: Vec<Message>) {
        self.replace_current_messages(|_| messages);
    }

    /// Like [`Self::replace_current_messages`], but only while `conversation_id` is displayed.
    pub fn replace_messages_for<F>(&self, conversation_id: &str, update: F) -> bool
    where
        F: FnOnce(&[Message]) -> Vec<Message>,
    {
        {
            let mut state = self.state.lock();
            if !state.is_current(conversation_id) {
                return false;
            }
            let next = update(&state.current_messages);
            state.current_messages = next;
        }
        self.publish(StoreEvent::CurrentMessagesChanged {
            conversation_id: Some(conversation_id.to_string()),
        });
        true
    }

    /// Durable checkpoint of a conversation's full message list.
    ///
    /// Skipped when the list matches what is held (same length, same last message) and the
    /// title needs no derivation. Unknown ids are dropped so a conversation deleted while
    /// streaming is not recreated. The displayed list is left alone.
    pub fn save_conversation(&self, id: &str, messages: Vec<Message>) {
        {
            let mut state = self.state.lock();
            let now = state.stamp();
            let user_id = state.user_id();

            let Some(conversation) = state.find_mut(id) else {
                warn!(conversation_id = %id, "Dropping save for unknown conversation");
                return;
            };

            let unchanged = conversation.messages.len() == messages.len()
                && conversation.messages.last() == messages.last();
            let derived = derive_title(&messages);
            let needs_title = conversation.title_is_provisional()
                && !messages.is_empty()
                && derived != UNTITLED
                && derived != conversation.title;

            if unchanged && !needs_title {
                debug!(conversation_id = %id, "Conversation unchanged, skipping save");
                return;
            }

            if needs_title {
                conversation.title = derived;
            }
            conversation.messages = messages;
            conversation.updated_at = now;

            let job = user_id.as_deref().map(|user_id| {
                let rows = conversation
                    .messages
                    .iter()
                    .map(|message| MessageRow::from_message(id, message))
                    .collect::<Vec<_>>();
                (header_row(user_id, conversation), rows)
            });

            sort_by_recency(&mut state.conversations);

            if let Some((header, rows)) = job {
                self.queue.save_conversation(header, rows);
            }
        }

        self.publish(StoreEvent::ConversationsChanged);
    }

    /// Attach an audio entry, idempotently by entry id. Targets like [`Self::append_message`].
    ///
    /// The first audio of a conversation may title it: an empty untitled conversation takes
    /// the audio text, and an untitled conversation with messages receiving voice-agent
    /// audio derives its title from those messages.
    pub fn add_audio_entry(&self, entry: AudioEntry, conversation_id: Option<&str>) -> String {
        let mut events = Vec::new();
        let target;
        {
            let mut state = self.state.lock();
            let (id, opened) = state.resolve_target(conversation_id);
            target = id;
            if opened {
                events.push(StoreEvent::CurrentMessagesChanged {
                    conversation_id: Some(target.clone()),
                });
            }
            let now = state.stamp();
            let user_id = state.user_id();

            let Some(conversation) = state.find_mut(&target) else {
                return target;
            };

            if conversation.contains_audio(&entry.id) {
                debug!(conversation_id = %target, audio_id = %entry.id, "Audio entry already present");
            } else {
                if conversation.audio_entries.is_empty()
                    && !conversation.title_pinned
                    && conversation.title == UNTITLED
                {
                    if conversation.messages.is_empty() {
                        conversation.title = title_from_text(&entry.text);
                    } else if entry.is_voice_agent() {
                        let derived = derive_title(&conversation.messages);
                        conversation.title = if derived == UNTITLED {
                            title_from_text(&entry.text)
                        } else {
                            derived
                        };
                    }
                }
                conversation.audio_entries.insert(0, entry.clone());
                conversation.updated_at = now;
            }
            let header = user_id.as_deref().map(|user_id| header_row(user_id, conversation));

            sort_by_recency(&mut state.conversations);
            events.push(StoreEvent::ConversationsChanged);

            if let Some(header) = header {
                self.queue
                    .save_audio(header, AudioRow::from_entry(&target, &entry));
            }
        }

        self.emit(events);
        target
    }

    /// Remove an audio entry from the current conversation.
    pub fn delete_audio_entry(&self, audio_id: &str) {
        {
            let mut state = self.state.lock();
            let Some(current) = state.current_id.clone() else {
                warn!(audio_id, "No current conversation, ignoring audio delete");
                return;
            };
            let mirrored = state.identity.is_some();

            if let Some(conversation) = state.find_mut(&current) {
                conversation.audio_entries.retain(|audio| audio.id != audio_id);
            }
            if mirrored {
                self.queue.delete_audio(audio_id);
            }
        }
        self.publish(StoreEvent::ConversationsChanged);
    }

    /// Delete a conversation. If it was current, the most recent non-empty conversation
    /// becomes current, or the selection is cleared.
    pub fn delete_conversation(&self, id: &str) {
        let mut events = vec![StoreEvent::ConversationsChanged];
        {
            let mut state = self.state.lock();
            let removed = match state.conversations.iter().position(|c| c.id == id) {
                Some(position) => Some(state.conversations.remove(position)),
                None => {
                    warn!(conversation_id = %id, "Deleting conversation the store does not hold");
                    None
                }
            };

            if state.is_current(id) {
                if removed.as_ref().is_some_and(Conversation::has_only_audio) {
                    events.push(StoreEvent::ResetToChatMode {
                        conversation_id: id.to_string(),
                    });
                }

                let next = state
                    .conversations
                    .iter()
                    .find(|c| !c.is_empty())
                    .map(|c| (c.id.clone(), c.messages.clone()));
                match next {
                    Some((next_id, messages)) => {
                        state.current_id = Some(next_id);
                        state.current_messages = messages;
                    }
                    None => {
                        state.current_id = None;
                        state.current_messages.clear();
                    }
                }
                events.push(StoreEvent::CurrentMessagesChanged {
                    conversation_id: state.current_id.clone(),
                });
            }

            if state.identity.is_some() {
                self.queue.delete_conversation(id);
            }
        }

        info!(conversation_id = %id, "Deleted conversation");
        self.emit(events);
    }

    /// Overwrite a title, e.g. on user rename. Bypasses derivation.
    pub fn update_conversation_title(&self, id: &str, title: &str) {
        {
            let mut state = self.state.lock();
            let now = state.stamp();
            let user_id = state.user_id();

            let Some(conversation) = state.find_mut(id) else {
                warn!(conversation_id = %id, "Cannot rename unknown conversation");
                return;
            };
            conversation.title = title.to_string();
            conversation.title_pinned = true;
            conversation.updated_at = now;
            let header = user_id.as_deref().map(|user_id| header_row(user_id, conversation));

            sort_by_recency(&mut state.conversations);

            if let Some(header) = header {
                self.queue.save_header(header);
            }
        }
        self.publish(StoreEvent::ConversationsChanged);
    }

    /// Make `id` current.
    ///
    /// The outgoing conversation's displayed messages are checkpointed first. The local copy
    /// is shown at once, unless `id` is already current, in which case the view is kept. The
    /// returned task then refetches from the gateway and adds the messages not held locally.
    pub fn select_conversation(&self, id: &str) -> JoinHandle<()> {
        self.checkpoint_outgoing(id);

        let (generation, cached_empty, mirrored) = {
            let mut state = self.state.lock();
            let cached = state.find(id).map(|c| c.messages.clone()).unwrap_or_default();
            let cached_empty = cached.is_empty();
            // Reselecting keeps view-only messages such as a streaming reply
            if !state.is_current(id) {
                state.current_id = Some(id.to_string());
                state.current_messages = cached;
            }
            (state.generation, cached_empty, state.identity.is_some())
        };
        self.publish(StoreEvent::CurrentMessagesChanged {
            conversation_id: Some(id.to_string()),
        });

        if !mirrored {
            return tokio::spawn(async {});
        }

        let store = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            match store.queue.fetch_messages(&id).await {
                Ok(fetched) => store.apply_refresh(generation, &id, fetched, cached_empty),
                Err(e) => warn!(conversation_id = %id, error = ?e, "Failed to refresh conversation"),
            }
        })
    }

    /// Save the displayed messages of the current conversation before leaving it for `next`.
    fn checkpoint_outgoing(&self, next: &str) {
        let outgoing = {
            let state = self.state.lock();
            match &state.current_id {
                Some(current)
                    if current != next
                        && !state.current_messages.is_empty()
                        && state.find(current).is_some() =>
                {
                    Some((current.clone(), state.current_messages.clone()))
                }
                _ => None,
            }
        };
        if let Some((outgoing_id, messages)) = outgoing {
            self.save_conversation(&outgoing_id, messages);
        }
    }

    fn apply_refresh(&self, generation: u64, id: &str, fetched: Vec<Message>, cached_empty: bool) {
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(conversation_id = %id, "Dropping refresh from a previous identity");
                return;
            }
            if fetched.is_empty() && !cached_empty {
                return;
            }
            let Some(conversation) = state.find_mut(id) else {
                return;
            };

            // Local copies win; the fetch may predate writes still queued behind it
            let mut merged = conversation.messages.clone();
            merge_missing(&mut merged, fetched);
            conversation.messages = merged.clone();
            events.push(StoreEvent::ConversationsChanged);

            if state.is_current(id) {
                let mut view = state.current_messages.clone();
                merge_missing(&mut view, merged);
                state.current_messages = view;
                events.push(StoreEvent::CurrentMessagesChanged {
                    conversation_id: Some(id.to_string()),
                });
            }
        }
        self.emit(events);
    }

    /// Switch identity. All in-memory state is discarded; for `Some`, the returned task
    /// loads that user's conversations.
    pub fn set_identity(&self, identity: Option<Identity>) -> Option<JoinHandle<()>> {
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.clear();
            state.identity = identity.clone();
            state.is_loading = identity.is_some();
            state.is_initialized = identity.is_none();
            state.generation
        };
        self.emit(vec![
            StoreEvent::ConversationsChanged,
            StoreEvent::CurrentMessagesChanged {
                conversation_id: None,
            },
        ]);

        let Some(identity) = identity else {
            info!("Identity cleared, conversations discarded");
            self.publish(StoreEvent::Loaded { user_id: None });
            return None;
        };

        let store = self.clone();
        Some(tokio::spawn(async move {
            let result = store.queue.load_user(&identity.user_id).await;
            store.apply_load(generation, &identity.user_id, result);
        }))
    }

    fn apply_load(
        &self,
        generation: u64,
        user_id: &str,
        result: RepositoryResult<Vec<Conversation>>,
    ) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                debug!(user_id, "Dropping conversations of a previous identity");
                return;
            }

            match result {
                Ok(loaded) => {
                    // Conversations started while loading win over their stored copies
                    let mut merged = std::mem::take(&mut state.conversations);
                    for conversation in loaded {
                        if !merged.iter().any(|c| c.id == conversation.id) {
                            merged.push(conversation);
                        }
                    }
                    if let Some(latest) = merged.iter().map(|c| c.updated_at).max() {
                        state.last_stamp = state.last_stamp.max(Some(latest));
                    }
                    sort_by_recency(&mut merged);
                    info!(user_id, count = merged.len(), "Loaded conversations");
                    state.conversations = merged;
                }
                Err(e) => warn!(user_id, error = ?e, "Failed to load conversations"),
            }

            state.is_loading = false;
            state.is_initialized = true;
        }

        self.emit(vec![
            StoreEvent::ConversationsChanged,
            StoreEvent::Loaded {
                user_id: Some(user_id.to_string()),
            },
        ]);
    }

    /// Track an identity provider for the lifetime of the returned task.
    pub fn follow_identity(
        &self,
        mut identities: watch::Receiver<Option<Identity>>,
    ) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let initial = identities.borrow_and_update().clone();
            store.set_identity(initial);

            while identities.changed().await.is_ok() {
                let next = identities.borrow_and_update().clone();
                store.set_identity(next);
            }
            debug!("Identity provider closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::identity::IdentityProvider;
    use crate::models::conversation::{MessageContent, Role, VOICE_AGENT_ID, VOICE_AGENT_NAME};
    use crate::repositories::{InMemoryGateway, StoreSnapshot};

    fn store_with(gateway: &InMemoryGateway) -> ConversationStore {
        ConversationStore::new(Arc::new(gateway.clone()))
    }

    async fn signed_in(gateway: &InMemoryGateway, user_id: &str) -> ConversationStore {
        let store = store_with(gateway);
        store
            .set_identity(Some(Identity::new(user_id)))
            .unwrap()
            .await
            .unwrap();
        store
    }

    fn drain(receiver: &mut broadcast::Receiver<StoreEvent>) -> Vec<StoreEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_duplicate_append_is_noop() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.create_conversation();

        let message = Message::with_id("m1", Role::User, "hi");
        store.append_message(message.clone(), Some(&id));
        store.append_message(message, Some(&id));

        assert_eq!(store.messages_of(&id).len(), 1);
        assert_eq!(store.current_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_ids_counted_once() {
        let store = store_with(&InMemoryGateway::new());
        let ids = ["a", "b", "a", "c", "b", "a"];
        let mut target = None;
        for id in ids {
            let landed =
                store.append_message(Message::with_id(id, Role::User, id), target.as_deref());
            target = Some(landed);
        }

        let target = target.unwrap();
        assert_eq!(store.messages_of(&target).len(), 3);
        assert_eq!(store.conversations().len(), 1);
    }

    #[tokio::test]
    async fn test_create_then_append_targets_new_conversation() {
        let store = store_with(&InMemoryGateway::new());
        let first = store.create_conversation();
        store.append_message(Message::user("first"), None);

        let second = store.create_conversation();
        let landed = store.append_message(Message::user("second"), Some(&second));

        assert_eq!(landed, second);
        assert_eq!(store.messages_of(&first).len(), 1);
        assert_eq!(store.messages_of(&second)[0].text(), Some("second"));
        assert_eq!(store.current_id(), Some(second));
    }

    #[tokio::test]
    async fn test_append_without_current_opens_conversation() {
        let store = store_with(&InMemoryGateway::new());
        let mut events = store.subscribe();

        let id = store.append_message(Message::user("Plan a trip"), None);

        assert_eq!(store.current_id(), Some(id.clone()));
        assert_eq!(store.current_messages().len(), 1);
        assert_eq!(store.conversation(&id).unwrap().title(), "Plan a trip");
        assert!(drain(&mut events).contains(&StoreEvent::CurrentMessagesChanged {
            conversation_id: Some(id)
        }));
    }

    #[tokio::test]
    async fn test_append_to_unknown_id_creates_it() {
        let store = store_with(&InMemoryGateway::new());
        let current = store.create_conversation();

        store.append_message(Message::user("elsewhere"), Some("explicit-id"));

        let created = store.conversation("explicit-id").unwrap();
        assert_eq!(created.title(), "elsewhere");
        assert_eq!(store.current_id(), Some(current));
        assert!(store.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_title_only_derived_while_provisional() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.create_conversation();

        store.append_message(Message::assistant("Hello! How can I help?"), None);
        assert_eq!(store.conversation(&id).unwrap().title(), UNTITLED);

        store.append_message(Message::user("Recipes with leeks"), None);
        assert_eq!(store.conversation(&id).unwrap().title(), "Recipes with leeks");

        store.update_conversation_title(&id, "Dinner");
        store.append_message(Message::user("Something else"), None);
        assert_eq!(store.conversation(&id).unwrap().title(), "Dinner");
    }

    #[tokio::test]
    async fn test_renamed_title_survives_content() {
        let store = store_with(&InMemoryGateway::new());
        let notes = store.create_conversation();
        store.update_conversation_title(&notes, "Voice conversation notes");
        store.append_message(Message::user("Agenda for Monday"), Some(&notes));
        store.save_conversation(&notes, vec![Message::user("Something else")]);
        assert_eq!(store.conversation(&notes).unwrap().title(), "Voice conversation notes");

        // Even a name shaped like a generated one is kept once chosen
        let lookalike = store.create_conversation();
        store.update_conversation_title(&lookalike, "Voice conversation - Duration: 2:00");
        store.append_message(Message::user("Follow-up"), Some(&lookalike));
        assert_eq!(
            store.conversation(&lookalike).unwrap().title(),
            "Voice conversation - Duration: 2:00"
        );

        let untitled = store.create_conversation();
        store.update_conversation_title(&untitled, UNTITLED);
        store.append_message(Message::user("Anything"), Some(&untitled));
        assert_eq!(store.conversation(&untitled).unwrap().title(), UNTITLED);
    }

    #[tokio::test]
    async fn test_touching_reorders_by_recency() {
        let store = store_with(&InMemoryGateway::new());
        let older = store.append_message(Message::user("one"), Some("c1"));
        let newer = store.append_message(Message::user("two"), Some("c2"));
        assert_eq!(store.conversations()[0].id(), newer);

        store.append_message(Message::user("three"), Some(&older));

        let list = store.conversations();
        assert_eq!(list[0].id(), older);
        assert_eq!(list[1].id(), newer);
        assert!(list[0].updated_at() > list[1].updated_at());
        assert!(list.iter().all(|c| c.updated_at() >= c.created_at()));
    }

    #[tokio::test]
    async fn test_stamps_strictly_increase() {
        let store = store_with(&InMemoryGateway::new());
        let ids: Vec<String> = (0..20).map(|_| store.create_conversation()).collect();

        let list = store.conversations();
        for pair in list.windows(2) {
            assert!(pair[0].created_at() > pair[1].created_at());
        }
        assert_eq!(list[0].id(), ids[19]);
    }

    #[tokio::test]
    async fn test_deleting_audio_only_current_resets_mode_once() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.create_conversation();
        store.add_audio_entry(AudioEntry::new("Good morning", "", "v1", "Rachel"), None);

        let mut events = store.subscribe();
        store.delete_conversation(&id);

        let resets = drain(&mut events)
            .into_iter()
            .filter(|e| matches!(e, StoreEvent::ResetToChatMode { .. }))
            .count();
        assert_eq!(resets, 1);
        assert_eq!(store.current_id(), None);
    }

    #[tokio::test]
    async fn test_deleting_non_current_does_not_reset_mode() {
        let store = store_with(&InMemoryGateway::new());
        let audio_only = store.create_conversation();
        store.add_audio_entry(AudioEntry::new("Good morning", "", "v1", "Rachel"), None);
        store.create_conversation();

        let mut events = store.subscribe();
        store.delete_conversation(&audio_only);

        assert!(
            !drain(&mut events)
                .iter()
                .any(|e| matches!(e, StoreEvent::ResetToChatMode { .. }))
        );
    }

    #[tokio::test]
    async fn test_delete_promotes_most_recent_non_empty() {
        let store = store_with(&InMemoryGateway::new());
        let older = store.append_message(Message::user("older"), Some("older"));
        store.create_conversation();
        let doomed = store.append_message(Message::user("doomed"), None);
        // Newer than `older` but empty, so it must be skipped
        store.create_conversation();
        store.select_conversation(&doomed).await.unwrap();

        store.delete_conversation(&doomed);

        assert_eq!(store.current_id(), Some(older));
        assert_eq!(store.current_messages()[0].text(), Some("older"));
    }

    #[tokio::test]
    async fn test_delete_last_conversation_clears_selection() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.append_message(Message::user("only"), None);

        store.delete_conversation(&id);

        assert_eq!(store.current_id(), None);
        assert!(store.current_messages().is_empty());
        assert!(store.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_header_persisted_before_message() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;

        let id = store.append_message(Message::user("hi"), None);
        store.flush().await;

        // The in-memory gateway rejects messages whose conversation is unknown
        let snapshot = gateway.snapshot();
        assert_eq!(snapshot.conversations.len(), 1);
        assert_eq!(snapshot.conversations[0].id, id);
        assert_eq!(snapshot.conversations[0].user_id, "u1");
        assert_eq!(snapshot.conversations[0].title, "hi");
        assert_eq!(snapshot.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_writes_keep_local_state() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        gateway.set_fail_writes(true);

        let id = store.append_message(Message::user("kept"), None);
        store.update_conversation_title(&id, "Renamed");
        store.flush().await;

        assert!(gateway.write_count() > 0);
        assert_eq!(gateway.snapshot(), StoreSnapshot::default());
        let conversation = store.conversation(&id).unwrap();
        assert_eq!(conversation.title(), "Renamed");
        assert_eq!(conversation.messages().len(), 1);
        assert_eq!(store.current_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_mirrored_without_identity() {
        let gateway = InMemoryGateway::new();
        let store = store_with(&gateway);

        let id = store.append_message(Message::user("local"), None);
        store.add_audio_entry(AudioEntry::new("hi", "", "v1", "Rachel"), Some(&id));
        store.update_conversation_title(&id, "Local");
        store.delete_conversation(&id);
        store.flush().await;

        assert_eq!(gateway.write_count(), 0);
    }

    #[tokio::test]
    async fn test_save_skips_unchanged_messages() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let id = store.append_message(Message::user("hi"), None);
        let mut messages = store.messages_of(&id);
        messages.push(Message::assistant("hello"));

        store.save_conversation(&id, messages.clone());
        store.flush().await;
        let writes = gateway.write_count();

        store.save_conversation(&id, messages.clone());
        store.flush().await;
        assert_eq!(gateway.write_count(), writes);

        // Same length and id, different content: a finished placeholder must be saved
        let last = messages.last_mut().unwrap();
        last.content = "hello there".into();
        store.save_conversation(&id, messages);
        store.flush().await;
        assert!(gateway.write_count() > writes);
        assert_eq!(gateway.snapshot().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_save_derives_provisional_title() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.create_conversation();

        store.save_conversation(&id, vec![Message::user("Budget for March")]);

        assert_eq!(store.conversation(&id).unwrap().title(), "Budget for March");
        // Saving does not touch the displayed list
        assert!(store.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_save_for_deleted_conversation_is_dropped() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let id = store.append_message(Message::user("hi"), None);
        store.delete_conversation(&id);

        store.save_conversation(&id, vec![Message::user("hi"), Message::assistant("late")]);
        store.flush().await;

        assert!(store.conversation(&id).is_none());
        assert_eq!(gateway.snapshot(), StoreSnapshot::default());
    }

    #[tokio::test]
    async fn test_select_shows_cache_then_merges_refresh() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let id = store.append_message(Message::with_id("m1", Role::User, "hi"), None);
        store.create_conversation();
        store.flush().await;

        // Another device adds a reply
        let mut reply = Message::with_id("m2", Role::Assistant, "hello");
        reply.timestamp = store.messages_of(&id)[0].timestamp + Duration::seconds(1);
        gateway
            .upsert_messages(vec![MessageRow::from_message(&id, &reply)])
            .await
            .unwrap();

        let refresh = store.select_conversation(&id);
        assert_eq!(store.current_messages().len(), 1);

        refresh.await.unwrap();
        let shown: Vec<String> = store.current_messages().into_iter().map(|m| m.id).collect();
        assert_eq!(shown, vec!["m1", "m2"]);
        assert_eq!(store.messages_of(&id).len(), 2);
    }

    #[tokio::test]
    async fn test_empty_refresh_keeps_cache() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        gateway.set_fail_writes(true);
        let id = store.append_message(Message::user("cached only"), None);
        store.create_conversation();

        store.select_conversation(&id).await.unwrap();

        assert_eq!(store.current_messages().len(), 1);
        assert_eq!(store.current_messages()[0].text(), Some("cached only"));
    }

    #[tokio::test]
    async fn test_switch_checkpoints_outgoing_view() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let id = store.append_message(Message::user("question"), None);
        let mut partial = Message::reply_placeholder(&store.current_messages()[0]);
        partial.content = "Half an ans".into();
        store.replace_current_messages(|messages| {
            let mut next = messages.to_vec();
            next.push(partial.clone());
            next
        });

        store.create_conversation();
        store.flush().await;

        let stored = gateway.fetch_messages(&id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].content, MessageContent::from("Half an ans"));
        assert_eq!(store.messages_of(&id).len(), 2);
    }

    #[tokio::test]
    async fn test_reselecting_current_keeps_view() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.append_message(Message::user("question"), None);
        let partial = Message::reply_placeholder(&store.current_messages()[0]);
        store.replace_current_messages(|messages| {
            let mut next = messages.to_vec();
            next.push(partial.clone());
            next
        });

        store.select_conversation(&id).await.unwrap();

        assert_eq!(store.current_id(), Some(id.clone()));
        assert_eq!(store.current_messages().len(), 2);
        assert_eq!(store.current_messages()[1].id, partial.id);
        assert_eq!(store.messages_of(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_replace_messages_for_requires_current() {
        let store = store_with(&InMemoryGateway::new());
        let first = store.create_conversation();
        store.create_conversation();

        let applied = store.replace_messages_for(&first, |_| vec![Message::user("x")]);

        assert!(!applied);
        assert!(store.current_messages().is_empty());
    }

    #[tokio::test]
    async fn test_identity_load_and_clear() {
        let gateway = InMemoryGateway::new();
        {
            let seed = signed_in(&gateway, "u1").await;
            seed.append_message(Message::user("from yesterday"), None);
            seed.add_audio_entry(AudioEntry::new("Read aloud", "", "v1", "Rachel"), Some("tts"));
            seed.flush().await;
        }

        let store = store_with(&gateway);
        assert!(!store.is_initialized());
        let mut events = store.subscribe();

        let load = store.set_identity(Some(Identity::new("u1"))).unwrap();
        assert!(store.is_loading());
        load.await.unwrap();

        assert!(store.is_initialized());
        assert!(!store.is_loading());
        let list = store.conversations();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id(), "tts");
        assert_eq!(list[0].title(), "Read aloud");
        assert_eq!(list[1].messages()[0].text(), Some("from yesterday"));
        assert_eq!(store.current_id(), None);
        assert!(drain(&mut events).contains(&StoreEvent::Loaded {
            user_id: Some("u1".to_string())
        }));

        assert!(store.set_identity(None).is_none());
        assert!(store.conversations().is_empty());
        assert!(store.is_initialized());
    }

    #[tokio::test]
    async fn test_stale_identity_load_is_discarded() {
        let gateway = InMemoryGateway::new();
        {
            let seed = signed_in(&gateway, "alice").await;
            seed.append_message(Message::user("alice's"), None);
            seed.flush().await;
        }

        let store = store_with(&gateway);
        let stale = store.set_identity(Some(Identity::new("alice"))).unwrap();
        let fresh = store.set_identity(Some(Identity::new("bob"))).unwrap();
        stale.await.unwrap();
        fresh.await.unwrap();

        assert!(store.conversations().is_empty());
        assert_eq!(store.identity(), Some(Identity::new("bob")));
    }

    #[tokio::test]
    async fn test_follow_identity_provider() {
        let gateway = InMemoryGateway::new();
        {
            let seed = signed_in(&gateway, "u1").await;
            seed.append_message(Message::user("hello"), None);
            seed.flush().await;
        }

        let store = store_with(&gateway);
        let provider = IdentityProvider::default();
        let mut events = store.subscribe();
        let _follow = store.follow_identity(provider.subscribe());

        provider.sign_in(Identity::new("u1"));
        tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                if let Ok(StoreEvent::Loaded { user_id: Some(_) }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(store.conversations().len(), 1);

        provider.sign_out();
        tokio::time::timeout(StdDuration::from_secs(5), async {
            loop {
                if let Ok(StoreEvent::Loaded { user_id: None }) = events.recv().await {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert!(store.conversations().is_empty());
    }

    #[tokio::test]
    async fn test_audio_titles_empty_conversation() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.add_audio_entry(
            AudioEntry::new("The quick brown fox", "data:audio/mpeg;base64,AA", "v1", "Rachel"),
            None,
        );

        let conversation = store.conversation(&id).unwrap();
        assert_eq!(conversation.title(), "The quick brown fox");
        assert_eq!(store.current_id(), Some(id));
        assert_eq!(store.current_audio_entries().len(), 1);
    }

    #[tokio::test]
    async fn test_tts_audio_keeps_title_of_chat() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.append_message(Message::user("Explain tides"), None);

        store.add_audio_entry(AudioEntry::new("Tides are...", "", "v1", "Rachel"), None);

        assert_eq!(store.conversation(&id).unwrap().title(), "Explain tides");
    }

    #[tokio::test]
    async fn test_voice_agent_audio_titles_untitled_chat() {
        let store = store_with(&InMemoryGateway::new());
        let id = store.append_message(Message::assistant("Hi, this is the agent"), None);
        assert_eq!(store.conversation(&id).unwrap().title(), UNTITLED);

        store.add_audio_entry(
            AudioEntry::new("Call summary", "", VOICE_AGENT_ID, VOICE_AGENT_NAME),
            None,
        );

        assert_eq!(store.conversation(&id).unwrap().title(), "Call summary");
    }

    #[tokio::test]
    async fn test_audio_entries_newest_first_and_idempotent() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let first = AudioEntry::new("one", "", "v1", "Rachel");
        let second = AudioEntry::new("two", "", "v1", "Rachel");

        let id = store.add_audio_entry(first.clone(), None);
        store.add_audio_entry(second.clone(), Some(&id));
        store.add_audio_entry(first.clone(), Some(&id));
        store.flush().await;

        let entries = store.current_audio_entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, second.id);
        assert_eq!(gateway.snapshot().audio.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_audio_entry() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let entry = AudioEntry::new("bye", "", "v1", "Rachel");
        store.add_audio_entry(entry.clone(), None);

        store.delete_audio_entry(&entry.id);
        store.flush().await;

        assert!(store.current_audio_entries().is_empty());
        assert!(gateway.snapshot().audio.is_empty());
    }

    #[tokio::test]
    async fn test_delete_audio_without_current_is_dropped() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let entry = AudioEntry::new("kept", "", "v1", "Rachel");
        let id = store.add_audio_entry(entry.clone(), Some("tts"));
        store.flush().await;
        assert_eq!(store.current_id(), None);

        store.delete_audio_entry(&entry.id);
        store.flush().await;

        assert_eq!(store.conversation(&id).unwrap().audio_entries().len(), 1);
        assert_eq!(gateway.snapshot().audio.len(), 1);
    }

    #[tokio::test]
    async fn test_rename_persists_header_only() {
        let gateway = InMemoryGateway::new();
        let store = signed_in(&gateway, "u1").await;
        let other = store.append_message(Message::user("other"), Some("other"));
        let id = store.append_message(Message::user("first"), Some("target"));
        store.flush().await;
        assert_eq!(store.conversations()[0].id(), id);

        store.update_conversation_title(&other, "Renamed");
        store.update_conversation_title("missing", "Nope");
        store.flush().await;

        assert_eq!(store.conversations()[0].id(), other);
        let snapshot = gateway.snapshot();
        let row = snapshot.conversations.iter().find(|c| c.id == other).unwrap();
        assert_eq!(row.title, "Renamed");
        assert_eq!(snapshot.conversations.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_marks() {
        let store = store_with(&InMemoryGateway::new());
        assert!(store.begin_stream("c1"));
        assert!(!store.begin_stream("c1"));
        assert!(store.is_streaming("c1"));
        store.end_stream("c1");
        assert!(!store.is_streaming("c1"));
    }
}
