use serde::{Deserialize, Serialize};

/// Participant reference attached to every message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRef {
    /// Stable server-side user ID.
    pub user_id: String,
    /// Best-effort display name.
    pub display_name: String,
    /// Whether this user is the one running the client.
    pub is_local: bool,
}

impl UserRef {
    /// Reference to the user running this client.
    pub fn local(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            is_local: true,
        }
    }

    /// Reference to another participant.
    pub fn remote(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            is_local: false,
        }
    }
}

/// Content kind of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text message.
    #[default]
    Text,
    /// Message carrying an image reference.
    Image,
    /// Message carrying a video reference.
    Video,
}

/// Delivery lifecycle of a message as seen by this client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Inserted locally, waiting for the server to accept it.
    PendingSend,
    /// The send request failed; the UI may offer a retry.
    Failed,
    /// Accepted by the server.
    Sent,
    /// Delivered to at least one recipient.
    Delivered,
    /// Read by at least one recipient.
    Read,
}

impl DeliveryState {
    /// `true` for states that only exist on this client.
    pub fn is_local_only(self) -> bool {
        matches!(self, Self::PendingSend | Self::Failed)
    }
}

/// One entry of the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Server-assigned ID; absent until the server confirms the message.
    pub id: Option<u64>,
    /// Client correlation ID, present for every message.
    pub client_temp_id: String,
    /// Text body (caption for media messages).
    pub text: String,
    /// Author of the message.
    pub sender: UserRef,
    /// Content kind.
    pub kind: MessageKind,
    /// Remote media URL for image/video messages.
    pub media_ref: Option<String>,
    /// Delivery state.
    pub delivery_state: DeliveryState,
    /// Delivery timestamp in milliseconds since Unix epoch.
    pub delivered_at_ms: Option<u64>,
    /// Read timestamp in milliseconds since Unix epoch.
    pub read_at_ms: Option<u64>,
    /// Creation timestamp in milliseconds since Unix epoch.
    pub created_at_ms: u64,
}

impl Message {
    /// `true` once the server has assigned an ID.
    pub fn is_confirmed(&self) -> bool {
        self.id.is_some()
    }
}

/// Message record as returned by the backend, before validation.
///
/// Every field is optional so that one incomplete record can be rejected without
/// failing deserialization of the whole batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RawMessage {
    pub id: Option<u64>,
    pub client_temp_id: Option<String>,
    pub text: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub kind: Option<MessageKind>,
    pub media_ref: Option<String>,
    pub delivery_state: Option<DeliveryState>,
    pub delivered_at_ms: Option<u64>,
    pub read_at_ms: Option<u64>,
    pub created_at_ms: Option<u64>,
}

/// What the local user is currently doing in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    /// Typing a text message.
    Typing,
    /// Uploading an image.
    UploadingImage,
    /// Uploading a video.
    UploadingVideo,
}

impl ActivityKind {
    /// Activity announced before sending media of the given kind.
    pub fn for_media(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Text => None,
            MessageKind::Image => Some(Self::UploadingImage),
            MessageKind::Video => Some(Self::UploadingVideo),
        }
    }
}

/// Activity of another participant as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteActivity {
    pub user_id: String,
    pub display_name: String,
    pub kind: ActivityKind,
    /// Server-reported start of the activity, ms since Unix epoch.
    pub started_at_ms: u64,
}

/// Locally tracked typing indicator with its expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypingEntry {
    pub display_name: String,
    pub kind: ActivityKind,
    pub expires_at_ms: u64,
}

/// A pinned message as reported by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinnedMessage {
    pub pin_id: u64,
    /// Server ID of the pinned message.
    pub message_ref: u64,
    pub pinned_by: String,
    pub pinned_at_ms: u64,
}

/// Payload of a locally submitted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutgoingPayload {
    /// Plain text.
    Text { text: String },
    /// Image or video, already uploaded or addressable by URL.
    Media {
        kind: MessageKind,
        media_ref: String,
        caption: Option<String>,
    },
}

impl OutgoingPayload {
    /// Text payload helper.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Content kind carried by this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::Media { kind, .. } => *kind,
        }
    }

    /// Body shown in the placeholder message.
    pub fn body(&self) -> &str {
        match self {
            Self::Text { text } => text,
            Self::Media { caption, .. } => caption.as_deref().unwrap_or_default(),
        }
    }

    /// Media URL, if any.
    pub fn media_ref(&self) -> Option<&str> {
        match self {
            Self::Text { .. } => None,
            Self::Media { media_ref, .. } => Some(media_ref),
        }
    }
}

/// Why the scheduler was asked to run outside of its periodic timer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriggerReason {
    /// Periodic timer.
    Periodic,
    /// Conversation screen opened or re-focused.
    Opened,
    /// Push notification naming this conversation.
    PushHint,
    /// A local pin/unpin call completed.
    PinsChanged,
    /// Explicit pull-to-refresh style request.
    Manual,
}

/// Scheduler phase reported to observers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// Not started, or stopped.
    Stopped,
    /// Started, no fetch in flight.
    Idle,
    /// Started, one fetch in flight.
    Fetching,
}

/// Runtime tuning for one conversation engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncConfig {
    /// Periodic fetch interval.
    pub poll_interval_ms: u64,
    /// Upper bound for one fetch round before it counts as a transport failure.
    pub request_timeout_ms: u64,
    /// Lifetime of a remote typing indicator after its reported start.
    pub typing_ttl_ms: u64,
    /// Window in which repeated local activity of the same kind is published once.
    pub typing_throttle_ms: u64,
    /// Maximum createdAt distance for the legacy text+sender send match.
    pub legacy_match_window_ms: u64,
    /// Number of already-confirmed messages re-fetched on each round.
    pub refetch_overlap: usize,
    /// Pins are re-fetched every this many rounds (and whenever marked dirty).
    pub pin_refresh_rounds: u32,
    /// Capacity of the per-conversation event channel.
    pub event_buffer: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            request_timeout_ms: 10_000,
            typing_ttl_ms: 5_000,
            typing_throttle_ms: 3_000,
            legacy_match_window_ms: 15_000,
            refetch_overlap: 20,
            pin_refresh_rounds: 10,
            event_buffer: 64,
        }
    }
}

/// Events emitted to conversation observers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConversationEvent {
    /// The message log changed.
    MessagesChanged {
        conversation_id: String,
        /// `true` when at least one previously unseen message arrived.
        introduced_new: bool,
    },
    /// Typing indicators changed.
    TypingChanged { conversation_id: String },
    /// Pinned set changed.
    PinsChanged { conversation_id: String },
    /// A send failed; the placeholder is now `Failed`.
    SendFailed {
        conversation_id: String,
        client_temp_id: String,
        code: String,
    },
    /// Scheduler phase transition.
    PhaseChanged {
        conversation_id: String,
        phase: SchedulerPhase,
    },
    /// A fetch round failed; the scheduler retries on its next tick.
    SyncFailed {
        conversation_id: String,
        code: String,
        message: String,
    },
}
