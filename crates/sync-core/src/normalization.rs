use thiserror::Error;

use crate::{
    error::{SyncError, SyncErrorCategory},
    types::{DeliveryState, Message, MessageKind, RawMessage, UserRef},
};

/// Prefix for correlation IDs synthesized for records the server did not tag.
pub const SERVER_TEMP_ID_PREFIX: &str = "srv-";

/// Reasons a fetched record is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedRecord {
    #[error("record has no server id")]
    MissingId,
    #[error("record {id} has no sender")]
    MissingSender { id: u64 },
    #[error("record {id} has no creation timestamp")]
    MissingTimestamp { id: u64 },
    #[error("record {id} has neither text nor media")]
    EmptyContent { id: u64 },
    #[error("record {id} is {kind:?} but carries no media reference")]
    MissingMedia { id: u64, kind: MessageKind },
}

impl From<MalformedRecord> for SyncError {
    fn from(err: MalformedRecord) -> Self {
        SyncError::new(SyncErrorCategory::Malformed, "malformed_record", err.to_string())
    }
}

/// A validated fetched record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub message: Message,
    /// `false` when the server did not round-trip a client correlation ID.
    pub echoed_temp_id: bool,
}

/// Validate a fetched record and convert it into a confirmed [`Message`].
pub fn normalize_record(
    raw: RawMessage,
    local_user_id: &str,
) -> Result<NormalizedRecord, MalformedRecord> {
    let id = raw.id.ok_or(MalformedRecord::MissingId)?;
    let sender_id = raw
        .sender_id
        .filter(|value| !value.trim().is_empty())
        .ok_or(MalformedRecord::MissingSender { id })?;
    let created_at_ms = raw
        .created_at_ms
        .ok_or(MalformedRecord::MissingTimestamp { id })?;

    let kind = raw.kind.unwrap_or_default();
    let media_ref = raw.media_ref.filter(|value| !value.is_empty());
    let text = raw.text.unwrap_or_default();

    match kind {
        MessageKind::Text if text.is_empty() && media_ref.is_none() => {
            return Err(MalformedRecord::EmptyContent { id });
        }
        MessageKind::Image | MessageKind::Video if media_ref.is_none() => {
            return Err(MalformedRecord::MissingMedia { id, kind });
        }
        _ => {}
    }

    let echoed = raw.client_temp_id.filter(|value| !value.is_empty());
    let echoed_temp_id = echoed.is_some();
    let client_temp_id = echoed.unwrap_or_else(|| format!("{SERVER_TEMP_ID_PREFIX}{id}"));

    let display_name = raw
        .sender_name
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| sender_id.clone());
    let is_local = sender_id == local_user_id;

    // Local-only states never come from the server.
    let delivery_state = match raw.delivery_state {
        Some(state) if !state.is_local_only() => state,
        _ => DeliveryState::Sent,
    };

    Ok(NormalizedRecord {
        message: Message {
            id: Some(id),
            client_temp_id,
            text,
            sender: UserRef {
                user_id: sender_id,
                display_name,
                is_local,
            },
            kind,
            media_ref,
            delivery_state,
            delivered_at_ms: raw.delivered_at_ms,
            read_at_ms: raw.read_at_ms,
            created_at_ms,
        },
        echoed_temp_id,
    })
}

/// Outcome of one send request as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// The server accepted the message and returned its record.
    Confirmed(RawMessage),
    /// The request failed.
    Failed(SyncError),
}

impl From<Result<RawMessage, SyncError>> for SendOutcome {
    fn from(result: Result<RawMessage, SyncError>) -> Self {
        match result {
            Ok(record) => Self::Confirmed(record),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Re-tag a transport error as a send failure, keeping the original code visible.
pub fn normalize_send_failure(error: SyncError) -> SyncError {
    if error.category == SyncErrorCategory::SendFailure {
        return error;
    }
    SyncError {
        category: SyncErrorCategory::SendFailure,
        code: "send_failed".to_owned(),
        message: format!("{}: {}", error.code, error.message),
        retry_after_ms: error.retry_after_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(id: u64) -> RawMessage {
        RawMessage {
            id: Some(id),
            text: Some("hello".into()),
            sender_id: Some("u-bob".into()),
            sender_name: Some("Bob".into()),
            created_at_ms: Some(1_731_000_000),
            ..RawMessage::default()
        }
    }

    #[test]
    fn synthesizes_temp_id_when_server_does_not_echo() {
        let record = normalize_record(raw(7), "u-alice").expect("record should be valid");
        assert_eq!(record.message.client_temp_id, "srv-7");
        assert!(!record.echoed_temp_id);
        assert!(!record.message.sender.is_local);
        assert_eq!(record.message.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn keeps_echoed_temp_id_and_marks_local_sender() {
        let mut input = raw(8);
        input.client_temp_id = Some("tmp-1".into());
        input.sender_id = Some("u-alice".into());
        let record = normalize_record(input, "u-alice").expect("record should be valid");
        assert_eq!(record.message.client_temp_id, "tmp-1");
        assert!(record.echoed_temp_id);
        assert!(record.message.sender.is_local);
    }

    #[test]
    fn rejects_records_missing_required_fields() {
        let mut no_id = raw(1);
        no_id.id = None;
        assert_eq!(
            normalize_record(no_id, "u-alice"),
            Err(MalformedRecord::MissingId)
        );

        let mut no_sender = raw(2);
        no_sender.sender_id = Some("  ".into());
        assert_eq!(
            normalize_record(no_sender, "u-alice"),
            Err(MalformedRecord::MissingSender { id: 2 })
        );

        let mut no_time = raw(3);
        no_time.created_at_ms = None;
        assert_eq!(
            normalize_record(no_time, "u-alice"),
            Err(MalformedRecord::MissingTimestamp { id: 3 })
        );

        let mut image = raw(4);
        image.kind = Some(MessageKind::Image);
        assert_eq!(
            normalize_record(image, "u-alice"),
            Err(MalformedRecord::MissingMedia {
                id: 4,
                kind: MessageKind::Image
            })
        );
    }

    #[test]
    fn ignores_local_only_delivery_states_from_server() {
        let mut input = raw(5);
        input.delivery_state = Some(DeliveryState::PendingSend);
        let record = normalize_record(input, "u-alice").expect("record should be valid");
        assert_eq!(record.message.delivery_state, DeliveryState::Sent);
    }

    #[test]
    fn parses_server_json_with_missing_fields() {
        let batch: Vec<RawMessage> = serde_json::from_str(
            r#"[
                {"id": 1, "text": "a", "sender_id": "u-bob", "created_at_ms": 10},
                {"text": "no id", "sender_id": "u-bob", "created_at_ms": 11},
                {"id": 3, "kind": "image", "media_ref": "https://cdn.example.org/p.jpg",
                 "sender_id": "u-bob", "created_at_ms": 12, "delivery_state": "read"}
            ]"#,
        )
        .expect("batch should deserialize");

        let results: Vec<_> = batch
            .into_iter()
            .map(|record| normalize_record(record, "u-alice"))
            .collect();
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(MalformedRecord::MissingId));
        let image = results[2].as_ref().expect("image record should be valid");
        assert_eq!(image.message.kind, MessageKind::Image);
        assert_eq!(image.message.delivery_state, DeliveryState::Read);
    }

    #[test]
    fn send_failure_keeps_original_code_in_message() {
        let err = normalize_send_failure(SyncError::transport("connection reset"));
        assert_eq!(err.category, SyncErrorCategory::SendFailure);
        assert_eq!(err.code, "send_failed");
        assert_eq!(err.message, "transport_error: connection reset");
        assert_eq!(normalize_send_failure(err.clone()), err);
    }
}
