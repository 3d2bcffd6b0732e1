//! Property-based tests for the dmchat wire and log formats.
//!
//! Uses proptest to verify:
//! 1. Concatenated log frames decode back to the same records, in order.
//! 2. A torn tail never hides earlier complete records.
//! 3. Random bytes never cause a panic in any decoder.
//! 4. Content validation agrees with the UTF-16 length limit.

use proptest::prelude::*;
use uuid::Uuid;

use dmchat_proto::codec::{self, LogRecord};
use dmchat_proto::frame;
use dmchat_proto::message::{
    ConversationId, MAX_CONTENT_LEN, Message, MessageExt, MessageId, validate_content,
};

/// Strategy for generating confirmed messages.
fn arb_message() -> impl Strategy<Value = Message> {
    (
        any::<u64>(),
        "[^\x00]{1,256}",
        "[a-z]{1,16}",
        -1i32..=3,
        prop::option::of(any::<u128>()),
    )
        .prop_map(|(id, content, sender, retry_times, nonce)| Message {
            id: Some(MessageId::new(id.to_string())),
            content,
            sender_username: sender,
            ext: MessageExt {
                retry_times,
                client_nonce: nonce.map(Uuid::from_u128),
            },
        })
}

/// Strategy for generating log records.
fn arb_record() -> impl Strategy<Value = LogRecord> {
    ("[a-z0-9]{1,12}", arb_message()).prop_map(|(conv, message)| LogRecord {
        conversation: ConversationId::new(conv),
        message,
    })
}

proptest! {
    /// A log file is a concatenation of frames; decoding it yields every record.
    #[test]
    fn concatenated_frames_decode_in_order(records in prop::collection::vec(arb_record(), 0..16)) {
        let mut buffer = Vec::new();
        for record in &records {
            buffer.extend_from_slice(&codec::encode_framed(record).expect("encode should succeed"));
        }
        let (decoded, consumed) = codec::decode_all(&buffer);
        prop_assert_eq!(decoded, records);
        prop_assert_eq!(consumed, buffer.len());
    }

    /// Truncating the last frame only loses the last record.
    #[test]
    fn torn_tail_keeps_complete_records(
        records in prop::collection::vec(arb_record(), 1..8),
        cut in 1usize..4,
    ) {
        let mut buffer = Vec::new();
        for record in &records {
            buffer.extend_from_slice(&codec::encode_framed(record).expect("encode should succeed"));
        }
        buffer.truncate(buffer.len() - cut);
        let (decoded, _) = codec::decode_all(&buffer);
        prop_assert_eq!(&decoded[..], &records[..records.len() - 1]);
    }

    /// Random bytes never cause a panic in the log decoders.
    #[test]
    fn random_bytes_decode_no_panic(bytes in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = codec::decode(&bytes);
        let _ = codec::decode_framed(&bytes);
        let _ = codec::decode_all(&bytes);
    }

    /// Random text never causes a panic in the channel frame decoder.
    #[test]
    fn random_text_frame_decode_no_panic(text in ".{0,256}") {
        let _ = frame::decode(&text);
    }

    /// Any non-empty ASCII text up to the limit is accepted; longer text is not.
    #[test]
    fn ascii_length_limit(len in 0usize..(MAX_CONTENT_LEN + 64)) {
        let text = "x".repeat(len);
        let result = validate_content(&text);
        prop_assert_eq!(result.is_ok(), (1..=MAX_CONTENT_LEN).contains(&len));
    }
}
