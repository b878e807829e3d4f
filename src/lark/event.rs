use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{LarkError, LarkResult};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";
pub const P2P_CHAT_ENTERED_EVENT: &str = "im.chat.access_event.bot_p2p_chat_entered_v1";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct EncryptedEnvelope {
    encrypt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    challenge: Option<String>,
    token: Option<String>,
    header: Option<EventHeader>,
    event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EventHeader {
    event_id: String,
    event_type: String,
    token: Option<String>,
    app_id: String,
}

#[derive(Debug, Deserialize)]
struct MessageReceiveEvent {
    sender: MessageSender,
    message: MessageBody,
}

#[derive(Debug, Deserialize)]
struct MessageSender {
    sender_id: UserIds,
}

#[derive(Debug, Deserialize)]
struct UserIds {
    open_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message_id: String,
    chat_id: String,
    chat_type: String,
    message_type: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatEnteredEvent {
    chat_id: String,
    operator_id: UserIds,
}

// ============================================================================
// Decoded events
// ============================================================================

/// A text message a user sent to the bot.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub event_id: String,
    /// The bot application that received the message
    pub app_id: String,
    /// Sender's open id
    pub open_id: String,
    pub message_id: String,
    pub chat_id: String,
    pub chat_type: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LarkEvent {
    /// Endpoint ownership check; echo the challenge back.
    UrlVerification { challenge: String },
    MessageReceived(IncomingMessage),
    /// A user opened the one-to-one chat with the bot.
    P2pChatEntered {
        event_id: String,
        app_id: String,
        open_id: String,
        chat_id: String,
    },
    /// Acknowledged but not acted upon.
    Ignored {
        event_id: Option<String>,
        event_type: String,
        reason: String,
    },
}

impl LarkEvent {
    pub fn event_id(&self) -> Option<&str> {
        match self {
            LarkEvent::UrlVerification { .. } => None,
            LarkEvent::MessageReceived(msg) => Some(&msg.event_id),
            LarkEvent::P2pChatEntered { event_id, .. } => Some(event_id),
            LarkEvent::Ignored { event_id, .. } => event_id.as_deref(),
        }
    }
}

// ============================================================================
// Decoder
// ============================================================================

/// Turns raw callback bodies into [`LarkEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct EventDecoder {
    verification_token: Option<String>,
    encrypt_key: Option<String>,
}

impl EventDecoder {
    pub fn new(verification_token: Option<String>, encrypt_key: Option<String>) -> Self {
        Self {
            verification_token,
            encrypt_key,
        }
    }

    pub fn decode(&self, body: &str) -> LarkResult<LarkEvent> {
        let plain = self.decrypt_body(body)?;
        let envelope: Envelope = serde_json::from_str(&plain)
            .map_err(|e| LarkError::InvalidPayload(e.to_string()))?;

        if envelope.kind.as_deref() == Some("url_verification") {
            self.verify_token(envelope.token.as_deref())?;
            let challenge = envelope
                .challenge
                .ok_or_else(|| LarkError::InvalidPayload("missing challenge".to_string()))?;
            return Ok(LarkEvent::UrlVerification { challenge });
        }

        let header = envelope
            .header
            .ok_or_else(|| LarkError::InvalidPayload("missing event header".to_string()))?;
        self.verify_token(header.token.as_deref())?;

        let event = envelope.event.unwrap_or(serde_json::Value::Null);
        match header.event_type.as_str() {
            MESSAGE_RECEIVE_EVENT => decode_message(header, event),
            P2P_CHAT_ENTERED_EVENT => {
                let entered: ChatEnteredEvent = serde_json::from_value(event)
                    .map_err(|e| LarkError::InvalidPayload(e.to_string()))?;
                let open_id = entered.operator_id.open_id.ok_or_else(|| {
                    LarkError::InvalidPayload("missing operator open_id".to_string())
                })?;
                Ok(LarkEvent::P2pChatEntered {
                    event_id: header.event_id,
                    app_id: header.app_id,
                    open_id,
                    chat_id: entered.chat_id,
                })
            }
            other => Ok(LarkEvent::Ignored {
                event_id: Some(header.event_id),
                event_type: other.to_string(),
                reason: "unhandled event type".to_string(),
            }),
        }
    }

    fn decrypt_body(&self, body: &str) -> LarkResult<String> {
        let outer: EncryptedEnvelope = serde_json::from_str(body)
            .map_err(|e| LarkError::InvalidPayload(e.to_string()))?;

        match (outer.encrypt, &self.encrypt_key) {
            (Some(encrypted), Some(key)) => decrypt_event(key, &encrypted),
            (Some(_), None) => Err(LarkError::Decrypt(
                "received encrypted event but no encrypt key is configured".to_string(),
            )),
            (None, _) => Ok(body.to_string()),
        }
    }

    fn verify_token(&self, presented: Option<&str>) -> LarkResult<()> {
        match &self.verification_token {
            Some(expected) if presented != Some(expected.as_str()) => Err(LarkError::TokenMismatch),
            _ => Ok(()),
        }
    }
}

fn decode_message(header: EventHeader, event: serde_json::Value) -> LarkResult<LarkEvent> {
    let received: MessageReceiveEvent =
        serde_json::from_value(event).map_err(|e| LarkError::InvalidPayload(e.to_string()))?;

    let open_id = received
        .sender
        .sender_id
        .open_id
        .ok_or_else(|| LarkError::InvalidPayload("missing sender open_id".to_string()))?;

    if received.message.message_type != "text" {
        return Ok(LarkEvent::Ignored {
            event_id: Some(header.event_id),
            event_type: header.event_type,
            reason: format!("unsupported message type: {}", received.message.message_type),
        });
    }

    let text = extract_text(&received.message.content).ok_or_else(|| {
        LarkError::InvalidPayload("text message without text content".to_string())
    })?;

    Ok(LarkEvent::MessageReceived(IncomingMessage {
        event_id: header.event_id,
        app_id: header.app_id,
        open_id,
        message_id: received.message.message_id,
        chat_id: received.message.chat_id,
        chat_type: received.message.chat_type,
        text,
    }))
}

/// Message content is itself a JSON document: `{"text": "..."}`.
fn extract_text(content: &str) -> Option<String> {
    let json: serde_json::Value = serde_json::from_str(content).ok()?;
    json.get("text")
        .and_then(|t| t.as_str())
        .map(|t| t.to_string())
}

/// AES-256-CBC with key = SHA-256(encrypt key); the first block of the decoded
/// payload is the IV.
pub fn decrypt_event(encrypt_key: &str, encrypted_b64: &str) -> LarkResult<String> {
    let key = Sha256::digest(encrypt_key.as_bytes());
    let raw = base64::engine::general_purpose::STANDARD
        .decode(encrypted_b64.trim())
        .map_err(|e| LarkError::Decrypt(format!("invalid base64: {e}")))?;

    if raw.len() < 32 || raw.len() % 16 != 0 {
        return Err(LarkError::Decrypt(format!(
            "invalid ciphertext length: {}",
            raw.len()
        )));
    }

    let (iv, ciphertext) = raw.split_at(16);
    let mut buffer = ciphertext.to_vec();
    let decryptor = Aes256CbcDec::new_from_slices(key.as_slice(), iv)
        .map_err(|e| LarkError::Decrypt(e.to_string()))?;
    let plain = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| LarkError::Decrypt(e.to_string()))?;

    String::from_utf8(plain.to_vec())
        .map_err(|e| LarkError::Decrypt(format!("plaintext is not UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encrypt_event(encrypt_key: &str, iv: [u8; 16], plaintext: &str) -> String {
        use aes::cipher::BlockEncryptMut;
        type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

        let key = Sha256::digest(encrypt_key.as_bytes());
        let mut buffer = vec![0u8; plaintext.len() + 16];
        buffer[..plaintext.len()].copy_from_slice(plaintext.as_bytes());
        let ciphertext = Aes256CbcEnc::new_from_slices(key.as_slice(), &iv)
            .unwrap()
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
            .unwrap();

        let mut raw = iv.to_vec();
        raw.extend_from_slice(ciphertext);
        base64::engine::general_purpose::STANDARD.encode(raw)
    }

    fn message_event(event_id: &str, open_id: &str, text: &str, token: &str) -> serde_json::Value {
        json!({
            "schema": "2.0",
            "header": {
                "event_id": event_id,
                "event_type": "im.message.receive_v1",
                "create_time": "1680000000000",
                "token": token,
                "app_id": "cli_app",
                "tenant_key": "tenant"
            },
            "event": {
                "sender": {
                    "sender_id": { "open_id": open_id, "user_id": "u1", "union_id": "on_1" },
                    "sender_type": "user",
                    "tenant_key": "tenant"
                },
                "message": {
                    "message_id": "om_1",
                    "create_time": "1680000000000",
                    "chat_id": "oc_1",
                    "chat_type": "p2p",
                    "message_type": "text",
                    "content": json!({ "text": text }).to_string()
                }
            }
        })
    }

    #[test]
    fn test_url_verification() {
        let decoder = EventDecoder::new(Some("vt".to_string()), None);
        let body = json!({ "challenge": "abc", "token": "vt", "type": "url_verification" });
        assert_eq!(
            decoder.decode(&body.to_string()).unwrap(),
            LarkEvent::UrlVerification { challenge: "abc".to_string() }
        );

        let body = json!({ "challenge": "abc", "token": "wrong", "type": "url_verification" });
        assert!(matches!(
            decoder.decode(&body.to_string()),
            Err(LarkError::TokenMismatch)
        ));
    }

    #[test]
    fn test_message_received() {
        let decoder = EventDecoder::new(Some("vt".to_string()), None);
        let body = message_event("ev_1", "ou_alice", "hello", "vt").to_string();

        match decoder.decode(&body).unwrap() {
            LarkEvent::MessageReceived(msg) => {
                assert_eq!(msg.event_id, "ev_1");
                assert_eq!(msg.app_id, "cli_app");
                assert_eq!(msg.open_id, "ou_alice");
                assert_eq!(msg.chat_type, "p2p");
                assert_eq!(msg.text, "hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_token_mismatch() {
        let decoder = EventDecoder::new(Some("vt".to_string()), None);
        let body = message_event("ev_1", "ou_alice", "hello", "forged").to_string();
        assert!(matches!(decoder.decode(&body), Err(LarkError::TokenMismatch)));

        // No token configured: anything goes
        let open = EventDecoder::default();
        assert!(open.decode(&body).is_ok());
    }

    #[test]
    fn test_non_text_message_is_ignored() {
        let decoder = EventDecoder::default();
        let mut body = message_event("ev_2", "ou_alice", "", "vt");
        body["event"]["message"]["message_type"] = json!("image");
        body["event"]["message"]["content"] = json!("{\"image_key\":\"img_1\"}");

        match decoder.decode(&body.to_string()).unwrap() {
            LarkEvent::Ignored { event_id, reason, .. } => {
                assert_eq!(event_id.as_deref(), Some("ev_2"));
                assert!(reason.contains("image"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_p2p_chat_entered() {
        let decoder = EventDecoder::default();
        let body = json!({
            "schema": "2.0",
            "header": {
                "event_id": "ev_3",
                "event_type": "im.chat.access_event.bot_p2p_chat_entered_v1",
                "app_id": "cli_app"
            },
            "event": {
                "chat_id": "oc_1",
                "operator_id": { "open_id": "ou_alice" }
            }
        });
        assert_eq!(
            decoder.decode(&body.to_string()).unwrap(),
            LarkEvent::P2pChatEntered {
                event_id: "ev_3".to_string(),
                app_id: "cli_app".to_string(),
                open_id: "ou_alice".to_string(),
                chat_id: "oc_1".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_event_is_ignored() {
        let decoder = EventDecoder::default();
        let body = json!({
            "schema": "2.0",
            "header": { "event_id": "ev_4", "event_type": "im.message.message_read_v1", "app_id": "cli_app" },
            "event": {}
        });
        assert!(matches!(
            decoder.decode(&body.to_string()).unwrap(),
            LarkEvent::Ignored { .. }
        ));
    }

    #[test]
    fn test_invalid_payload() {
        let decoder = EventDecoder::default();
        assert!(matches!(decoder.decode("not json"), Err(LarkError::InvalidPayload(_))));
        assert!(matches!(decoder.decode("{}"), Err(LarkError::InvalidPayload(_))));
    }

    #[test]
    fn test_encrypted_event() {
        let plaintext = message_event("ev_5", "ou_alice", "secret hello", "vt").to_string();
        let encrypted = encrypt_event("kudryavka", [7u8; 16], &plaintext);
        let body = json!({ "encrypt": encrypted }).to_string();

        let decoder = EventDecoder::new(Some("vt".to_string()), Some("kudryavka".to_string()));
        match decoder.decode(&body).unwrap() {
            LarkEvent::MessageReceived(msg) => assert_eq!(msg.text, "secret hello"),
            other => panic!("unexpected event: {:?}", other),
        }

        let no_key = EventDecoder::new(Some("vt".to_string()), None);
        assert!(matches!(no_key.decode(&body), Err(LarkError::Decrypt(_))));

        let wrong_key = EventDecoder::new(Some("vt".to_string()), Some("other".to_string()));
        assert!(wrong_key.decode(&body).is_err());
    }

    #[test]
    fn test_decrypt_rejects_short_payload() {
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(matches!(decrypt_event("k", &short), Err(LarkError::Decrypt(_))));
        assert!(matches!(decrypt_event("k", "***"), Err(LarkError::Decrypt(_))));
    }
}
