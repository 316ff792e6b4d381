// Client-side parsing of line protocol replies.
use crate::common::error::{ChatError, ChatResult};
use serde::de::DeserializeOwned;

/// Split a raw server reply into its payload, mapping `ERR: <Code>: <detail>`
/// back onto the shared error taxonomy.
pub fn parse_reply(resp: &str) -> ChatResult<String> {
    let trimmed = resp.trim();
    if let Some(payload) = trimmed.strip_prefix("OK:") {
        return Ok(payload.trim().to_string());
    }
    if let Some(rest) = trimmed.strip_prefix("ERR:") {
        let rest = rest.trim();
        return match rest.split_once(':') {
            Some((code, detail)) => Err(ChatError::from_wire(code.trim(), detail.trim())),
            None => Err(ChatError::Transient(rest.to_string())),
        };
    }
    Err(ChatError::Transient(format!("unexpected reply: {}", trimmed)))
}

/// Decode a JSON payload from an `OK:` reply.
pub fn decode<T: DeserializeOwned>(payload: &str) -> ChatResult<T> {
    serde_json::from_str(payload)
        .map_err(|e| ChatError::Transient(format!("malformed payload: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::MessageRecord;

    #[test]
    fn ok_payload_is_extracted() {
        assert_eq!(parse_reply("OK: pong").unwrap(), "pong");
        assert_eq!(parse_reply("OK: 3\n").unwrap(), "3");
    }

    #[test]
    fn err_replies_map_back_to_the_taxonomy() {
        let err = parse_reply("ERR: Unauthorized: user x is not a participant").unwrap_err();
        assert_eq!(
            err,
            ChatError::Unauthorized("user x is not a participant".into())
        );

        let err = parse_reply("ERR: NotFound: unknown conversation c9").unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[test]
    fn garbage_reads_as_transient() {
        assert!(parse_reply("???").unwrap_err().is_transient());
        assert!(parse_reply("").unwrap_err().is_transient());
    }

    #[test]
    fn json_payloads_decode() {
        let json = r#"{"id":1,"conversation_id":"c1","sender_id":"u1","content":"hi","created_at":42,"is_seen":false}"#;
        let record: MessageRecord = decode(json).unwrap();
        assert_eq!(record.content, "hi");
        assert!(decode::<MessageRecord>("not json").is_err());
    }
}
