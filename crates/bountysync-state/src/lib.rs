//! Synchronization state tokens with a keystream-obfuscated envelope.
//!
//! Every successful synchronization round stamps the platform with a token
//! recording how far a report has been mirrored into a tracker. The token is
//! embeddable in arbitrary comment text and recovered from it later:
//!
//! ```text
//! [YWH2BT:S:<base64(keystream-encrypted JSON)>]
//! ```
//!
//! The payload is a JSON array `[type_name, fields]`. The key is derived from
//! the report id, so tokens written for one report do not decode under
//! another. Decoding tolerates surrounding prose, foreign tokens and stale
//! payloads by reporting "no state" instead of failing.
//!
//! ## Security
//!
//! The keystream construction is obfuscation, not authenticated encryption.
//! Decoded state is a cache-coherence hint; callers must never use it for
//! authorization decisions.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use regex::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;

/// Opening sentinel of the token envelope.
pub const ENVELOPE_PREFIX: &str = "[YWH2BT:S:";
/// Closing sentinel of the token envelope.
pub const ENVELOPE_SUFFIX: &str = "]";

/// A state token error.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The key has no bytes to cycle.
    #[error("state key is empty")]
    EmptyKey,
    /// The state could not be serialized to JSON.
    #[error("unable to serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
    /// The decrypted payload is not the expected JSON shape.
    #[error("unable to deserialize state: {0}")]
    Deserialize(#[source] serde_json::Error),
    /// The envelope does not contain valid base64.
    #[error("invalid base64 in state token: {0}")]
    Base64(#[source] base64::DecodeError),
    /// The decrypted payload is not UTF-8 (wrong key or corrupted token).
    #[error("state payload is not valid UTF-8")]
    NotUtf8,
}

/// A typed payload that can travel inside a state token.
///
/// The `NAME` is embedded next to the fields and checked on decode, so a
/// token carrying one state type is "no state" for another.
pub trait State: Serialize + DeserializeOwned {
    /// Type tag embedded in the token payload.
    const NAME: &'static str;
}

/// A keystream derived from an identifier string.
///
/// Byte `i` of the stream is byte `i mod len` of the identifier, matching the
/// tokens already present in production platform logs.
#[derive(Debug, Clone)]
pub struct Key {
    key_bytes: Vec<u8>,
}

impl Key {
    /// Build a key from an identifier such as a report id.
    pub fn new(key: &str) -> Result<Self, StateError> {
        if key.is_empty() {
            return Err(StateError::EmptyKey);
        }
        Ok(Self {
            key_bytes: key.as_bytes().to_vec(),
        })
    }

    fn apply(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key_bytes.iter().cycle())
            .map(|(byte, key_byte)| byte ^ key_byte)
            .collect()
    }
}

/// Encode a state into an envelope embeddable in comment text.
pub fn encrypt<S: State>(state: &S, key: &str) -> Result<String, StateError> {
    let key = Key::new(key)?;
    let payload = serde_json::to_string(&(S::NAME, state)).map_err(StateError::Serialize)?;
    let encrypted = key.apply(payload.as_bytes());
    Ok(format!(
        "{ENVELOPE_PREFIX}{}{ENVELOPE_SUFFIX}",
        BASE64.encode(encrypted)
    ))
}

/// Decode a state token found anywhere inside `text`.
///
/// Returns `Ok(None)` when no envelope is present or when the recovered type
/// tag does not match `S::NAME`. Errors mean an envelope was found but its
/// payload could not be read under `key`; callers synchronizing against
/// possibly-foreign tokens usually treat that the same as `None`.
pub fn decrypt<S: State>(text: &str, key: &str) -> Result<Option<S>, StateError> {
    let Some(encoded) = extract_envelope(text) else {
        return Ok(None);
    };
    let key = Key::new(key)?;
    let encrypted = BASE64.decode(encoded).map_err(StateError::Base64)?;
    let payload = key.apply(&encrypted);
    let payload = String::from_utf8(payload).map_err(|_| StateError::NotUtf8)?;
    let (name, state): (String, serde_json::Value) =
        serde_json::from_str(&payload).map_err(StateError::Deserialize)?;
    if name != S::NAME {
        return Ok(None);
    }
    serde_json::from_value(state)
        .map(Some)
        .map_err(StateError::Deserialize)
}

/// Decode a state token, collapsing every failure mode to "no state".
///
/// This is the recognizer the synchronizer uses on tracker-update logs: a
/// token written for another report (wrong key) or by a newer version is
/// simply not ours.
pub fn decrypt_lenient<S: State>(text: &str, key: &str) -> Option<S> {
    decrypt(text, key).ok().flatten()
}

fn extract_envelope(text: &str) -> Option<&str> {
    static ENVELOPE_RE: OnceLock<Regex> = OnceLock::new();
    let re = ENVELOPE_RE
        .get_or_init(|| Regex::new(r"\[YWH2BT:S:([A-Za-z0-9+/=]+)\]").expect("valid regex"));
    re.captures(text)
        .map(|captures| captures.get(1).expect("group 1").as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct IssueState {
        closed: bool,
        bugtracker_name: Option<String>,
    }

    impl State for IssueState {
        const NAME: &'static str = "TrackerIssueState";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OtherState {
        closed: bool,
        bugtracker_name: Option<String>,
    }

    impl State for OtherState {
        const NAME: &'static str = "OtherState";
    }

    fn sample_state() -> IssueState {
        IssueState {
            closed: false,
            bugtracker_name: Some("gitlab-main".to_string()),
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let token = encrypt(&sample_state(), "123").expect("encrypt");
        let decoded: Option<IssueState> = decrypt(&token, "123").expect("decrypt");
        assert_eq!(Some(sample_state()), decoded);
    }

    #[test]
    fn token_is_enveloped_base64() {
        let token = encrypt(&sample_state(), "123").expect("encrypt");
        assert!(token.starts_with(ENVELOPE_PREFIX));
        assert!(token.ends_with(ENVELOPE_SUFFIX));
        let inner = &token[ENVELOPE_PREFIX.len()..token.len() - ENVELOPE_SUFFIX.len()];
        BASE64.decode(inner).expect("valid base64");
    }

    #[test]
    fn decrypt_finds_token_inside_surrounding_text() {
        let token = encrypt(&sample_state(), "123").expect("encrypt");
        let comment = format!("Synchronization done.\n\n{token}\n\nSee the issue for details.");
        let decoded: Option<IssueState> = decrypt(&comment, "123").expect("decrypt");
        assert_eq!(Some(sample_state()), decoded);
    }

    #[test]
    fn decrypt_without_envelope_is_no_state() {
        let decoded: Option<IssueState> =
            decrypt("just a plain comment", "123").expect("decrypt");
        assert_eq!(None, decoded);
    }

    #[test]
    fn decrypt_with_wrong_key_does_not_yield_state() {
        let token = encrypt(&sample_state(), "123").expect("encrypt");
        let decoded = decrypt::<IssueState>(&token, "456");
        assert!(matches!(decoded, Err(_) | Ok(None)));
        assert_eq!(None, decrypt_lenient::<IssueState>(&token, "456"));
    }

    #[test]
    fn decrypt_with_mismatched_type_name_is_no_state() {
        let token = encrypt(&sample_state(), "123").expect("encrypt");
        let decoded: Option<OtherState> = decrypt(&token, "123").expect("decrypt");
        assert_eq!(None, decoded);
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            encrypt(&sample_state(), ""),
            Err(StateError::EmptyKey)
        ));
    }

    #[test]
    fn keystream_cycles_over_short_keys() {
        let key = Key::new("ab").expect("key");
        let data = b"abcdef";
        let encrypted = key.apply(data);
        assert_eq!(data.to_vec(), key.apply(&encrypted));
    }

    proptest! {
        #[test]
        fn roundtrip_any_state(closed in any::<bool>(), name in "[a-z]{1,16}", key in "[0-9]{1,12}") {
            let state = IssueState {
                closed,
                bugtracker_name: Some(name),
            };
            let token = encrypt(&state, &key).expect("encrypt");
            let decoded: Option<IssueState> = decrypt(&token, &key).expect("decrypt");
            prop_assert_eq!(Some(state), decoded);
        }
    }
}
