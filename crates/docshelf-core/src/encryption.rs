//! Optional payload encryption
//!
//! The caller supplies two pure text functions; this module only decides
//! *what* goes through them. Collections that enumerate encrypted field
//! names get field-level encryption (everything else stays queryable);
//! all other collections get the whole payload encrypted.
//!
//! Stored shapes are self-describing, so reading never needs to know
//! which mode was active when the record was written:
//!
//! - whole payload: `{"encrypted_payload": "<ciphertext>"}`
//! - field level: the remaining payload plus
//!   `"encrypted_fields": {"<field>": "<ciphertext>", ...}`

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{StorageError, StorageResult};
use crate::record::keys;

/// Key holding the whole-payload ciphertext
pub const ENCRYPTED_PAYLOAD: &str = "encrypted_payload";
/// Key holding per-field ciphertexts
pub const ENCRYPTED_FIELDS: &str = "encrypted_fields";

/// A text transform supplied by the caller
pub type CipherFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Caller-provided encryption hooks plus per-collection field lists
#[derive(Clone)]
pub struct Encryption {
    encrypt: CipherFn,
    decrypt: CipherFn,
    encrypted_fields: HashMap<String, Vec<String>>,
}

impl fmt::Debug for Encryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Encryption")
            .field("encrypted_fields", &self.encrypted_fields)
            .finish_non_exhaustive()
    }
}

impl Encryption {
    pub fn new<E, D>(encrypt: E, decrypt: D) -> Self
    where
        E: Fn(&str) -> String + Send + Sync + 'static,
        D: Fn(&str) -> String + Send + Sync + 'static,
    {
        Self {
            encrypt: Arc::new(encrypt),
            decrypt: Arc::new(decrypt),
            encrypted_fields: HashMap::new(),
        }
    }

    /// Switch a collection to field-level encryption
    ///
    /// `collection` and `id` are never encrypted; they address the record.
    pub fn with_encrypted_fields<I, S>(mut self, collection: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields: Vec<String> = fields
            .into_iter()
            .map(Into::into)
            .filter(|f| f != keys::COLLECTION && f != keys::ID)
            .collect();
        if !fields.is_empty() {
            self.encrypted_fields.insert(collection.to_string(), fields);
        }
        self
    }

    pub fn encrypted_fields(&self, collection: &str) -> Option<&[String]> {
        self.encrypted_fields.get(collection).map(Vec::as_slice)
    }

    /// Encrypt a payload according to its collection's mode
    pub fn seal(&self, collection: Option<&str>, payload: &Map<String, Value>) -> StorageResult<SealedPayload> {
        match collection.and_then(|c| self.encrypted_fields(c)) {
            Some(fields) => {
                let mut plain = payload.clone();
                let mut sealed = BTreeMap::new();
                for field in fields {
                    if let Some(value) = plain.remove(field) {
                        let text = serde_json::to_string(&value)?;
                        sealed.insert(field.clone(), (self.encrypt)(&text));
                    }
                }
                Ok(SealedPayload::Fields {
                    payload: plain,
                    encrypted_fields: sealed,
                })
            }
            None => {
                let text = serde_json::to_string(payload)?;
                Ok(SealedPayload::Whole {
                    encrypted_payload: (self.encrypt)(&text),
                })
            }
        }
    }

    fn decrypt_json(&self, ciphertext: &str) -> StorageResult<Value> {
        let text = (self.decrypt)(ciphertext);
        serde_json::from_str(&text).map_err(|e| {
            StorageError::Encryption(format!("decrypted text is not valid JSON: {}", e))
        })
    }
}

/// Payload as stored in a table's `data` column
#[derive(Debug, Clone, PartialEq)]
pub enum SealedPayload {
    Plain(Map<String, Value>),
    Whole {
        encrypted_payload: String,
    },
    Fields {
        payload: Map<String, Value>,
        encrypted_fields: BTreeMap<String, String>,
    },
}

impl SealedPayload {
    /// Seal with `encryption` when configured, otherwise store as-is
    pub fn seal(
        encryption: Option<&Encryption>,
        collection: Option<&str>,
        payload: &Map<String, Value>,
    ) -> StorageResult<Self> {
        check_reserved_keys(payload)?;
        match encryption {
            Some(enc) => enc.seal(collection, payload),
            None => Ok(SealedPayload::Plain(payload.clone())),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        !matches!(self, SealedPayload::Plain(_))
    }

    /// JSON stored in the `data` column
    pub fn to_json(&self) -> Value {
        match self {
            SealedPayload::Plain(map) => Value::Object(map.clone()),
            SealedPayload::Whole { encrypted_payload } => {
                let mut map = Map::new();
                map.insert(
                    ENCRYPTED_PAYLOAD.to_string(),
                    Value::String(encrypted_payload.clone()),
                );
                Value::Object(map)
            }
            SealedPayload::Fields {
                payload,
                encrypted_fields,
            } => {
                let mut map = payload.clone();
                let fields = encrypted_fields
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                map.insert(ENCRYPTED_FIELDS.to_string(), Value::Object(fields));
                Value::Object(map)
            }
        }
    }

    /// Recognise the stored shape of a `data` column
    pub fn from_json(value: Value) -> StorageResult<Self> {
        let Value::Object(mut map) = value else {
            return Err(StorageError::validation("stored payload is not a JSON object"));
        };

        if map.len() == 1 {
            if let Some(Value::String(ciphertext)) = map.get(ENCRYPTED_PAYLOAD) {
                return Ok(SealedPayload::Whole {
                    encrypted_payload: ciphertext.clone(),
                });
            }
        }

        if let Some(Value::Object(fields)) = map.get(ENCRYPTED_FIELDS) {
            if fields.values().all(Value::is_string) {
                let encrypted_fields = fields
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect();
                map.remove(ENCRYPTED_FIELDS);
                return Ok(SealedPayload::Fields {
                    payload: map,
                    encrypted_fields,
                });
            }
        }

        Ok(SealedPayload::Plain(map))
    }

    /// Recover the original payload
    pub fn open(self, encryption: Option<&Encryption>) -> StorageResult<Map<String, Value>> {
        match self {
            SealedPayload::Plain(map) => Ok(map),
            SealedPayload::Whole { encrypted_payload } => {
                match require_hook(encryption)?.decrypt_json(&encrypted_payload)? {
                    Value::Object(map) => Ok(map),
                    _ => Err(StorageError::Encryption(
                        "decrypted payload is not a JSON object".to_string(),
                    )),
                }
            }
            SealedPayload::Fields {
                mut payload,
                encrypted_fields,
            } => {
                let enc = require_hook(encryption)?;
                for (field, ciphertext) in encrypted_fields {
                    payload.insert(field, enc.decrypt_json(&ciphertext)?);
                }
                Ok(payload)
            }
        }
    }
}

/// Reject payloads that would be mistaken for a sealed shape when read back
pub fn check_reserved_keys(payload: &Map<String, Value>) -> StorageResult<()> {
    for key in [ENCRYPTED_PAYLOAD, ENCRYPTED_FIELDS] {
        if payload.contains_key(key) {
            return Err(StorageError::validation(format!(
                "payload key '{}' is reserved for encrypted records",
                key
            )));
        }
    }
    Ok(())
}

fn require_hook(encryption: Option<&Encryption>) -> StorageResult<&Encryption> {
    encryption.ok_or_else(|| {
        StorageError::Encryption(
            "record is encrypted but no decryption hook is configured".to_string(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Reversible toy cipher for tests
    fn rot_encryption() -> Encryption {
        Encryption::new(
            |s| s.chars().rev().collect::<String>(),
            |s| s.chars().rev().collect::<String>(),
        )
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_plain_passthrough() {
        let p = payload(json!({"collection": "users", "name": "ada"}));
        let sealed = SealedPayload::seal(None, Some("users"), &p).unwrap();
        assert!(!sealed.is_encrypted());

        let restored = SealedPayload::from_json(sealed.to_json()).unwrap();
        assert_eq!(restored.open(None).unwrap(), p);
    }

    #[test]
    fn test_whole_payload_round_trip() {
        let enc = rot_encryption();
        let p = payload(json!({"collection": "notes", "body": "secret", "v": 2}));

        let sealed = SealedPayload::seal(Some(&enc), Some("notes"), &p).unwrap();
        let stored = sealed.to_json();
        assert!(stored.get(ENCRYPTED_PAYLOAD).is_some());
        assert!(stored.get("body").is_none());

        let restored = SealedPayload::from_json(stored).unwrap();
        assert!(matches!(restored, SealedPayload::Whole { .. }));
        assert_eq!(restored.open(Some(&enc)).unwrap(), p);
    }

    #[test]
    fn test_field_level_round_trip() {
        let enc = rot_encryption().with_encrypted_fields("users", ["ssn", "collection"]);
        let p = payload(json!({"collection": "users", "id": "u1", "email": "a@b.c", "ssn": {"n": 123}}));

        let stored = SealedPayload::seal(Some(&enc), Some("users"), &p)
            .unwrap()
            .to_json();
        // Unencrypted fields stay addressable
        assert_eq!(stored["email"], json!("a@b.c"));
        assert_eq!(stored["collection"], json!("users"));
        assert!(stored.get("ssn").is_none());
        assert!(stored[ENCRYPTED_FIELDS]["ssn"].is_string());

        let restored = SealedPayload::from_json(stored).unwrap();
        assert_eq!(restored.open(Some(&enc)).unwrap(), p);
    }

    #[test]
    fn test_reserved_keys_rejected() {
        let enc = rot_encryption().with_encrypted_fields("c", ["k"]);
        for p in [
            payload(json!({"collection": "c", "id": "1", "encrypted_fields": {"k": "v"}})),
            payload(json!({"encrypted_payload": "abc"})),
        ] {
            for encryption in [None, Some(&enc)] {
                let err = SealedPayload::seal(encryption, Some("c"), &p).unwrap_err();
                assert!(matches!(err, StorageError::Validation(_)));
            }
        }
    }

    #[test]
    fn test_encrypted_without_hook_fails() {
        let enc = rot_encryption();
        let p = payload(json!({"a": 1}));
        let sealed = SealedPayload::seal(Some(&enc), None, &p).unwrap();

        let err = sealed.open(None).unwrap_err();
        assert!(matches!(err, StorageError::Encryption(_)));
    }

    #[test]
    fn test_bad_decryption_output() {
        let enc = Encryption::new(|s| s.to_string(), |_| "not json".to_string());
        let sealed = SealedPayload::seal(Some(&enc), None, &payload(json!({"a": 1}))).unwrap();
        assert!(matches!(
            sealed.open(Some(&enc)),
            Err(StorageError::Encryption(_))
        ));
    }
}
