//! The ordered key/value record that underlies every AMI message: actions,
//! single-record reactions, and each record of an EventList.

use std::collections::HashMap;

use crate::error::{AmiError, Result};

pub const FIELD_SEP: &str = ": ";
pub const EOR: &str = "\r\n";
pub const TERMINATOR: &str = "\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Storage {
    /// Populated by `parse`: `order` preserves every occurrence (including
    /// duplicate keys) in arrival order, `values` keeps the last bound value.
    Parsed {
        order: Vec<(String, String)>,
        values: HashMap<String, String>,
    },
    /// Populated by `with_schema`: `keys` is the fixed, caller-declared
    /// field order. Writes for keys outside this set are rejected.
    Schema {
        keys: Vec<String>,
        values: HashMap<String, String>,
    },
}

/// An ordered key/value record: the atomic payload of the AMI wire format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValRecord {
    storage: Storage,
}

impl KeyValRecord {
    /// Parse a record out of a message buffer (the bytes between two
    /// terminators, or the client's own constructed field list).
    ///
    /// Scans linearly for `": "`, takes the key, then scans for the next
    /// `"\r\n"` to take the value, repeating until no more separators are
    /// found. A trailing blank line (the sentinel) simply fails to match
    /// and ends the scan.
    pub fn parse(buf: &str) -> Self {
        let mut order = Vec::new();
        let mut values = HashMap::new();
        let mut rest = buf;

        while let Some(sep_idx) = rest.find(FIELD_SEP) {
            let key = &rest[..sep_idx];
            let after_sep = &rest[sep_idx + FIELD_SEP.len()..];
            let Some(eor_idx) = after_sep.find(EOR) else {
                break;
            };
            let value = &after_sep[..eor_idx];
            order.push((key.to_owned(), value.to_owned()));
            values.insert(key.to_owned(), value.to_owned());
            rest = &after_sep[eor_idx + EOR.len()..];
        }

        Self {
            storage: Storage::Parsed { order, values },
        }
    }

    /// Build a record constrained to an explicit, ordered set of allowed
    /// keys. Used for outbound actions to enforce the protocol schema.
    pub fn with_schema<I, S>(allowed_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            storage: Storage::Schema {
                keys: allowed_keys.into_iter().map(Into::into).collect(),
                values: HashMap::new(),
            },
        }
    }

    /// Set a field's value.
    ///
    /// In parsed mode any key may be set, and the key is appended to the
    /// order list if not already present. In schema mode, keys outside
    /// the declared set are rejected.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        let value = value.into();
        match &mut self.storage {
            Storage::Parsed { order, values } => {
                if !values.contains_key(&key) {
                    order.push((key.clone(), value.clone()));
                }
                values.insert(key, value);
                Ok(())
            }
            Storage::Schema { keys, values } => {
                if !keys.iter().any(|k| k == &key) {
                    return Err(AmiError::SchemaViolation(key));
                }
                values.insert(key, value);
                Ok(())
            }
        }
    }

    /// Look up the last bound value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        match &self.storage {
            Storage::Parsed { values, .. } | Storage::Schema { values, .. } => {
                values.get(key).map(String::as_str)
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// `true` if this record carries no fields at all — the sign of a
    /// stray terminator or other malformed input reaching `parse`.
    pub fn is_empty(&self) -> bool {
        match &self.storage {
            Storage::Parsed { order, .. } => order.is_empty(),
            Storage::Schema { keys, .. } => keys.is_empty(),
        }
    }

    /// The wire-order `(key, value)` pairs for this record. In schema mode,
    /// a key with no set value serializes with an empty value.
    fn wire_pairs(&self) -> Vec<(&str, &str)> {
        match &self.storage {
            Storage::Parsed { order, .. } => order
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect(),
            Storage::Schema { keys, values } => keys
                .iter()
                .map(|k| (k.as_str(), values.get(k).map_or("", String::as_str)))
                .collect(),
        }
    }

    /// Serialize to wire format: one `<key>: <value>\r\n` line per field,
    /// followed by the empty-line terminator.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (key, value) in self.wire_pairs() {
            out.push_str(key);
            out.push_str(FIELD_SEP);
            out.push_str(value);
            out.push_str(EOR);
        }
        out.push_str(EOR);
        out
    }
}

impl Default for KeyValRecord {
    fn default() -> Self {
        Self {
            storage: Storage::Parsed {
                order: Vec::new(),
                values: HashMap::new(),
            },
        }
    }
}

/// `true` iff `record`'s `Response` field is `Success` or `Goodbye`
/// (Logoff's response is treated as success by this protocol).
pub(crate) fn is_success_response(record: &KeyValRecord) -> bool {
    matches!(record.get("Response"), Some("Success") | Some("Goodbye"))
}

/// `true` iff `value` is a terminal EventList marker. `cancelled` is the
/// spelling the protocol actually uses; `canceled` is accepted too.
pub(crate) fn is_list_terminal(value: &str) -> bool {
    matches!(value, "Complete" | "cancelled" | "canceled")
}
