//! Actions: client-initiated requests, identified by a name and a freshly
//! generated ActionID — the sole correlation token between an Action and
//! the Reaction records that answer it.

use uuid::Uuid;

use crate::record::{EOR, FIELD_SEP, KeyValRecord};

/// A named request plus its body fields. `Action` and `ActionID` are
/// reserved and always rendered first on the wire; callers supply the
/// rest of the fields via a [`KeyValRecord`] (typically schema-constrained).
#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    action_id: String,
    fields: KeyValRecord,
}

impl Action {
    /// Build a new action with a freshly generated ActionID.
    pub fn new(name: impl Into<String>, fields: KeyValRecord) -> Self {
        Self {
            name: name.into(),
            action_id: Uuid::new_v4().to_string(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Serialize to wire format: `Action`, then `ActionID`, then the
    /// body fields in their own order, terminated by the sentinel blank
    /// line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        out.push_str("Action");
        out.push_str(FIELD_SEP);
        out.push_str(&self.name);
        out.push_str(EOR);
        out.push_str("ActionID");
        out.push_str(FIELD_SEP);
        out.push_str(&self.action_id);
        out.push_str(EOR);

        // fields.to_wire() already appends the sentinel blank line; splice
        // its field lines in, then re-append the single sentinel ourselves.
        let body_lines = self.fields.to_wire();
        let body_lines = body_lines.trim_end_matches(EOR);
        if !body_lines.is_empty() {
            out.push_str(body_lines);
            out.push_str(EOR);
        }
        out.push_str(EOR);
        out
    }
}
