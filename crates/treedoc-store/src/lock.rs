//! Record locks as carried by the lock procedures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::codec;
use crate::error::StoreError;
use crate::state::{Value, KEY_LOCK_CREATED, KEY_LOCK_OWNER};
use crate::tree::{self, Element};
use crate::Result;

/// Root attribute marking a refused lock procedure.
pub const FAILED_ATTR: &str = "failed";

/// A lock held on a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub owner: String,
    pub created: DateTime<Utc>,
}

impl Lock {
    pub fn new(owner: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            created,
        }
    }

    /// Wire text of the creation time, as passed to `lock-set`.
    pub fn created_text(&self) -> String {
        codec::format_calendar(&self.created)
    }
}

/// Reply of a lock procedure: the lock it saw and whether it was refused.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LockReply {
    pub lock: Option<Lock>,
    pub failed: bool,
}

impl LockReply {
    pub fn parse(document: Option<&str>) -> Result<Self> {
        let Some(xml) = document else {
            return Ok(Self {
                lock: None,
                failed: false,
            });
        };
        let root = Element::parse(xml).map_err(StoreError::Deserialization)?;
        let failed = root.attr(FAILED_ATTR) == Some("true");
        let state = tree::element_to_state(&root)?;
        let owner = state.get(KEY_LOCK_OWNER).and_then(Value::as_str);
        let lock = match (owner, state.get(KEY_LOCK_CREATED)) {
            (None, _) => None,
            (Some(owner), Some(Value::Calendar(created))) => Some(Lock::new(owner, *created)),
            (Some(owner), Some(Value::String(text))) => Some(Lock::new(
                owner,
                codec::parse_calendar(text).map_err(StoreError::Deserialization)?,
            )),
            (Some(_), _) => {
                return Err(StoreError::Deserialization(
                    "lock without creation time".into(),
                ))
            }
        };
        Ok(Self { lock, failed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_replies() {
        let created = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let xml = format!(
            "<document failed=\"true\">\
             <ecm__lockOwner type=\"string\">bob</ecm__lockOwner>\
             <ecm__lockCreated type=\"dateTime\">{}</ecm__lockCreated></document>",
            codec::format_calendar(&created)
        );
        let reply = LockReply::parse(Some(&xml)).unwrap();
        assert!(reply.failed);
        assert_eq!(reply.lock, Some(Lock::new("bob", created)));

        let empty = LockReply::parse(Some("<document/>")).unwrap();
        assert_eq!(empty.lock, None);
        assert!(!empty.failed);
        assert_eq!(LockReply::parse(None).unwrap().lock, None);
    }
}
