use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use uuid::Uuid;

use super::error::{EmptyKeySnafu, InvalidIdSnafu, StorageError, StorageResult};

/// Identifier of one chat message, minted locally as UUID v7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(raw: &str) -> StorageResult<Self> {
        Uuid::parse_str(raw.trim())
            .map(Self)
            .context(InvalidIdSnafu {
                stage: "parse-message-id",
                id_type: "message-id",
                raw,
            })
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, formatter)
    }
}

// Opaque string keys; callers choose the format.
macro_rules! define_storage_key {
    ($name:ident, $key_type:literal) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let trimmed = raw.trim();
                ensure!(
                    !trimmed.is_empty(),
                    EmptyKeySnafu {
                        stage: "parse-storage-key",
                        key_type: $key_type,
                    }
                );
                Ok(Self(trimmed.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::new(value)
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_key!(ChatId, "chat-id");
define_storage_key!(UserId, "user-id");
define_storage_key!(AgentId, "agent-id");

impl ChatId {
    /// Mints a locally unique conversation key.
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}
