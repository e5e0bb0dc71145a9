//! Identifier newtypes for task families, commands, instances and notifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Names a task family (e.g. a particular scraper).
    TaskKind
);

string_id!(
    /// Names an operation within a task family. Registered commands may end
    /// in `*` to match every concrete command sharing the prefix.
    CommandKind
);

string_id!(
    /// Identifies one admitted execution. Unique within a process lifetime.
    InstanceId
);

string_id!(
    /// Identifies the notification channel a task reports to.
    NotifierId
);

impl CommandKind {
    /// Check whether this (possibly wildcard) pattern matches `command`.
    pub fn matches(&self, command: &CommandKind) -> bool {
        match self.0.strip_suffix('*') {
            Some(prefix) => command.0.starts_with(prefix),
            None => self.0 == command.0,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.ends_with('*')
    }
}
