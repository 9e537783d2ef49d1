//! Network address type.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Server suffix for individual user addresses.
pub const USER_SERVER: &str = "s.whatsapp.net";

/// Address of a user or a specific linked device on the messaging network.
///
/// Displayed as `user@server` or, for a linked device, `user:device@server`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Jid {
    user: String,
    device: Option<u16>,
    server: String,
}

impl Jid {
    /// Address of the account itself (no device part).
    pub fn user(account: impl Into<String>) -> Self {
        Self {
            user: account.into(),
            device: None,
            server: USER_SERVER.to_string(),
        }
    }

    /// Address of one linked device of an account.
    pub fn device(account: impl Into<String>, device: u16) -> Self {
        Self {
            user: account.into(),
            device: Some(device),
            server: USER_SERVER.to_string(),
        }
    }

    /// The account part, i.e. the phone-equivalent identifier.
    pub fn account(&self) -> &str {
        &self.user
    }

    pub fn device_index(&self) -> Option<u16> {
        self.device
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// The same address without the device part.
    pub fn to_user(&self) -> Jid {
        Jid {
            user: self.user.clone(),
            device: None,
            server: self.server.clone(),
        }
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device {
            Some(device) => write!(f, "{}:{}@{}", self.user, device, self.server),
            None => write!(f, "{}@{}", self.user, self.server),
        }
    }
}

/// Error returned for malformed addresses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid JID: {0}")]
pub struct ParseJidError(pub String);

impl FromStr for Jid {
    type Err = ParseJidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (local, server) = s
            .split_once('@')
            .ok_or_else(|| ParseJidError(s.to_string()))?;
        if local.is_empty() || server.is_empty() || server.contains('@') {
            return Err(ParseJidError(s.to_string()));
        }

        let (user, device) = match local.split_once(':') {
            Some((user, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| ParseJidError(s.to_string()))?;
                (user, Some(device))
            }
            None => (local, None),
        };
        if user.is_empty() {
            return Err(ParseJidError(s.to_string()));
        }

        Ok(Jid {
            user: user.to_string(),
            device,
            server: server.to_string(),
        })
    }
}

impl TryFrom<String> for Jid {
    type Error = ParseJidError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Jid> for String {
    fn from(jid: Jid) -> Self {
        jid.to_string()
    }
}
