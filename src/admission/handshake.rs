//! Connectionless (out-of-band) messages and userinfo.
//!
//! An out-of-band packet starts with four `0xFF` bytes followed by a text
//! command line:
//!
//! | Direction | Command |
//! |---|---|
//! | user → host | `getchallenge [echo]` |
//! | host → user | `challengeResponse <token> [echo protocol]` |
//! | user → host | `connect "<urlencoded userinfo>"` |
//! | host → user | `connectResponse <token>` |
//! | host → user | `print\n<text>\n` |
//! | either | `disconnect` |

use std::fmt;

use url::form_urlencoded;

use crate::core::{MAX_INFO_STRING, OOB_SEQUENCE};
use crate::sync::{quote, tokenize};

/// Ordered key/value participant description.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserInfo {
    pairs: Vec<(String, String)>,
}

impl UserInfo {
    /// Create an empty userinfo.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an urlencoded string. Later duplicates replace earlier ones.
    pub fn parse(encoded: &str) -> Self {
        let mut info = Self::new();
        for (k, v) in form_urlencoded::parse(encoded.as_bytes()) {
            info.set(k.as_ref(), v.as_ref());
        }
        info
    }

    /// Urlencoded form.
    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish()
    }

    /// Value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set or replace `key`.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_owned(),
            None => self.pairs.push((key.to_owned(), value.to_owned())),
        }
    }

    /// Remove `key`, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let i = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(i).1)
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// True with no keys.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for UserInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// A connectionless message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OobMessage {
    /// Request a challenge token.
    GetChallenge {
        /// Opaque value echoed back by current-protocol hosts.
        echo: Option<String>,
    },
    /// Token issued by the host.
    ChallengeResponse {
        /// Challenge token.
        challenge: i32,
        /// Echoed request value.
        echo: Option<String>,
        /// Host protocol version.
        protocol: Option<i32>,
    },
    /// Request a slot.
    Connect {
        /// Participant description including `challenge`, `protocol`, `qport`.
        userinfo: UserInfo,
    },
    /// Slot granted.
    ConnectResponse {
        /// Challenge the connection is bound to.
        challenge: i32,
    },
    /// Human-readable notice (usually a rejection).
    Print(String),
    /// Tear down.
    Disconnect,
    /// Anything else; ignored.
    Unknown(String),
}

/// True if `packet` is connectionless.
pub fn is_oob(packet: &[u8]) -> bool {
    packet.len() >= 4 && packet[..4] == OOB_SEQUENCE.to_le_bytes()
}

impl OobMessage {
    /// Parse a connectionless packet.
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if !is_oob(packet) {
            return None;
        }
        let text = String::from_utf8_lossy(&packet[4..]);
        let text = text.trim_end_matches('\0');

        if let Some(body) = text.strip_prefix("print\n") {
            return Some(Self::Print(body.trim_end_matches('\n').to_owned()));
        }

        let args = tokenize(text);
        let arg = |i: usize| args.get(i).cloned();
        let num = |i: usize| args.get(i).and_then(|s| s.parse::<i32>().ok());

        let msg = match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("getchallenge") => Self::GetChallenge { echo: arg(1) },
            Some("challengeresponse") => Self::ChallengeResponse {
                challenge: num(1)?,
                echo: arg(2),
                protocol: num(3),
            },
            Some("connect") => {
                let raw = arg(1).unwrap_or_default();
                if raw.len() >= MAX_INFO_STRING {
                    return Some(Self::Unknown("connect".into()));
                }
                Self::Connect {
                    userinfo: UserInfo::parse(&raw),
                }
            }
            Some("connectresponse") => Self::ConnectResponse {
                challenge: num(1)?,
            },
            Some("disconnect") => Self::Disconnect,
            Some(other) => Self::Unknown(other.to_owned()),
            None => return None,
        };
        Some(msg)
    }

    /// Command text without the out-of-band marker.
    pub fn to_text(&self) -> String {
        match self {
            Self::GetChallenge { echo: None } => "getchallenge".into(),
            Self::GetChallenge { echo: Some(e) } => format!("getchallenge {e}"),
            Self::ChallengeResponse {
                challenge,
                echo,
                protocol,
            } => match (echo, protocol) {
                (Some(e), Some(p)) => format!("challengeResponse {challenge} {e} {p}"),
                _ => format!("challengeResponse {challenge}"),
            },
            Self::Connect { userinfo } => format!("connect {}", quote(&userinfo.encode())),
            Self::ConnectResponse { challenge } => format!("connectResponse {challenge}"),
            Self::Print(text) => format!("print\n{text}\n"),
            Self::Disconnect => "disconnect".into(),
            Self::Unknown(text) => text.clone(),
        }
    }

    /// Full connectionless packet.
    pub fn to_packet(&self) -> Vec<u8> {
        let text = self.to_text();
        let mut out = Vec::with_capacity(4 + text.len());
        out.extend_from_slice(&OOB_SEQUENCE.to_le_bytes());
        out.extend_from_slice(text.as_bytes());
        out
    }
}
