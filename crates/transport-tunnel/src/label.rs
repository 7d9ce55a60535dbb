//! Channel labels.
//!
//! A label names one multiplexed sub-channel. Its wire form is the kind token,
//! followed for indexed kinds by `:` and the decimal index: `web:3`, `file:12`,
//! `proxy:8080`. Singleton kinds are the bare token: `ssh`, `keepalive`,
//! `command`. Decoding is strict so that every accepted string is canonical.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TunnelError;

const SEPARATOR: char = ':';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKind {
    Web,
    File,
    Ssh,
    Proxy,
    Keepalive,
    Command,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 6] = [
        ChannelKind::Web,
        ChannelKind::File,
        ChannelKind::Ssh,
        ChannelKind::Proxy,
        ChannelKind::Keepalive,
        ChannelKind::Command,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Web => "web",
            ChannelKind::File => "file",
            ChannelKind::Ssh => "ssh",
            ChannelKind::Proxy => "proxy",
            ChannelKind::Keepalive => "keepalive",
            ChannelKind::Command => "command",
        }
    }

    /// Indexed kinds may have many channels per peer; the rest are singletons.
    pub fn is_indexed(self) -> bool {
        matches!(self, ChannelKind::Web | ChannelKind::File | ChannelKind::Proxy)
    }

    /// Control kinds are owned by the peer itself and never pooled.
    pub fn is_control(self) -> bool {
        matches!(self, ChannelKind::Keepalive | ChannelKind::Command)
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChannelKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| TunnelError::Parse(format!("unknown channel kind {s:?}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    kind: ChannelKind,
    index: u64,
}

impl Label {
    /// Builds a label; the index of a singleton kind is ignored.
    pub fn new(kind: ChannelKind, index: u64) -> Self {
        let index = if kind.is_indexed() { index } else { 0 };
        Self { kind, index }
    }

    pub fn singleton(kind: ChannelKind) -> Self {
        Self::new(kind, 0)
    }

    /// Proxy labels carry the forwarded TCP port as their index.
    pub fn proxy(port: u16) -> Self {
        Self::new(ChannelKind::Proxy, u64::from(port))
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn port(&self) -> Option<u16> {
        match self.kind {
            ChannelKind::Proxy => u16::try_from(self.index).ok(),
            _ => None,
        }
    }
}

pub fn encode(kind: ChannelKind, index: u64) -> String {
    Label::new(kind, index).to_string()
}

pub fn decode(raw: &str) -> Result<(ChannelKind, u64), TunnelError> {
    let label: Label = raw.parse()?;
    Ok((label.kind, label.index))
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_indexed() {
            write!(f, "{}{}{}", self.kind, SEPARATOR, self.index)
        } else {
            f.write_str(self.kind.as_str())
        }
    }
}

impl FromStr for Label {
    type Err = TunnelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (token, index) = match raw.split_once(SEPARATOR) {
            Some((token, digits)) => (token, Some(parse_index(raw, digits)?)),
            None => (raw, None),
        };
        let kind: ChannelKind = token.parse()?;
        match (kind.is_indexed(), index) {
            (true, Some(index)) => Ok(Label { kind, index }),
            (true, None) => Err(TunnelError::Parse(format!(
                "label {raw:?} is missing its index"
            ))),
            (false, None) => Ok(Label::singleton(kind)),
            (false, Some(_)) => Err(TunnelError::Parse(format!(
                "label {raw:?} must not carry an index"
            ))),
        }
    }
}

fn parse_index(raw: &str, digits: &str) -> Result<u64, TunnelError> {
    let canonical = !digits.is_empty()
        && digits.bytes().all(|b| b.is_ascii_digit())
        && (digits == "0" || !digits.starts_with('0'));
    if !canonical {
        return Err(TunnelError::Parse(format!("label {raw:?} has a bad index")));
    }
    digits
        .parse()
        .map_err(|_| TunnelError::Parse(format!("label {raw:?} index out of range")))
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test_timeout::timeout]
    fn wire_forms() {
        assert_eq!(encode(ChannelKind::Web, 3), "web:3");
        assert_eq!(encode(ChannelKind::Proxy, 8080), "proxy:8080");
        assert_eq!(encode(ChannelKind::Ssh, 0), "ssh");
        assert_eq!(encode(ChannelKind::Keepalive, 7), "keepalive");
        assert_eq!(decode("file:12"), Ok((ChannelKind::File, 12)));
        assert_eq!(decode("command"), Ok((ChannelKind::Command, 0)));
        assert_eq!(Label::proxy(22).port(), Some(22));
    }

    #[test_timeout::timeout]
    fn rejects_malformed_labels() {
        for raw in [
            "", "web", "web:", "web:x", "web:-1", "web:+1", "web:01", "ssh:1", "video:2",
            "WEB:1", "web:1:2", "web.1", "web:18446744073709551616",
        ] {
            assert!(
                matches!(raw.parse::<Label>(), Err(TunnelError::Parse(_))),
                "{raw:?} should not parse"
            );
        }
    }

    #[test_timeout::timeout]
    fn serde_uses_wire_string() {
        let json = serde_json::to_string(&Label::new(ChannelKind::Web, 4)).unwrap();
        assert_eq!(json, "\"web:4\"");
        assert!(serde_json::from_str::<Label>("\"web\"").is_err());
    }

    fn any_kind() -> impl Strategy<Value = ChannelKind> {
        prop::sample::select(ChannelKind::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn label_round_trip(kind in any_kind(), index in any::<u64>()) {
            let index = if kind.is_indexed() { index } else { 0 };
            prop_assert_eq!(decode(&encode(kind, index)), Ok((kind, index)));
        }
    }
}
