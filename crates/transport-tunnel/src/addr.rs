use std::fmt;

use crate::label::Label;

pub const NETWORK: &str = "webrtc";

/// Address of one end of a tunnelled stream: the identity of the party plus
/// the label of the channel, when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelAddr {
    identity: String,
    label: Option<Label>,
}

impl TunnelAddr {
    pub fn new(identity: impl Into<String>, label: Label) -> Self {
        Self {
            identity: identity.into(),
            label: Some(label),
        }
    }

    /// Address of a listening service, which has no channel label.
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            identity: name.into(),
            label: None,
        }
    }

    pub fn network(&self) -> &'static str {
        NETWORK
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn label(&self) -> Option<Label> {
        self.label
    }
}

impl fmt::Display for TunnelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{}/{}", self.identity, label),
            None => f.write_str(&self.identity),
        }
    }
}

/// The two identities a peer derives channel addresses from. An initiator is
/// known by the client id the relay registered it under, which is its session
/// id, and talks to a service name; a responder is the reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    local: String,
    remote: String,
}

impl Endpoints {
    pub fn initiator(client_id: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            local: client_id.into(),
            remote: service.into(),
        }
    }

    pub fn responder(service: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            local: service.into(),
            remote: client_id.into(),
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn addrs(&self, label: Label) -> (TunnelAddr, TunnelAddr) {
        (
            TunnelAddr::new(self.local.clone(), label),
            TunnelAddr::new(self.remote.clone(), label),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::ChannelKind;

    #[test_timeout::timeout]
    fn sides_see_mirrored_addresses() {
        let label = Label::new(ChannelKind::Web, 2);
        let (init_local, init_remote) = Endpoints::initiator("c-1", "svc").addrs(label);
        let (resp_local, resp_remote) = Endpoints::responder("svc", "c-1").addrs(label);

        assert_eq!(init_local, resp_remote);
        assert_eq!(init_remote, resp_local);
        assert_eq!(init_local.to_string(), "c-1/web:2");
        assert_eq!(init_remote.network(), "webrtc");
        assert_eq!(TunnelAddr::service("svc").to_string(), "svc");
    }
}
