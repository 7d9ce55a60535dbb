use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{SessionInbox, SessionRegistry, Signaling};
use crate::error::TunnelError;
use crate::proto::{IceCandidate, SdpType, SessionDescription};

const SESSION_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Routes {
    responders: HashMap<String, Weak<MemorySignaling>>,
    initiators: HashMap<String, Weak<MemorySignaling>>,
}

/// In-process relay for tests and same-process tunnels.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    routes: Arc<RwLock<Routes>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the responder of `service`, replacing any earlier one.
    pub fn responder(&self, service: &str) -> Arc<MemorySignaling> {
        let endpoint = MemorySignaling::new(self.clone(), service, SdpType::Answer);
        self.routes
            .write()
            .responders
            .insert(service.to_string(), Arc::downgrade(&endpoint));
        endpoint
    }

    pub fn initiator(&self, service: &str) -> Arc<MemorySignaling> {
        MemorySignaling::new(self.clone(), service, SdpType::Offer)
    }

    fn route(
        &self,
        from: &MemorySignaling,
        session_id: &str,
        sdp: Option<SessionDescription>,
        ice: Option<IceCandidate>,
    ) -> Result<(), TunnelError> {
        let target = {
            let mut routes = self.routes.write();
            match from.side {
                SdpType::Offer => {
                    routes
                        .initiators
                        .insert(session_id.to_string(), from.me.clone());
                    routes.responders.get(&from.service).and_then(Weak::upgrade)
                }
                SdpType::Answer => routes.initiators.get(session_id).and_then(Weak::upgrade),
            }
        };
        let target = target.ok_or_else(|| {
            TunnelError::NotFound(format!("no peer for {}/{session_id}", from.service))
        })?;
        target.receive(session_id, sdp, ice);
        Ok(())
    }

    fn forget(&self, endpoint: &MemorySignaling, session_id: Option<&str>) {
        let mut routes = self.routes.write();
        let is_self = |weak: &Weak<MemorySignaling>| weak.ptr_eq(&endpoint.me);
        match session_id {
            Some(id) => {
                if routes.initiators.get(id).is_some_and(is_self) {
                    routes.initiators.remove(id);
                }
            }
            None => {
                routes.initiators.retain(|_, weak| !is_self(&*weak));
                if routes.responders.get(&endpoint.service).is_some_and(is_self) {
                    routes.responders.remove(&endpoint.service);
                }
            }
        }
    }
}

pub struct MemorySignaling {
    relay: MemoryRelay,
    me: Weak<MemorySignaling>,
    service: String,
    identity: String,
    side: SdpType,
    registry: SessionRegistry,
    incoming_tx: mpsc::UnboundedSender<String>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

impl MemorySignaling {
    fn new(relay: MemoryRelay, service: &str, side: SdpType) -> Arc<Self> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            relay,
            me: me.clone(),
            service: service.to_string(),
            identity: Uuid::new_v4().to_string(),
            side,
            registry: SessionRegistry::new(SESSION_GRACE),
            incoming_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        })
    }

    fn receive(
        &self,
        session_id: &str,
        sdp: Option<SessionDescription>,
        ice: Option<IceCandidate>,
    ) {
        if self.side == SdpType::Answer && !self.registry.contains(session_id) {
            if sdp.is_none() {
                return;
            }
            self.registry.ensure(session_id);
            let _ = self.incoming_tx.send(session_id.to_string());
        }
        if let Some(desc) = sdp {
            self.registry.deliver_description(session_id, desc);
        }
        if let Some(candidate) = ice {
            self.registry.deliver_candidate(session_id, candidate);
        }
    }
}

#[async_trait]
impl Signaling for MemorySignaling {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn service(&self) -> &str {
        &self.service
    }

    async fn send_description(
        &self,
        session_id: &str,
        desc: SessionDescription,
    ) -> Result<(), TunnelError> {
        self.relay.route(self, session_id, Some(desc), None)
    }

    async fn send_candidate(
        &self,
        session_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), TunnelError> {
        self.relay.route(self, session_id, None, Some(candidate))
    }

    fn open_session(&self, session_id: &str) -> Result<SessionInbox, TunnelError> {
        self.registry.take_inbox(session_id)
    }

    async fn notify_offline(&self, session_id: &str) -> Result<(), TunnelError> {
        self.registry.close(session_id);
        self.relay.forget(self, Some(session_id));
        Ok(())
    }

    fn incoming_sessions(&self) -> Option<mpsc::UnboundedReceiver<String>> {
        if self.side != SdpType::Answer {
            return None;
        }
        self.incoming_rx.lock().take()
    }

    fn close(&self) {
        self.registry.close_all();
        self.relay.forget(self, None);
    }
}
