use std::sync::Arc;
use futures::future::BoxFuture;
use log::{debug, info};

use crate::device::types::{Capability, Grant};

/// The host environment's runtime capability store.
pub trait CapabilityHost: Send + Sync + 'static {
    fn has_capability(&self, kind: Capability) -> bool;

    /// Asks the host to grant `kinds`. Resolves exactly once.
    fn request_capabilities(&self, kinds: Vec<Capability>) -> BoxFuture<'static, Grant>;
}

pub enum Authorization {
    Granted,
    Pending(BoxFuture<'static, Grant>),
}

/// Gates radio commands on the capabilities they need.
pub struct PermissionGate<H> {
    host: Arc<H>,
}

impl<H> Clone for PermissionGate<H> {
    fn clone(&self) -> Self {
        PermissionGate { host: self.host.clone() }
    }
}

impl<H: CapabilityHost> PermissionGate<H> {
    pub fn new(host: Arc<H>) -> Self {
        PermissionGate { host }
    }

    pub fn holds(&self, kind: Capability) -> bool {
        self.host.has_capability(kind)
    }

    /// Returns `Granted` right away when everything in `required` is already held, otherwise
    /// issues a single grant request. Denials are not retried.
    pub fn authorize(&self, required: &[Capability]) -> Authorization {
        let missing: Vec<Capability> = required
            .iter()
            .copied()
            .filter(|kind| !self.holds(*kind))
            .collect();

        if missing.is_empty() {
            return Authorization::Granted;
        }

        info!("Requesting capabilities {:?}", missing);
        let request = self.host.request_capabilities(missing);
        Authorization::Pending(Box::pin(async move {
            let grant = request.await;
            debug!("Capability request resolved: {:?}", grant);
            grant
        }))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use futures::FutureExt;
    use futures::channel::oneshot;

    use super::*;

    /// Requests stay pending until `resolve` is called.
    #[derive(Default)]
    pub struct ScriptedHost {
        pub held: Mutex<HashSet<Capability>>,
        pub requests: Mutex<Vec<Vec<Capability>>>,
        pub waiting: Mutex<Vec<oneshot::Sender<Grant>>>,
    }

    impl ScriptedHost {
        pub fn granting_all() -> Self {
            let host = ScriptedHost::default();
            host.grant(Capability::Scan);
            host.grant(Capability::Connect);
            host
        }

        pub fn grant(&self, kind: Capability) {
            self.held.lock().unwrap().insert(kind);
        }

        pub fn revoke(&self, kind: Capability) {
            self.held.lock().unwrap().remove(&kind);
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        /// Resolves the oldest outstanding request.
        pub fn resolve(&self, grant: Grant) {
            let sender = self.waiting.lock().unwrap().remove(0);
            if grant == Grant::Granted {
                for kinds in self.requests.lock().unwrap().iter() {
                    for kind in kinds {
                        self.grant(*kind);
                    }
                }
            }
            let _ = sender.send(grant);
        }
    }

    impl CapabilityHost for ScriptedHost {
        fn has_capability(&self, kind: Capability) -> bool {
            self.held.lock().unwrap().contains(&kind)
        }

        fn request_capabilities(&self, kinds: Vec<Capability>) -> BoxFuture<'static, Grant> {
            let (tx, rx) = oneshot::channel();
            self.requests.lock().unwrap().push(kinds);
            self.waiting.lock().unwrap().push(tx);
            rx.map(|result| result.unwrap_or(Grant::Denied)).boxed()
        }
    }
}
