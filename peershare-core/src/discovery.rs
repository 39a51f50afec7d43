//! Discovery gateway over the routing layer: announce identifiers, find providers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::cid::ContentId;
use crate::identity::{PeerDescriptor, PeerId};
use crate::transport::{ContentRouting, ProviderRecord};

pub struct DiscoveryGateway {
    routing: Arc<dyn ContentRouting>,
    local: PeerDescriptor,
}

impl DiscoveryGateway {
    pub fn new(routing: Arc<dyn ContentRouting>, local_peer: PeerId, addrs: Vec<String>) -> Self {
        Self {
            routing,
            local: PeerDescriptor::local(local_peer, addrs),
        }
    }

    /// Descriptor of this node.
    pub fn local_peer(&self) -> &PeerDescriptor {
        &self.local
    }

    /// Tell the routing layer this node answers for `identifier`. Failures are logged only.
    pub async fn announce(&self, identifier: &ContentId) {
        match self.routing.provide(&identifier.to_bytes()).await {
            Ok(()) => tracing::debug!(identifier = %identifier, "announced"),
            Err(err) => {
                tracing::warn!(identifier = %identifier, error = %err, "announce failed")
            }
        }
    }

    /// Providers of `identifier`, excluding this node, for at most `timeout`.
    /// A routing error yields an empty result rather than an error.
    pub async fn find_providers(&self, identifier: &ContentId, timeout: Duration) -> Providers {
        let deadline = Instant::now() + timeout;
        let lookup = tokio::time::timeout_at(
            deadline,
            self.routing.find_providers(&identifier.to_bytes()),
        )
        .await;
        let rx = match lookup {
            Ok(Ok(rx)) => Some(rx),
            Ok(Err(err)) => {
                tracing::warn!(identifier = %identifier, error = %err, "provider lookup failed");
                None
            }
            Err(_) => {
                tracing::info!(identifier = %identifier, "provider lookup timed out");
                None
            }
        };
        Providers {
            rx,
            deadline,
            local: self.local.id,
            identifier: *identifier,
        }
    }
}

/// Lazily received providers. Ends when the routing layer is done or the deadline passes.
pub struct Providers {
    rx: Option<mpsc::Receiver<ProviderRecord>>,
    deadline: Instant,
    local: PeerId,
    identifier: ContentId,
}

impl Providers {
    pub async fn next(&mut self) -> Option<PeerDescriptor> {
        loop {
            let rx = self.rx.as_mut()?;
            match tokio::time::timeout_at(self.deadline, rx.recv()).await {
                Ok(Some(record)) if record.peer == self.local => continue,
                Ok(Some(record)) => {
                    return Some(PeerDescriptor {
                        addrs: record.addrs,
                        ..PeerDescriptor::remote(record.peer)
                    })
                }
                Ok(None) => {
                    self.rx = None;
                    return None;
                }
                Err(_) => {
                    tracing::info!(identifier = %self.identifier, "provider lookup timed out");
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Drain into a list (waits for the lookup to finish or time out).
    pub async fn collect(mut self) -> Vec<PeerDescriptor> {
        let mut out = Vec::new();
        while let Some(peer) = self.next().await {
            out.push(peer);
        }
        out
    }
}
