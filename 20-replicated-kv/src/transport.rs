//! Outbound RPCs from one replica to its peers.
//!
//! [`HttpTransport`] talks JSON over HTTP to the routes in [`crate::api`].
//! [`LocalNetwork`] wires replicas of one process together directly and can
//! cut replicas off, which is how the cluster tests simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::message::{ReplicateAck, ReplicateKind, ReplicateRequest, VoteRequest, VoteResponse};
use crate::replica::Replica;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("request to {peer} failed: {source}")]
    Http {
        peer: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{peer} answered with status {status}")]
    Status { peer: String, status: u16 },
    #[error("{0} is unreachable")]
    Unreachable(String),
    #[error("{peer} refused the request: {reason}")]
    Refused { peer: String, reason: String },
}

/// Sends vote and replicate requests to a named peer.
///
/// The returned futures own everything they need so callers can fan them
/// out without borrowing the transport.
pub trait Transport: Send + Sync {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse, TransportError>>;

    fn replicate(
        &self,
        peer: &str,
        kind: ReplicateKind,
        request: ReplicateRequest,
    ) -> BoxFuture<'static, Result<ReplicateAck, TransportError>>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn post<Req, Resp>(&self, peer: &str, path: String, body: Req) -> BoxFuture<'static, Result<Resp, TransportError>>
    where
        Req: serde::Serialize + Send + 'static,
        Resp: serde::de::DeserializeOwned + Send + 'static,
    {
        let client = self.client.clone();
        let peer = peer.to_owned();
        let url = format!("http://{peer}{path}");
        async move {
            let response = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|source| TransportError::Http { peer: peer.clone(), source })?;

            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Status {
                    peer,
                    status: status.as_u16(),
                });
            }
            response
                .json::<Resp>()
                .await
                .map_err(|source| TransportError::Http { peer, source })
        }
        .boxed()
    }
}

impl Transport for HttpTransport {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse, TransportError>> {
        self.post(peer, "/vote".to_owned(), request)
    }

    fn replicate(
        &self,
        peer: &str,
        kind: ReplicateKind,
        request: ReplicateRequest,
    ) -> BoxFuture<'static, Result<ReplicateAck, TransportError>> {
        self.post(peer, format!("/replicate/{kind}"), request)
    }
}

#[derive(Default)]
struct Registry {
    replicas: HashMap<String, Weak<Replica>>,
    isolated: HashSet<String>,
}

/// In-process network shared by replicas of one test cluster.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, replica: &Arc<Replica>) {
        self.registry()
            .replicas
            .insert(replica.addr().to_owned(), Arc::downgrade(replica));
    }

    /// Drops all traffic to and from `addr` until [`LocalNetwork::heal`].
    pub fn isolate(&self, addr: &str) {
        self.registry().isolated.insert(addr.to_owned());
    }

    pub fn heal(&self, addr: &str) {
        self.registry().isolated.remove(addr);
    }

    /// Transport used by the replica at `from`.
    pub fn transport_for(&self, from: &str) -> LocalTransport {
        LocalTransport {
            from: from.to_owned(),
            network: self.clone(),
        }
    }

    fn route(&self, from: &str, to: &str) -> Result<Arc<Replica>, TransportError> {
        let registry = self.registry();
        if registry.isolated.contains(from) || registry.isolated.contains(to) {
            return Err(TransportError::Unreachable(to.to_owned()));
        }
        registry
            .replicas
            .get(to)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(to.to_owned()))
    }
}

#[derive(Clone)]
pub struct LocalTransport {
    from: String,
    network: LocalNetwork,
}

impl Transport for LocalTransport {
    fn request_vote(
        &self,
        peer: &str,
        request: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse, TransportError>> {
        let target = self.network.route(&self.from, peer);
        async move { Ok::<_, TransportError>(target?.handle_vote_request(request).await) }.boxed()
    }

    fn replicate(
        &self,
        peer: &str,
        kind: ReplicateKind,
        request: ReplicateRequest,
    ) -> BoxFuture<'static, Result<ReplicateAck, TransportError>> {
        let target = self.network.route(&self.from, peer);
        let peer = peer.to_owned();
        async move {
            target?
                .handle_replicate(kind, request)
                .await
                .map_err(|err| TransportError::Refused {
                    peer,
                    reason: err.to_string(),
                })
        }
        .boxed()
    }
}
