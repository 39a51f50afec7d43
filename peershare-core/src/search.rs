//! Provider search: discover peers for a name and ask each of them what they share,
//! with a cap on outstanding queries and a timeout per query.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cid::ContentId;
use crate::discovery::DiscoveryGateway;
use crate::identity::{PeerDescriptor, PeerId};
use crate::protocol::{FileRecord, Message};
use crate::rpc::{RpcEngine, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchConfig {
    /// Most peer queries in flight at once.
    pub max_concurrent: usize,
    pub query_timeout: Duration,
    pub providers_timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            query_timeout: Duration::from_secs(10),
            providers_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOutcome {
    Found(Vec<FileRecord>),
    /// Placeholder for a provider that failed or timed out.
    Unreachable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderResult {
    pub peer: PeerDescriptor,
    pub outcome: ProviderOutcome,
}

pub struct Search {
    rpc: Arc<RpcEngine>,
    discovery: Arc<DiscoveryGateway>,
    config: SearchConfig,
}

impl Search {
    pub fn new(rpc: Arc<RpcEngine>, discovery: Arc<DiscoveryGateway>, config: SearchConfig) -> Self {
        Self {
            rpc,
            discovery,
            config,
        }
    }

    /// One result per provider found for `name`, in completion order.
    pub async fn search_files(&self, name: &str) -> Vec<ProviderResult> {
        let identifier = ContentId::from_name(name);
        let mut providers = self
            .discovery
            .find_providers(&identifier, self.config.providers_timeout)
            .await;
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        while let Some(peer) = providers.next().await {
            let Ok(permit) = limit.clone().acquire_owned().await else {
                break;
            };
            let rpc = self.rpc.clone();
            let query = name.to_string();
            let timeout = self.config.query_timeout;
            tasks.spawn(async move {
                let outcome = query_provider(&rpc, &peer.id, query, timeout).await;
                drop(permit);
                ProviderResult { peer, outcome }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(err) => tracing::warn!(error = %err, "provider query task failed"),
            }
        }
        tracing::info!(name, providers = results.len(), "search finished");
        results
    }

    /// Metadata of one remote file, or `None` if the peer answered with no record.
    pub async fn file_info(&self, peer: &PeerId, file_id: u64) -> Result<Option<FileRecord>, RpcError> {
        let request = Message::GetFile { file_id };
        let response = tokio::time::timeout(self.config.query_timeout, self.rpc.request(peer, &request))
            .await
            .map_err(|_| {
                RpcError::PeerUnreachable(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "file info request timed out",
                ))
            })??;
        match response {
            Message::FileInfo { files } => Ok(files.into_iter().next()),
            other => Err(RpcError::RemoteProtocolError(format!(
                "unexpected answer to GetFile: {:?}",
                other.kind()
            ))),
        }
    }
}

async fn query_provider(
    rpc: &RpcEngine,
    peer: &PeerId,
    query: String,
    timeout: Duration,
) -> ProviderOutcome {
    let request = Message::FindFile { query };
    match tokio::time::timeout(timeout, rpc.request(peer, &request)).await {
        Ok(Ok(Message::FoundFiles { files })) => ProviderOutcome::Found(files),
        Ok(Ok(other)) => {
            ProviderOutcome::Unreachable(format!("unexpected answer: {:?}", other.kind()))
        }
        Ok(Err(err)) => {
            tracing::debug!(peer = %peer, error = %err, "provider query failed");
            ProviderOutcome::Unreachable(err.to_string())
        }
        Err(_) => {
            tracing::debug!(peer = %peer, "provider query timed out");
            ProviderOutcome::Unreachable("timed out".into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerError, HandlerRegistry, MessageHandler, Reply, SharedFile};
    use crate::memory::{MemoryCatalog, MemoryNetwork, MemoryTransport};
    use crate::protocol::MessageKind;
    use crate::transport::Transport;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("peershare-search-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct Node {
        transport: MemoryTransport,
        rpc: Arc<RpcEngine>,
        discovery: Arc<DiscoveryGateway>,
    }

    fn node(net: &MemoryNetwork, files: Vec<SharedFile>) -> Node {
        node_with(net, files, None)
    }

    /// Like `node`, with `find` answering FindFile instead of the catalog.
    fn node_with(
        net: &MemoryNetwork,
        files: Vec<SharedFile>,
        find: Option<Arc<dyn MessageHandler>>,
    ) -> Node {
        let transport = net.join();
        let mut registry = HandlerRegistry::with_catalog(Arc::new(MemoryCatalog::new(files)));
        if let Some(find) = find {
            registry.register(MessageKind::FindFile, find);
        }
        let rpc = Arc::new(RpcEngine::new(Arc::new(transport.clone()), registry));
        rpc.register();
        let discovery = Arc::new(DiscoveryGateway::new(
            Arc::new(transport.clone()),
            transport.local_peer(),
            transport.listen_addrs(),
        ));
        Node {
            transport,
            rpc,
            discovery,
        }
    }

    fn shared(id: u64, name: &str, path: PathBuf) -> SharedFile {
        SharedFile {
            id,
            identifier: ContentId::from_name(name),
            path,
            advertised_path: format!("{name}.txt"),
            mime: "text/plain".into(),
            checksum: "abc123".into(),
            size: 4,
            valid: true,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn unreachable_provider_does_not_abort_search() {
        let dir = temp_dir("fanout");
        let file = dir.join("foo.txt");
        std::fs::write(&file, b"data").unwrap();
        let net = MemoryNetwork::new();
        let me = node(&net, vec![]);
        let good = node(&net, vec![shared(1, "foo", file.clone())]);
        let gone = node(&net, vec![shared(1, "foo", file)]);
        good.discovery.announce(&ContentId::from_name("foo")).await;
        gone.discovery.announce(&ContentId::from_name("foo")).await;
        // Still advertised, but no longer answers.
        gone.transport.handle(crate::protocol::PROTOCOL_ID, Arc::new(Refuse));

        let search = Search::new(me.rpc.clone(), me.discovery.clone(), SearchConfig::default());
        let results = search.search_files("foo").await;
        assert_eq!(results.len(), 2);
        let found: Vec<_> = results
            .iter()
            .filter(|r| matches!(r.outcome, ProviderOutcome::Found(ref f) if f.len() == 1))
            .collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peer.id, good.transport.local_peer());
        assert!(results
            .iter()
            .any(|r| matches!(r.outcome, ProviderOutcome::Unreachable(_))));

        let info = search
            .file_info(&good.transport.local_peer(), 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.checksum, "abc123");
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn search_without_providers_is_empty() {
        let net = MemoryNetwork::new();
        let me = node(&net, vec![]);
        let search = Search::new(me.rpc.clone(), me.discovery.clone(), SearchConfig::default());
        assert!(search.search_files("nothing").await.is_empty());
    }

    fn record(id: u64) -> FileRecord {
        FileRecord {
            id,
            path: "foo.txt".into(),
            mime: "text/plain".into(),
            checksum: "abc123".into(),
            size: 4,
            created_at: 0,
            updated_at: 0,
        }
    }

    /// Counts FindFile calls in flight and holds each until `release` fires.
    struct Parked {
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        release: Arc<Notify>,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Parked {
        async fn handle(&self, _remote: PeerId, _msg: Message) -> Result<Reply, HandlerError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(Reply::Single(Message::FoundFiles { files: vec![record(1)] }))
        }
    }

    /// Answers FindFile with one record, or never when `hang` is set.
    struct Answer {
        hang: bool,
    }

    #[async_trait::async_trait]
    impl MessageHandler for Answer {
        async fn handle(&self, _remote: PeerId, _msg: Message) -> Result<Reply, HandlerError> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(Reply::Single(Message::FoundFiles { files: vec![record(1)] }))
        }
    }

    #[tokio::test]
    async fn queries_in_flight_never_exceed_the_limit() {
        let net = MemoryNetwork::new();
        let me = node(&net, vec![]);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());
        let mut providers = Vec::new();
        for _ in 0..5 {
            let handler = Arc::new(Parked {
                in_flight: in_flight.clone(),
                peak: peak.clone(),
                release: release.clone(),
            });
            let provider = node_with(&net, vec![], Some(handler));
            provider.discovery.announce(&ContentId::from_name("foo")).await;
            providers.push(provider);
        }

        let config = SearchConfig {
            max_concurrent: 2,
            query_timeout: Duration::from_secs(30),
            providers_timeout: Duration::from_secs(5),
        };
        let search = Search::new(me.rpc.clone(), me.discovery.clone(), config);
        let running = tokio::spawn(async move { search.search_files("foo").await });

        let started = tokio::time::Instant::now();
        while in_flight.load(Ordering::SeqCst) < 2 {
            assert!(started.elapsed() < Duration::from_secs(5), "queries never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 2);

        while !running.is_finished() {
            release.notify_waiters();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let results = running.await.unwrap();
        assert_eq!(results.len(), 5);
        assert!(results
            .iter()
            .all(|r| matches!(r.outcome, ProviderOutcome::Found(ref f) if f.len() == 1)));
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_provider_times_out_while_others_answer() {
        let net = MemoryNetwork::new();
        let me = node(&net, vec![]);
        let fast = node_with(&net, vec![], Some(Arc::new(Answer { hang: false })));
        let slow = node_with(&net, vec![], Some(Arc::new(Answer { hang: false })));
        let silent = node_with(&net, vec![], Some(Arc::new(Answer { hang: true })));
        for provider in [&fast, &slow, &silent] {
            provider.discovery.announce(&ContentId::from_name("foo")).await;
        }

        let config = SearchConfig {
            max_concurrent: 4,
            query_timeout: Duration::from_secs(3),
            providers_timeout: Duration::from_secs(1),
        };
        let search = Search::new(me.rpc.clone(), me.discovery.clone(), config);
        let results = search.search_files("foo").await;
        assert_eq!(results.len(), 3);
        for result in &results {
            if result.peer.id == silent.transport.local_peer() {
                assert_eq!(
                    result.outcome,
                    ProviderOutcome::Unreachable("timed out".into())
                );
            } else {
                assert_eq!(result.outcome, ProviderOutcome::Found(vec![record(1)]));
            }
        }
    }

    /// Drops every inbound stream unanswered.
    struct Refuse;

    #[async_trait::async_trait]
    impl crate::transport::StreamHandler for Refuse {
        async fn on_stream(&self, _remote: PeerId, _stream: crate::transport::BoxedStream) {}
    }
}
