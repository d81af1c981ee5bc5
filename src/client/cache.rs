use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use super::protocol::{CacheStats, RouterStats};
use crate::config::RouterConfig;
use crate::dispatch::dispatcher::OperationDispatcher;
use crate::dispatch::protocol::Response;
use crate::dispatch::retry::RetryCoordinator;
use crate::dispatch::transport::Transport;
use crate::dispatch::types::{Operation, OperationKind};
use crate::error::{Result, RouterError};
use crate::scan::coordinator::{ScanCoordinator, ScanStream};
use crate::scan::types::ScanOptions;
use crate::topology::protocol::TopologyUpdate;
use crate::topology::registry::TopologyRegistry;

/// Entry point of the routing layer.
///
/// Owns the topology registry and wires it into the dispatcher and both coordinators, so
/// every component sees the same snapshots. Typed access goes through [`RemoteCache`].
pub struct Router {
    config: RouterConfig,
    registry: Arc<TopologyRegistry>,
    dispatcher: Arc<OperationDispatcher>,
    retry: RetryCoordinator,
    scans: ScanCoordinator,
}

impl Router {
    pub fn new(config: RouterConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        config.validate()?;
        let registry = TopologyRegistry::new();
        let dispatcher = Arc::new(OperationDispatcher::new(&config, registry.clone(), transport));
        let retry = RetryCoordinator::new(
            dispatcher.clone(),
            config.max_retries,
            config.topology_refresh_timeout,
        );
        let scans = ScanCoordinator::new(dispatcher.clone(), &config);

        tracing::info!(
            servers = config.initial_servers.len(),
            intelligence = ?config.intelligence,
            max_retries = config.max_retries,
            "Router ready"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            dispatcher,
            retry,
            scans,
        }))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TopologyRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<OperationDispatcher> {
        &self.dispatcher
    }

    /// Called by the membership collaborator whenever the cluster announces a layout.
    pub fn on_topology_push(&self, cache: &str, update: TopologyUpdate) -> Result<bool> {
        self.dispatcher.on_topology_push(cache, update)
    }

    pub async fn execute(&self, operation: &Operation) -> Result<Response> {
        self.retry.execute(operation).await
    }

    pub fn scan(&self, cache: &str, options: ScanOptions) -> ScanStream {
        self.scans.scan(cache, options)
    }

    pub fn cache<K, V>(self: &Arc<Self>, name: &str) -> RemoteCache<K, V> {
        RemoteCache {
            name: name.to_string(),
            router: self.clone(),
            _types: PhantomData,
        }
    }

    pub fn stats(&self) -> RouterStats {
        let mut names = self.registry.cache_names();
        names.sort();
        RouterStats {
            retries: self.dispatcher.retries(),
            pending_dispatches: self.registry.pending_count(),
            caches: names
                .into_iter()
                .map(|name| CacheStats {
                    topology: self.registry.cache_topology_info(&name),
                    name,
                })
                .collect(),
        }
    }
}

/// Typed view of one named cache, values stored as JSON.
pub struct RemoteCache<K, V> {
    name: String,
    router: Arc<Router>,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Clone for RemoteCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            router: self.router.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> RemoteCache<K, V>
where
    K: ToString + FromStr,
    <K as FromStr>::Err: std::fmt::Display,
    V: Serialize + DeserializeOwned,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        let operation = Operation::new(&self.name, OperationKind::Get, key.to_string());
        self.value_of(self.router.execute(&operation).await?)
    }

    /// Stores `value` and returns the value it replaced.
    pub async fn put(&self, key: K, value: &V) -> Result<Option<V>> {
        let value_json = serde_json::to_string(value)?;
        let operation =
            Operation::new(&self.name, OperationKind::Put, key.to_string()).with_value(value_json);
        self.value_of(self.router.execute(&operation).await?)
    }

    /// Removes a key and returns its last value.
    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        let operation = Operation::new(&self.name, OperationKind::Remove, key.to_string());
        self.value_of(self.router.execute(&operation).await?)
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        let operation = Operation::new(&self.name, OperationKind::ContainsKey, key.to_string());
        match self.router.execute(&operation).await? {
            Response::Flag { value } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Raw entry stream over the cache.
    pub fn scan(&self, options: ScanOptions) -> ScanStream {
        self.router.scan(&self.name, options)
    }

    /// Every entry of the cache, decoded.
    pub async fn entries(&self, options: ScanOptions) -> Result<Vec<(K, V)>> {
        let mut stream = self.scan(options);
        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await {
            let entry = entry?;
            let key = entry.key.parse::<K>().map_err(|e| {
                RouterError::Serialization(format!("invalid key '{}': {}", entry.key, e))
            })?;
            entries.push((key, serde_json::from_str(&entry.value_json)?));
        }
        Ok(entries)
    }

    fn value_of(&self, response: Response) -> Result<Option<V>> {
        match response {
            Response::Value { value_json: None } => Ok(None),
            Response::Value {
                value_json: Some(json),
            } => Ok(Some(serde_json::from_str(&json)?)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> RouterError {
    RouterError::Serialization(format!("unexpected response: {:?}", response))
}
