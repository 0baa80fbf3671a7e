//! Mock Cluster
//!
//! An in-memory [`Broker`] standing in for a cluster of cache servers.
//! Every server runs an [`InMemoryEngine`]; a key lives on the server its
//! hash selects, and servers forward keyed commands to the owner the way a
//! real cluster does.
//!
//! ```text
//!   Request ──▶ journal ──▶ fault plan? ──▶ per command
//!                                           ├── keyed      → owner engine(s)
//!                                           ├── Server(s)  → engine s only (pooled broadcast)
//!                                           └── Any / dedicated → every engine, one response each
//! ```
//!
//! Tests drive it through:
//! - `fail_next` to inject server faults ahead of execution
//! - `journal` to observe routing, targets, view tags and key lists
//! - `drop_server` / `restore_server` to raise connection events

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::inproc::InprocCache;
use super::memory_engine::InMemoryEngine;
use crate::config::ClientConfig;
use crate::domain::events::Notification;
use crate::domain::messaging::MessageAcks;
use crate::domain::options::PollResult;
use crate::domain::ports::{
    Broker, BrokerListener, CacheEngine, CacheStrategy, KeyRouter, NotificationSink, ServerAddress,
};
use crate::error::{Error, Result, ServerFault};
use crate::remote::command::{
    Command, CommandResponse, Request, Response, ResponseBody, Routing, Target,
};
use crate::remote::distribution::ViewIdTag;

/// One command as the cluster saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct JournaledCommand {
    pub name: &'static str,
    pub target: Target,
    pub view: ViewIdTag,
    pub keys: Option<Vec<String>>,
}

/// One request as the cluster saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub request_id: u64,
    pub routing: Routing,
    pub commands: Vec<JournaledCommand>,
}

struct MockServer {
    address: ServerAddress,
    engine: Arc<InMemoryEngine>,
    cache: InprocCache,
}

/// Forwards a server engine's notifications to the cluster listener.
struct ServerSink {
    cluster: Weak<MockCluster>,
}

impl NotificationSink for ServerSink {
    fn notify(&self, notification: Notification) {
        if let Some(cluster) = self.cluster.upgrade() {
            cluster.emit(notification);
        }
    }
}

/// In-memory multi-server broker with fault injection.
pub struct MockCluster {
    servers: Vec<MockServer>,
    links: DashMap<ServerAddress, bool>,
    has_map: AtomicBool,
    view_id: AtomicU64,
    faults: Mutex<VecDeque<ServerFault>>,
    latency: Mutex<Option<Duration>>,
    journal: Mutex<Vec<JournalEntry>>,
    listener: Mutex<Option<Weak<dyn BrokerListener>>>,
}

fn fnv1a(key: &str) -> u64 {
    key.bytes().fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn respond(server: &MockServer, result: Result<ResponseBody>) -> CommandResponse {
    match result {
        Ok(body) => CommandResponse::ok(server.address.clone(), body),
        Err(e) => CommandResponse::fault(server.address.clone(), ServerFault::from(e)),
    }
}

/// Run `$body` once per owning server with that server's share of `$keys`.
macro_rules! per_owner {
    ($self:ident, $keys:expr, |$server:ident, $ks:ident, $pos:ident| $body:expr) => {{
        let keys: &[String] = $keys;
        let mut out = Vec::new();
        for ($server, $pos) in $self.group(keys) {
            let $ks: Vec<String> = $pos.iter().map(|i| keys[*i].clone()).collect();
            out.push(respond($server, $body));
        }
        out
    }};
}

/// Run `$body` once per server in scope.
macro_rules! per_server {
    ($scope:expr, |$server:ident| $body:expr) => {{
        let mut out = Vec::new();
        for $server in $scope {
            out.push(respond($server, $body));
        }
        out
    }};
}

impl MockCluster {
    /// Cluster of `size` servers, all connected, distribution map on.
    pub fn new(size: usize) -> Arc<Self> {
        let size = size.max(1);
        let cluster = Arc::new_cyclic(|me: &Weak<MockCluster>| {
            let servers = (0..size)
                .map(|i| {
                    let address = ServerAddress::new(format!("10.0.0.{}:9800", i + 1));
                    let engine = Arc::new(InMemoryEngine::with_address(
                        format!("mock-{}", i + 1),
                        address.clone(),
                    ));
                    let sink: Arc<dyn NotificationSink> = Arc::new(ServerSink {
                        cluster: me.clone(),
                    });
                    let shared: Arc<dyn CacheEngine> = engine.clone();
                    let cache = InprocCache::new(address.as_str(), shared, ClientConfig::default(), sink);
                    MockServer {
                        address,
                        engine,
                        cache,
                    }
                })
                .collect::<Vec<_>>();
            let links = servers.iter().map(|s| (s.address.clone(), true)).collect();
            Self {
                servers,
                links,
                has_map: AtomicBool::new(true),
                view_id: AtomicU64::new(1),
                faults: Mutex::new(VecDeque::new()),
                latency: Mutex::new(None),
                journal: Mutex::new(Vec::new()),
                listener: Mutex::new(None),
            }
        });
        info!(servers = size, "Mock cluster started");
        cluster
    }

    pub fn servers(&self) -> Vec<ServerAddress> {
        self.servers.iter().map(|s| s.address.clone()).collect()
    }

    /// Engine behind `server`.
    pub fn engine(&self, server: &ServerAddress) -> Option<Arc<InMemoryEngine>> {
        self.server(server).map(|s| Arc::clone(&s.engine))
    }

    /// Server that stores `key`, whether or not the client holds a map.
    pub fn owner_of(&self, key: &str) -> ServerAddress {
        self.owner(key).address.clone()
    }

    pub fn set_distribution_map(&self, enabled: bool) {
        self.has_map.store(enabled, Ordering::SeqCst);
    }

    pub fn set_view_id(&self, view_id: u64) {
        self.view_id.store(view_id, Ordering::SeqCst);
    }

    /// Delay every request by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Answer the next `times` requests with `fault` instead of executing them.
    pub fn fail_next(&self, fault: ServerFault, times: usize) {
        let mut faults = self.faults.lock();
        for _ in 0..times {
            faults.push_back(fault.clone());
        }
    }

    pub fn journal(&self) -> Vec<JournalEntry> {
        self.journal.lock().clone()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    /// Mark `server` disconnected and tell the listener.
    pub fn drop_server(&self, server: &ServerAddress) {
        self.links.insert(server.clone(), false);
        debug!(server = %server, "Mock server dropped");
        if let Some(listener) = self.listener() {
            listener.connection_lost(server);
        }
    }

    /// Mark `server` connected again and tell the listener.
    pub fn restore_server(&self, server: &ServerAddress) {
        self.links.insert(server.clone(), true);
        debug!(server = %server, "Mock server restored");
        if let Some(listener) = self.listener() {
            listener.connection_restored(server);
        }
    }

    /// Push a notification to the client as if a server sent it.
    pub fn emit(&self, notification: Notification) {
        if let Some(listener) = self.listener() {
            listener.notification(notification);
        }
    }

    fn listener(&self) -> Option<Arc<dyn BrokerListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    fn server(&self, address: &ServerAddress) -> Option<&MockServer> {
        self.servers.iter().find(|s| &s.address == address)
    }

    fn owner(&self, key: &str) -> &MockServer {
        &self.servers[(fnv1a(key) % self.servers.len() as u64) as usize]
    }

    /// Positions of `keys` grouped by owning server.
    fn group(&self, keys: &[String]) -> Vec<(&MockServer, Vec<usize>)> {
        let mut by_index: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (pos, key) in keys.iter().enumerate() {
            let index = (fnv1a(key) % self.servers.len() as u64) as usize;
            by_index.entry(index).or_default().push(pos);
        }
        by_index
            .into_iter()
            .map(|(index, positions)| (&self.servers[index], positions))
            .collect()
    }

    fn record(&self, request: &Request) {
        let commands = request
            .commands
            .iter()
            .map(|c| JournaledCommand {
                name: c.command.name(),
                target: c.target.clone(),
                view: c.view,
                keys: c.command.keys().map(<[String]>::to_vec),
            })
            .collect();
        self.journal.lock().push(JournalEntry {
            request_id: request.id,
            routing: request.routing,
            commands,
        });
    }

    /// Servers a cluster-wide command runs on.
    fn scope(&self, routing: Routing, target: &Target) -> Vec<&MockServer> {
        match (routing, target) {
            (Routing::Pooled, Target::Server(address)) => self.server(address).into_iter().collect(),
            _ => self.servers.iter().collect(),
        }
    }

    fn named(&self, routing: Routing, target: &Target) -> Result<&MockServer> {
        match target {
            Target::Server(address) => self.server(address).ok_or_else(|| Error::ConnectionLost {
                server: address.to_string(),
            }),
            _ => self
                .scope(routing, target)
                .into_iter()
                .next()
                .ok_or(Error::NoServerAvailable),
        }
    }

    async fn run(&self, routing: Routing, target: &Target, command: Command) -> Result<Vec<CommandResponse>> {
        let scope = self.scope(routing, target);
        let responses = match command {
            // ---------------------------------------------------------------
            // Keyed
            // ---------------------------------------------------------------
            Command::Add { key, item, opts } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.add(&key, &item, &opts).await.map(ResponseBody::Version))]
            }
            Command::Insert { key, item, opts } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.insert(&key, &item, &opts).await.map(ResponseBody::Version))]
            }
            Command::BulkAdd { keys, items, opts } => per_owner!(self, &keys, |server, ks, pos| {
                let its: Vec<_> = pos.iter().map(|i| items[*i].clone()).collect();
                server.cache.add_bulk(&ks, &its, &opts).await.map(ResponseBody::BulkWrite)
            }),
            Command::BulkInsert { keys, items, opts } => per_owner!(self, &keys, |server, ks, pos| {
                let its: Vec<_> = pos.iter().map(|i| items[*i].clone()).collect();
                server.cache.insert_bulk(&ks, &its, &opts).await.map(ResponseBody::BulkWrite)
            }),
            Command::Get { key, opts } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.get(&key, &opts).await.map(ResponseBody::Value))]
            }
            Command::BulkGet { keys, flags } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.get_bulk(&ks, flags).await.map(ResponseBody::BulkValues)
            }),
            Command::GetCacheItem { key, opts } => {
                let server = self.owner(&key);
                let result = server.cache.get_cache_item(&key, &opts).await;
                vec![respond(server, result.map(|item| ResponseBody::Item(Box::new(item))))]
            }
            Command::BulkGetCacheItem { keys, flags } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.get_cache_item_bulk(&ks, flags).await.map(ResponseBody::Items)
            }),
            Command::Remove { key, opts } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.remove(&key, &opts).await.map(ResponseBody::Removed))]
            }
            Command::Delete { key, opts } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.delete(&key, &opts).await.map(|_| ResponseBody::Empty))]
            }
            Command::BulkRemove { keys, opts } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.remove_bulk(&ks, &opts).await.map(ResponseBody::RemovedBulk)
            }),
            Command::BulkDelete { keys, opts } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.delete_bulk(&ks, &opts).await.map(|_| ResponseBody::Empty)
            }),
            Command::Contains { keys } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.contains_bulk(&ks).await.map(ResponseBody::Found)
            }),
            Command::SetAttributes { key, attrs } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.set_attributes(&key, &attrs).await.map(ResponseBody::Bool))]
            }
            Command::Touch { keys } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.touch(&ks).await.map(|_| ResponseBody::Empty)
            }),
            Command::Lock { key, timeout } => {
                let server = self.owner(&key);
                let result = server.cache.lock(&key, timeout).await;
                vec![respond(server, result.map(|(acquired, lock)| ResponseBody::Lock { acquired, lock }))]
            }
            Command::Unlock { key, lock_id } => {
                let server = self.owner(&key);
                let result = server.cache.unlock(&key, lock_id.as_deref()).await;
                vec![respond(server, result.map(|_| ResponseBody::Empty))]
            }
            Command::IsLocked { key } => {
                let server = self.owner(&key);
                let result = server.cache.is_locked(&key).await;
                vec![respond(server, result.map(|(acquired, lock)| ResponseBody::Lock { acquired, lock }))]
            }

            // ---------------------------------------------------------------
            // Cluster-wide
            // ---------------------------------------------------------------
            Command::RemoveGroup { group, sub_group } => per_server!(scope, |server| {
                server.cache.remove_group(&group, sub_group.as_deref()).await.map(|_| ResponseBody::Empty)
            }),
            Command::Clear { flags } => per_server!(scope, |server| {
                server.cache.clear(flags).await.map(|_| ResponseBody::Empty)
            }),
            Command::Count => per_server!(scope, |server| server.cache.count().await.map(ResponseBody::Count)),
            Command::GetByTags { tags, mode } => per_server!(scope, |server| {
                server.cache.get_by_tags(&tags, mode).await.map(ResponseBody::Entries)
            }),
            Command::GetKeysByTags { tags, mode } => per_server!(scope, |server| {
                server.cache.get_keys_by_tags(&tags, mode).await.map(ResponseBody::Keys)
            }),
            Command::RemoveByTags { tags, mode } => per_server!(scope, |server| {
                server.cache.remove_by_tags(&tags, mode).await.map(|_| ResponseBody::Empty)
            }),
            Command::GetGroupData { group, sub_group } => per_server!(scope, |server| {
                server.cache.get_group_data(&group, sub_group.as_deref()).await.map(ResponseBody::Entries)
            }),
            Command::GetGroupKeys { group, sub_group } => per_server!(scope, |server| {
                server.cache.get_group_keys(&group, sub_group.as_deref()).await.map(ResponseBody::Keys)
            }),
            Command::Search {
                query,
                params,
                with_values,
                cq,
            } => per_server!(scope, |server| {
                let result = match (&cq, with_values) {
                    (Some(cq), false) => server.cache.search_cq(cq).await,
                    (Some(cq), true) => server.cache.search_entries_cq(cq).await,
                    (None, false) => server.cache.search(&query, &params).await,
                    (None, true) => server.cache.search_entries(&query, &params).await,
                };
                result.map(ResponseBody::Query)
            }),
            Command::ExecuteReader {
                query,
                params,
                get_data,
                chunk_size,
                cq,
            } => per_server!(scope, |server| {
                match &cq {
                    Some(cq) => server.engine.register_cq(cq).and_then(|query_id| {
                        let opened = server.engine.open_reader(&query, &params, get_data, chunk_size)?;
                        Ok(ResponseBody::CqReader {
                            chunk: opened.first_chunk,
                            query_id,
                        })
                    }),
                    None => server
                        .engine
                        .open_reader(&query, &params, get_data, chunk_size)
                        .map(|opened| ResponseBody::Reader(opened.first_chunk)),
                }
            }),
            Command::RegisterCq { registration } => per_server!(scope, |server| {
                server.cache.register_cq(&registration).await.map(ResponseBody::QueryId)
            }),
            Command::UnregisterCq { server_id } => per_server!(scope, |server| {
                server.cache.unregister_cq(&server_id).await.map(|_| ResponseBody::Empty)
            }),
            Command::RemoveByQuery { query, params } => per_server!(scope, |server| {
                server.cache.remove_by_query(&query, &params).await.map(ResponseBody::Count)
            }),
            Command::RegisterGeneralNotification {
                types,
                filter,
                sequence,
            } => per_server!(scope, |server| {
                server
                    .cache
                    .register_general_notification(types, filter, sequence)
                    .await
                    .map(|_| ResponseBody::Empty)
            }),
            Command::UnregisterGeneralNotification { types, sequence } => per_server!(scope, |server| {
                server
                    .cache
                    .unregister_general_notification(types, sequence)
                    .await
                    .map(|_| ResponseBody::Empty)
            }),
            Command::RegisterPolling { .. } => per_server!(scope, |server| {
                let _ = server;
                Ok(ResponseBody::Empty)
            }),
            Command::Poll => per_server!(scope, |server| {
                let _ = server;
                Ok(ResponseBody::Poll(PollResult::default()))
            }),
            Command::GetMessages { subscriber_id } => per_server!(scope, |server| {
                server.cache.get_messages(&subscriber_id).await.map(ResponseBody::Messages)
            }),

            // ---------------------------------------------------------------
            // Single server
            // ---------------------------------------------------------------
            Command::GetReaderChunk {
                reader_id,
                next_index,
                chunk_size,
            } => {
                let server = self.named(routing, target)?;
                let result = server.engine.reader_chunk(&reader_id, next_index, chunk_size);
                vec![respond(server, result.map(ResponseBody::Reader))]
            }
            Command::DisposeReader { reader_id } => {
                let server = self.named(routing, target)?;
                server.engine.dispose_reader(&reader_id);
                vec![respond(server, Ok(ResponseBody::Empty))]
            }
            Command::RaiseCustomEvent { notif_id, data } => {
                let server = self.named(routing, target)?;
                let result = server.cache.raise_custom_event(notif_id, data).await;
                vec![respond(server, result.map(|_| ResponseBody::Empty))]
            }
            Command::ExecuteMapReduce { task } => {
                let server = self.named(routing, target)?;
                debug!(task = %task.name, "Mock cluster accepted MapReduce task");
                vec![respond(server, Ok(ResponseBody::TaskId(uuid::Uuid::new_v4().to_string())))]
            }
            Command::GetConnectedClients => {
                let server = self.named(routing, target)?;
                let result = server.cache.get_connected_clients().await;
                vec![respond(server, result.map(ResponseBody::Clients))]
            }

            // ---------------------------------------------------------------
            // Streams and topics, keyed by item key or topic name
            // ---------------------------------------------------------------
            Command::OpenStream { key, mode, opts } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.open_stream(&key, mode, &opts).await.map(ResponseBody::StreamHandle))]
            }
            Command::CloseStream { key, handle } => {
                let server = self.owner(&key);
                vec![respond(server, server.cache.close_stream(&key, &handle).await.map(|_| ResponseBody::Empty))]
            }
            Command::ReadStream {
                key,
                handle,
                offset,
                length,
            } => {
                let server = self.owner(&key);
                let result = server.cache.read_from_stream(&key, &handle, offset, length).await;
                vec![respond(server, result.map(ResponseBody::StreamData))]
            }
            Command::WriteStream {
                key,
                handle,
                offset,
                data,
            } => {
                let server = self.owner(&key);
                let result = server.cache.write_to_stream(&key, &handle, offset, data).await;
                vec![respond(server, result.map(|_| ResponseBody::Empty))]
            }
            Command::StreamLength { key, handle } => {
                let server = self.owner(&key);
                let result = server.cache.get_stream_length(&key, &handle).await;
                vec![respond(server, result.map(ResponseBody::Count))]
            }
            Command::RegisterKeyNotification { keys, ids } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.register_bulk_key_notification(&ks, &ids).await.map(|_| ResponseBody::Empty)
            }),
            Command::UnregisterKeyNotification { keys, ids } => per_owner!(self, &keys, |server, ks, _pos| {
                server.cache.unregister_bulk_key_notification(&ks, &ids).await.map(|_| ResponseBody::Empty)
            }),
            Command::GetOrCreateTopic { name, op } => {
                let server = self.owner(&name);
                vec![respond(server, server.cache.get_or_create_topic(&name, op).await.map(ResponseBody::Bool))]
            }
            Command::RemoveTopic { name, forcefully } => {
                let server = self.owner(&name);
                let result = server.cache.remove_topic(&name, forcefully).await;
                vec![respond(server, result.map(|_| ResponseBody::Empty))]
            }
            Command::Subscribe { subscription } => {
                let server = self.owner(&subscription.topic);
                vec![respond(server, server.cache.subscribe(&subscription).await.map(|_| ResponseBody::Empty))]
            }
            Command::Unsubscribe { subscription } => {
                let server = self.owner(&subscription.topic);
                vec![respond(server, server.cache.unsubscribe(&subscription).await.map(|_| ResponseBody::Empty))]
            }
            Command::Publish { message, flags } => {
                let server = self.owner(&message.topic);
                let result = server.cache.publish_message(&message, flags).await;
                vec![respond(server, result.map(|_| ResponseBody::Empty))]
            }
            Command::MessageCount { topic } => {
                let server = self.owner(&topic);
                vec![respond(server, server.cache.get_message_count(&topic).await.map(ResponseBody::Count))]
            }
            Command::AcknowledgeMessages { acks } => {
                let mut by_owner: BTreeMap<ServerAddress, MessageAcks> = BTreeMap::new();
                for (topic, ids) in acks {
                    by_owner
                        .entry(self.owner_of(&topic))
                        .or_default()
                        .insert(topic, ids);
                }
                let mut out = Vec::new();
                for (address, acks) in by_owner {
                    if let Some(server) = self.server(&address) {
                        let result = server.cache.acknowledge_message_receipt(&acks).await;
                        out.push(respond(server, result.map(|_| ResponseBody::Empty)));
                    }
                }
                out
            }
            Command::InvokeEntryProcessor {
                keys,
                processor,
                args,
                flags,
            } => per_owner!(self, &keys, |server, ks, _pos| {
                server
                    .cache
                    .invoke_entry_processor(&ks, &processor, &args, flags)
                    .await
                    .map(ResponseBody::Processed)
            }),
        };
        Ok(responses)
    }
}

impl KeyRouter for MockCluster {
    fn key_owner(&self, key: &str) -> Option<ServerAddress> {
        self.has_map
            .load(Ordering::SeqCst)
            .then(|| self.owner_of(key))
    }

    fn is_connected(&self, server: &ServerAddress) -> bool {
        self.links.get(server).is_some_and(|up| *up)
    }

    fn load_balanced_server(&self) -> Option<ServerAddress> {
        self.servers
            .iter()
            .map(|s| &s.address)
            .find(|a| self.is_connected(a))
            .cloned()
    }
}

#[async_trait]
impl Broker for MockCluster {
    fn has_distribution_map(&self) -> bool {
        self.has_map.load(Ordering::SeqCst)
    }

    fn client_last_view_id(&self) -> u64 {
        self.view_id.load(Ordering::SeqCst)
    }

    fn connected_servers(&self) -> Vec<ServerAddress> {
        self.servers
            .iter()
            .map(|s| s.address.clone())
            .filter(|a| self.is_connected(a))
            .collect()
    }

    fn set_listener(&self, listener: Weak<dyn BrokerListener>) {
        *self.listener.lock() = Some(listener);
    }

    async fn execute(&self, request: Request) -> Result<Response> {
        self.record(&request);

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let first_target = request
            .commands
            .first()
            .map(|c| match &c.target {
                Target::Server(address) => address.clone(),
                Target::KeyOwner(key) => self.owner_of(key),
                Target::Any => self.servers[0].address.clone(),
            })
            .ok_or_else(|| Error::InvalidArgument("request has no commands".into()))?;

        let fault = self.faults.lock().pop_front();
        if let Some(fault) = fault {
            debug!(request_id = request.id, fault = ?fault, "Injecting server fault");
            return Ok(Response::new(vec![CommandResponse::fault(first_target, fault)]));
        }

        let mut responses = Vec::new();
        for targeted in request.commands {
            if let Target::Server(address) = &targeted.target {
                if !self.is_connected(address) {
                    return Err(Error::ConnectionLost {
                        server: address.to_string(),
                    });
                }
            }
            responses.extend(self.run(request.routing, &targeted.target, targeted.command).await?);
        }
        Ok(Response::new(responses))
    }
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("servers", &self.servers())
            .field("has_map", &self.has_distribution_map())
            .field("view_id", &self.client_last_view_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::item::{CacheItem, Payload};
    use crate::domain::options::{GetOptions, WriteOptions};
    use crate::remote::command::TargetedCommand;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn insert(key: &str, n: i64) -> Command {
        Command::Insert {
            key: key.to_string(),
            item: CacheItem::new(Payload::Native(json!(n))),
            opts: WriteOptions::default(),
        }
    }

    fn pooled(command: Command, target: Target) -> Request {
        Request::pooled(command, target, ViewIdTag::Client(1), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_keyed_commands_land_on_owner() {
        let cluster = MockCluster::new(3);
        cluster
            .execute(pooled(insert("order:1", 1), Target::KeyOwner("order:1".into())))
            .await
            .unwrap()
            .parse()
            .unwrap();

        let owner = cluster.owner_of("order:1");
        assert!(cluster.engine(&owner).unwrap().contains("order:1"));
        let others = cluster.servers().into_iter().filter(|s| *s != owner);
        for server in others {
            assert!(!cluster.engine(&server).unwrap().contains("order:1"));
        }
    }

    #[tokio::test]
    async fn test_any_target_answers_from_every_server() {
        let cluster = MockCluster::new(3);
        for i in 0..12 {
            let key = format!("k{}", i);
            cluster
                .execute(pooled(insert(&key, i), Target::KeyOwner(key.clone())))
                .await
                .unwrap();
        }
        let bodies = cluster
            .execute(pooled(Command::Count, Target::Any))
            .await
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(bodies.len(), 3);
        let total: u64 = bodies
            .into_iter()
            .map(|(_, b)| match b {
                ResponseBody::Count(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(total, 12);
    }

    #[tokio::test]
    async fn test_injected_fault_is_consumed_once() {
        let cluster = MockCluster::new(2);
        cluster.fail_next(ServerFault::ActivityBlocked, 1);
        let get = || {
            pooled(
                Command::Get {
                    key: "k".into(),
                    opts: GetOptions::default(),
                },
                Target::KeyOwner("k".into()),
            )
        };

        assert_matches!(
            cluster.execute(get()).await.unwrap().parse(),
            Err(Error::ActivityBlocked { .. })
        );
        assert!(cluster.execute(get()).await.unwrap().parse().is_ok());
        assert_eq!(cluster.journal().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnected_server_target_fails() {
        let cluster = MockCluster::new(2);
        let down = cluster.servers()[1].clone();
        cluster.drop_server(&down);
        assert!(!cluster.connected_servers().contains(&down));

        let request = Request::new(
            Routing::Pooled,
            Duration::from_secs(1),
            vec![TargetedCommand {
                target: Target::Server(down.clone()),
                view: ViewIdTag::Client(1),
                command: Command::Count,
            }],
        );
        assert_matches!(cluster.execute(request).await, Err(Error::ConnectionLost { .. }));
    }
}
