//! Request dispatch with the cluster fault policy.
//!
//! Every remote operation goes through [`Dispatcher::dispatch`], which asks
//! the latch for a route, lets the operation build its request for that
//! route, executes it, and applies [`decide`] to the outcome.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use super::command::{Command, Request, ResponseBody, Routing, Target, TargetedCommand};
use super::distribution::{distribute_keys, distribute_messages, ViewIdTag};
use super::latch::{decide, CallRoute, DedicatedCallLatch, RetryDecision};
use crate::config::ClientConfig;
use crate::domain::messaging::MessageAcks;
use crate::domain::ports::{Broker, Clock, ServerAddress};
use crate::domain::query::ReaderChunk;
use crate::error::{Error, Result};
use crate::reader::ChunkSource;

/// Builds requests for a route and executes them through the broker.
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    latch: DedicatedCallLatch,
    config: ClientConfig,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, clock: Arc<dyn Clock>, config: ClientConfig) -> Self {
        let latch = DedicatedCallLatch::new(clock, config.dedicated_call_window());
        Self {
            broker,
            latch,
            config,
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn latch(&self) -> &DedicatedCallLatch {
        &self.latch
    }

    pub fn timeout(&self) -> Duration {
        self.config.operation_timeout()
    }

    /// Execute the request `build` produces, retrying per the fault policy.
    ///
    /// `build` is called again for every attempt so a retry carries a
    /// freshly routed copy of the same logical command.
    #[instrument(level = "debug", skip(self, build))]
    pub async fn dispatch<F>(
        &self,
        operation: &'static str,
        build: F,
    ) -> Result<Vec<(ServerAddress, ResponseBody)>>
    where
        F: Fn(CallRoute) -> Result<Request> + Send + Sync,
    {
        let mut route = self.latch.route();
        let mut attempt: u8 = 0;
        loop {
            let request = build(route)?;
            let outcome = self.execute(request).await;
            let fault = outcome.as_ref().err().and_then(Error::fault_kind);

            match decide(attempt, fault) {
                RetryDecision::Propagate => return outcome,
                RetryDecision::RetryDedicated => {
                    debug!(operation, "Activity blocked, retrying on a dedicated connection");
                }
                RetryDecision::LatchAndRetryDedicated => {
                    self.latch.engage();
                }
                RetryDecision::LatchAndPropagate => {
                    self.latch.engage();
                    return outcome;
                }
            }
            route = CallRoute::Dedicated;
            attempt += 1;
        }
    }

    async fn execute(&self, request: Request) -> Result<Vec<(ServerAddress, ResponseBody)>> {
        let timeout = request.timeout;
        let name = request.name();
        debug!(
            request_id = request.id,
            command = name,
            routing = ?request.routing,
            commands = request.commands.len(),
            "Executing request"
        );
        match tokio::time::timeout(timeout, self.broker.execute(request)).await {
            Ok(response) => response?.parse(),
            Err(_) => Err(Error::Timeout {
                operation: name.to_string(),
                after: timeout,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Request construction
    // -------------------------------------------------------------------------

    fn client_view(&self) -> ViewIdTag {
        ViewIdTag::Client(self.broker.client_last_view_id())
    }

    fn uses_map(&self) -> bool {
        self.config.import_hashmap && self.broker.has_distribution_map()
    }

    /// Dedicated request to the load-balanced server.
    pub fn dedicated(&self, command: Command) -> Result<Request> {
        let server = self
            .broker
            .load_balanced_server()
            .ok_or(Error::NoServerAvailable)?;
        Ok(Request::dedicated(command, server, self.timeout()))
    }

    /// Single-key command.
    pub fn to_key(&self, route: CallRoute, key: &str, command: Command) -> Result<Request> {
        match route {
            CallRoute::Dedicated => self.dedicated(command),
            CallRoute::Pooled => Ok(Request::pooled(
                command,
                Target::KeyOwner(key.to_string()),
                self.client_view(),
                self.timeout(),
            )),
        }
    }

    /// Keyless command the broker may send anywhere.
    pub fn to_any(&self, route: CallRoute, command: Command) -> Result<Request> {
        match route {
            CallRoute::Dedicated => self.dedicated(command),
            CallRoute::Pooled => Ok(Request::pooled(
                command,
                Target::Any,
                self.client_view(),
                self.timeout(),
            )),
        }
    }

    /// Command that must reach one particular server.
    pub fn to_server(&self, route: CallRoute, server: &ServerAddress, command: Command) -> Result<Request> {
        if !self.broker.is_connected(server) {
            return Err(Error::ConnectionLost {
                server: server.to_string(),
            });
        }
        Ok(match route {
            CallRoute::Dedicated => Request::dedicated(command, server.clone(), self.timeout()),
            CallRoute::Pooled => Request::pooled(
                command,
                Target::Server(server.clone()),
                self.client_view(),
                self.timeout(),
            ),
        })
    }

    /// One copy of `command` per connected server, for queries and readers
    /// whose results are spread over the cluster.
    pub fn broadcast(&self, route: CallRoute, command: Command) -> Result<Request> {
        if route == CallRoute::Dedicated || !self.uses_map() {
            return self.to_any(route, command);
        }
        let servers = self.broker.connected_servers();
        if servers.is_empty() {
            return Err(Error::NoServerAvailable);
        }
        let view = self.client_view();
        let commands = servers
            .into_iter()
            .map(|server| TargetedCommand {
                target: Target::Server(server),
                view,
                command: command.clone(),
            })
            .collect();
        Ok(Request::new(Routing::Pooled, self.timeout(), commands))
    }

    /// Bulk command split into one command per owning server.
    ///
    /// `make` builds the per-server command from that server's keys and
    /// parallel items.
    pub fn sharded<T, F>(
        &self,
        route: CallRoute,
        keys: &[String],
        items: Option<&[T]>,
        make: F,
    ) -> Result<Request>
    where
        T: Clone,
        F: Fn(Vec<String>, Vec<T>) -> Command,
    {
        let whole = || make(keys.to_vec(), items.map(<[T]>::to_vec).unwrap_or_default());

        if route == CallRoute::Dedicated {
            return self.dedicated(whole());
        }
        if !self.uses_map() {
            return self.to_any(route, whole());
        }

        let distribution = distribute_keys(self.broker.as_ref(), keys, items)?;
        let view = distribution.view_tag(self.broker.client_last_view_id());
        let commands = distribution
            .partitions
            .into_iter()
            .map(|(server, partition)| TargetedCommand {
                target: Target::Server(server),
                view,
                command: make(partition.keys, partition.items),
            })
            .collect();
        Ok(Request::new(Routing::Pooled, self.timeout(), commands))
    }

    /// Message acknowledgements split by the server owning each topic.
    pub fn sharded_acks(&self, route: CallRoute, acks: &MessageAcks) -> Result<Request> {
        let whole = || Command::AcknowledgeMessages { acks: acks.clone() };
        if route == CallRoute::Dedicated {
            return self.dedicated(whole());
        }
        if !self.uses_map() {
            return self.to_any(route, whole());
        }
        let view = self.client_view();
        let commands = distribute_messages(self.broker.as_ref(), acks)?
            .into_iter()
            .map(|(server, acks)| TargetedCommand {
                target: Target::Server(server),
                view,
                command: Command::AcknowledgeMessages { acks },
            })
            .collect();
        Ok(Request::new(Routing::Pooled, self.timeout(), commands))
    }
}

#[async_trait]
impl ChunkSource for Dispatcher {
    async fn next_chunk(
        &self,
        server: &ServerAddress,
        reader_id: &str,
        next_index: u64,
        chunk_size: usize,
    ) -> Result<ReaderChunk> {
        let command = Command::GetReaderChunk {
            reader_id: reader_id.to_string(),
            next_index,
            chunk_size,
        };
        let bodies = self
            .dispatch("get_reader_chunk", |route| {
                self.to_server(route, server, command.clone())
            })
            .await?;
        match bodies.into_iter().next() {
            Some((_, ResponseBody::Reader(chunk))) => Ok(chunk),
            Some((_, other)) => Err(super::command::unexpected("reader", &other)),
            None => Err(Error::OperationFailed("empty reader response".into())),
        }
    }

    async fn dispose_reader(&self, server: &ServerAddress, reader_id: &str) -> Result<()> {
        if !self.broker.is_connected(server) {
            warn!(server = %server, reader_id, "Cannot dispose reader, server not connected");
            return Ok(());
        }
        let command = Command::DisposeReader {
            reader_id: reader_id.to_string(),
        };
        self.dispatch("dispose_reader", |route| {
            self.to_server(route, server, command.clone())
        })
        .await
        .map(|_| ())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("latch", &self.latch.state())
            .field("import_hashmap", &self.config.import_hashmap)
            .finish_non_exhaustive()
    }
}
