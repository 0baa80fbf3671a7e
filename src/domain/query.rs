//! Query descriptors, result sets and continuous queries.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::events::{
    deliver, CacheEvent, EventDataFilter, EventHandler, EventType, EventTypes, SubscriptionHandle,
};
use super::item::ValueEntry;
use super::ports::ServerAddress;

/// Named parameter bindings for a query.
pub type QueryParams = BTreeMap<String, serde_json::Value>;

// =============================================================================
// Search Results
// =============================================================================

/// Aggregate function of an aggregate query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFunction {
    Count,
    Sum,
    Min,
    Max,
    Average,
}

/// Partial aggregate from one server.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregateValue {
    pub function: AggregateFunction,
    pub value: f64,
    /// Rows that contributed; used to combine averages
    pub count: u64,
}

impl AggregateValue {
    /// Combine two partial aggregates of the same function.
    pub fn combine(self, other: AggregateValue) -> AggregateValue {
        let count = self.count + other.count;
        let value = match self.function {
            AggregateFunction::Count | AggregateFunction::Sum => self.value + other.value,
            AggregateFunction::Min => self.value.min(other.value),
            AggregateFunction::Max => self.value.max(other.value),
            AggregateFunction::Average if count == 0 => 0.0,
            AggregateFunction::Average => {
                (self.value * self.count as f64 + other.value * other.count as f64) / count as f64
            }
        };
        AggregateValue {
            function: self.function,
            value,
            count,
        }
    }
}

/// Result of `search` / `search_entries`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResultSet {
    pub keys: Vec<String>,
    pub entries: HashMap<String, ValueEntry>,
    pub aggregate: Option<AggregateValue>,
    /// Server id of the continuous query this result registered
    pub query_id: Option<String>,
}

impl QueryResultSet {
    pub fn with_keys(keys: Vec<String>) -> Self {
        Self {
            keys,
            ..Default::default()
        }
    }

    pub fn with_entries(entries: HashMap<String, ValueEntry>) -> Self {
        Self {
            entries,
            ..Default::default()
        }
    }

    /// Fold another server's partial result into this one.
    pub fn merge(&mut self, other: QueryResultSet) {
        self.keys.extend(other.keys);
        self.entries.extend(other.entries);
        self.aggregate = match (self.aggregate, other.aggregate) {
            (Some(a), Some(b)) => Some(a.combine(b)),
            (a, b) => a.or(b),
        };
        if self.query_id.is_none() {
            self.query_id = other.query_id;
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len().max(self.entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0 && self.aggregate.is_none()
    }
}

// =============================================================================
// Reader Rows
// =============================================================================

/// Sort direction of an order-by column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Order-by column, by position in the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderByColumn {
    pub column: usize,
    pub direction: SortDirection,
}

/// How partitions of a reader are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    Plain,
    Grouped,
    Ordered,
}

/// Shape of a reader's rows, as reported by the first partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderDescriptor {
    pub columns: Vec<String>,
    pub order_by: Vec<OrderByColumn>,
    pub group_by: Vec<usize>,
}

impl ReaderDescriptor {
    pub fn plain(columns: Vec<String>) -> Self {
        Self {
            columns,
            ..Default::default()
        }
    }

    pub fn merge_mode(&self) -> MergeMode {
        if !self.order_by.is_empty() {
            MergeMode::Ordered
        } else if !self.group_by.is_empty() {
            MergeMode::Grouped
        } else {
            MergeMode::Plain
        }
    }

    /// Compare two rows on the order-by columns.
    pub fn compare(&self, a: &ReaderRow, b: &ReaderRow) -> Ordering {
        for order in &self.order_by {
            let ord = compare_values(a.values.get(order.column), b.values.get(order.column));
            let ord = match order.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Grouping key of a row.
    pub fn group_key(&self, row: &ReaderRow) -> String {
        let values: Vec<&serde_json::Value> = self
            .group_by
            .iter()
            .map(|i| row.values.get(*i).unwrap_or(&serde_json::Value::Null))
            .collect();
        serde_json::to_string(&values).unwrap_or_default()
    }
}

/// Total order over JSON scalars: null < bool < number < string < other.
pub fn compare_values(a: Option<&serde_json::Value>, b: Option<&serde_json::Value>) -> Ordering {
    use serde_json::Value;

    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(a) == 4 && rank(b) == 4 => x.to_string().cmp(&y.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// One row of a reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderRow {
    pub key: Option<String>,
    pub values: Vec<serde_json::Value>,
    /// Cached value, present when the reader was opened with data
    pub entry: Option<ValueEntry>,
}

impl ReaderRow {
    pub fn new(key: Option<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            key,
            values,
            entry: None,
        }
    }

    pub fn value(&self, column: usize) -> Option<&serde_json::Value> {
        self.values.get(column)
    }
}

/// A page of rows from one server-side reader.
#[derive(Debug, Clone, PartialEq)]
pub struct ReaderChunk {
    pub reader_id: String,
    pub server: ServerAddress,
    pub rows: Vec<ReaderRow>,
    /// Watermark to present when requesting the next chunk
    pub next_index: u64,
    /// Server has no rows beyond this chunk and released the reader
    pub is_last: bool,
    pub descriptor: ReaderDescriptor,
}

// =============================================================================
// Continuous Query
// =============================================================================

struct CqSubscription {
    types: EventTypes,
    filter: EventDataFilter,
    handler: EventHandler,
}

/// Handler for continuous-query clear notifications.
pub type ClearHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// A query that keeps notifying subscribers as matching items change.
///
/// Identified locally by a client-generated id and, once registered, by the
/// id the cache assigns.
pub struct ContinuousQuery {
    query: String,
    params: QueryParams,
    client_id: String,
    server_id: Mutex<Option<String>>,
    subscriptions: Mutex<BTreeMap<SubscriptionHandle, CqSubscription>>,
    clear_handlers: Mutex<BTreeMap<SubscriptionHandle, ClearHandler>>,
    next_handle: AtomicU64,
}

impl ContinuousQuery {
    pub fn new(query: impl Into<String>, params: QueryParams) -> Self {
        Self {
            query: query.into(),
            params,
            client_id: uuid::Uuid::new_v4().to_string(),
            server_id: Mutex::new(None),
            subscriptions: Mutex::new(BTreeMap::new()),
            clear_handlers: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn params(&self) -> &QueryParams {
        &self.params
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn server_id(&self) -> Option<String> {
        self.server_id.lock().clone()
    }

    pub fn set_server_id(&self, id: Option<String>) {
        *self.server_id.lock() = id;
    }

    /// Subscribe `handler` to the given event kinds.
    pub fn register_notification<F>(
        &self,
        types: EventTypes,
        filter: EventDataFilter,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, AtomicOrdering::Relaxed));
        self.subscriptions.lock().insert(
            handle,
            CqSubscription {
                types,
                filter,
                handler: Arc::new(handler),
            },
        );
        handle
    }

    /// Remove a subscription. Returns false if the handle was unknown.
    pub fn unregister_notification(&self, handle: SubscriptionHandle) -> bool {
        self.subscriptions.lock().remove(&handle).is_some()
            || self.clear_handlers.lock().remove(&handle).is_some()
    }

    /// Be told when the cache clears this query's result set.
    pub fn on_clear<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, AtomicOrdering::Relaxed));
        self.clear_handlers.lock().insert(handle, Arc::new(handler));
        handle
    }

    /// Largest data filter any subscriber requested for `event`.
    pub fn max_filter(&self, event: EventType) -> Option<EventDataFilter> {
        self.subscriptions
            .lock()
            .values()
            .filter(|s| s.types.includes(event))
            .map(|s| s.filter)
            .max()
    }

    /// Event kinds with at least one subscriber.
    pub fn registered_types(&self) -> EventTypes {
        self.subscriptions
            .lock()
            .values()
            .fold(EventTypes::empty(), |acc, s| acc | s.types)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Deliver a matching event to every interested subscriber.
    pub fn dispatch(&self, event: &CacheEvent, background: bool) {
        let targets: Vec<(EventHandler, EventDataFilter)> = self
            .subscriptions
            .lock()
            .values()
            .filter(|s| s.types.includes(event.event_type))
            .map(|s| (Arc::clone(&s.handler), s.filter))
            .collect();

        for (handler, filter) in targets {
            deliver(&handler, event.filtered(filter), background);
        }
    }

    /// Notify clear handlers.
    pub fn dispatch_clear(&self) {
        let handlers: Vec<ClearHandler> = self.clear_handlers.lock().values().cloned().collect();
        for handler in handlers {
            let query = self.query.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&query))).is_err() {
                tracing::warn!(query = %self.query, "Continuous query clear handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for ContinuousQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousQuery")
            .field("query", &self.query)
            .field("client_id", &self.client_id)
            .field("server_id", &*self.server_id.lock())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// What the cache needs to register a continuous query.
#[derive(Debug, Clone, PartialEq)]
pub struct CqRegistration {
    pub query: String,
    pub params: QueryParams,
    pub client_id: String,
    pub notify_add: Option<EventDataFilter>,
    pub notify_update: Option<EventDataFilter>,
    pub notify_remove: Option<EventDataFilter>,
}

impl From<&ContinuousQuery> for CqRegistration {
    fn from(cq: &ContinuousQuery) -> Self {
        Self {
            query: cq.query.clone(),
            params: cq.params.clone(),
            client_id: cq.client_id.clone(),
            notify_add: cq.max_filter(EventType::ItemAdded),
            notify_update: cq.max_filter(EventType::ItemUpdated),
            notify_remove: cq.max_filter(EventType::ItemRemoved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn row(v: serde_json::Value) -> ReaderRow {
        ReaderRow::new(None, vec![v])
    }

    #[test]
    fn test_merge_mode_selection() {
        let mut descriptor = ReaderDescriptor::plain(vec!["price".into()]);
        assert_eq!(descriptor.merge_mode(), MergeMode::Plain);

        descriptor.group_by = vec![0];
        assert_eq!(descriptor.merge_mode(), MergeMode::Grouped);

        descriptor.order_by = vec![OrderByColumn {
            column: 0,
            direction: SortDirection::Ascending,
        }];
        assert_eq!(descriptor.merge_mode(), MergeMode::Ordered);
    }

    #[test]
    fn test_compare_respects_direction() {
        let mut descriptor = ReaderDescriptor::plain(vec!["n".into()]);
        descriptor.order_by = vec![OrderByColumn {
            column: 0,
            direction: SortDirection::Descending,
        }];
        assert_eq!(descriptor.compare(&row(json!(1)), &row(json!(2))), Ordering::Greater);
        assert_eq!(compare_values(Some(&json!(null)), Some(&json!("a"))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(2.5)), Some(&json!(2))), Ordering::Greater);
    }

    #[test]
    fn test_aggregate_combine() {
        let a = AggregateValue {
            function: AggregateFunction::Average,
            value: 10.0,
            count: 2,
        };
        let b = AggregateValue {
            function: AggregateFunction::Average,
            value: 40.0,
            count: 1,
        };
        assert_eq!(a.combine(b).value, 20.0);

        let mut set = QueryResultSet::with_keys(vec!["a".into()]);
        set.merge(QueryResultSet::with_keys(vec!["b".into()]));
        assert_eq!(set.keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_cq_tracks_max_filter_per_event() {
        let cq = ContinuousQuery::new("SELECT Order WHERE region = ?region", QueryParams::new());
        assert_eq!(cq.max_filter(EventType::ItemAdded), None);

        let h1 = cq.register_notification(EventTypes::ADDED, EventDataFilter::Metadata, |_| {});
        let _h2 = cq.register_notification(
            EventTypes::ADDED | EventTypes::REMOVED,
            EventDataFilter::DataWithMetadata,
            |_| {},
        );

        assert_eq!(
            cq.max_filter(EventType::ItemAdded),
            Some(EventDataFilter::DataWithMetadata)
        );
        assert_eq!(cq.max_filter(EventType::ItemUpdated), None);

        assert!(cq.unregister_notification(h1));
        assert!(!cq.unregister_notification(h1));
        let registration = CqRegistration::from(&cq);
        assert_eq!(registration.notify_remove, Some(EventDataFilter::DataWithMetadata));
        assert_eq!(registration.client_id, cq.client_id());
    }

    #[test]
    fn test_cq_dispatch_isolates_subscribers() {
        let cq = ContinuousQuery::new("q", QueryParams::new());
        let hits = Arc::new(AtomicUsize::new(0));

        cq.register_notification(EventTypes::UPDATED, EventDataFilter::None, |_| {
            panic!("bad subscriber")
        });
        let counter = hits.clone();
        cq.register_notification(EventTypes::UPDATED, EventDataFilter::None, move |_| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        let event = CacheEvent::new("c", Some("k".into()), EventType::ItemUpdated);
        cq.dispatch(&event, false);
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
    }
}
