//! Distributed reader merge.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};

use super::partition::PartitionCursor;
use super::registry::PartitionRegistry;
use crate::domain::ports::ServerAddress;
use crate::domain::query::{MergeMode, ReaderChunk, ReaderDescriptor, ReaderRow};
use crate::error::{Error, Result};

/// Where partitions fetch further chunks and release server resources.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn next_chunk(
        &self,
        server: &ServerAddress,
        reader_id: &str,
        next_index: u64,
        chunk_size: usize,
    ) -> Result<ReaderChunk>;

    async fn dispose_reader(&self, server: &ServerAddress, reader_id: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Open,
    Exhausted,
    Closed,
}

/// One forward-only cursor over the partitions of a distributed reader.
///
/// The merge discipline comes from the first partition's descriptor:
/// plain partitions are read round-robin, ordered partitions are k-way
/// merged on the order-by columns, and grouped partitions are buffered so
/// every group is emitted contiguously.
pub struct DistributedReader {
    source: Arc<dyn ChunkSource>,
    registry: Arc<PartitionRegistry>,
    descriptor: ReaderDescriptor,
    mode: MergeMode,
    partitions: Vec<PartitionCursor>,
    chunk_size: usize,
    next_partition: usize,
    grouped: Option<VecDeque<ReaderRow>>,
    current: Option<ReaderRow>,
    state: ReaderState,
    query_id: Option<String>,
}

impl DistributedReader {
    pub fn new(
        source: Arc<dyn ChunkSource>,
        registry: Arc<PartitionRegistry>,
        chunks: Vec<ReaderChunk>,
        chunk_size: usize,
    ) -> Self {
        let descriptor = chunks
            .first()
            .map(|c| c.descriptor.clone())
            .unwrap_or_default();
        let mode = descriptor.merge_mode();

        let partitions = chunks
            .into_iter()
            .map(|chunk| {
                let valid = if chunk.is_last {
                    Arc::new(AtomicBool::new(true))
                } else {
                    registry.register(&chunk.server, &chunk.reader_id)
                };
                PartitionCursor::from_chunk(chunk, valid)
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            partitions = partitions.len(),
            mode = ?mode,
            "Opened distributed reader"
        );

        Self {
            source,
            registry,
            descriptor,
            mode,
            partitions,
            chunk_size: chunk_size.max(1),
            next_partition: 0,
            grouped: None,
            current: None,
            state: ReaderState::Open,
            query_id: None,
        }
    }

    /// Attach the id of the continuous query registered with this reader.
    pub fn with_query_id(mut self, query_id: Option<String>) -> Self {
        self.query_id = query_id;
        self
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn descriptor(&self) -> &ReaderDescriptor {
        &self.descriptor
    }

    pub fn merge_mode(&self) -> MergeMode {
        self.mode
    }

    pub fn columns(&self) -> &[String] {
        &self.descriptor.columns
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Advance to the next row. Returns false once every partition is done.
    pub async fn read(&mut self) -> Result<bool> {
        match self.state {
            ReaderState::Closed => return Err(Error::ReaderClosed(self.label())),
            ReaderState::Exhausted => {
                self.current = None;
                return Ok(false);
            }
            ReaderState::Open => {}
        }

        let row = match self.mode {
            MergeMode::Plain => self.next_plain().await?,
            MergeMode::Ordered => self.next_ordered().await?,
            MergeMode::Grouped => self.next_grouped().await?,
        };

        if row.is_none() {
            self.release().await;
            self.state = ReaderState::Exhausted;
        }
        self.current = row;
        Ok(self.current.is_some())
    }

    /// Row the cursor is positioned on.
    pub fn current(&self) -> Option<&ReaderRow> {
        self.current.as_ref()
    }

    /// Column value of the current row.
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        let index = self.descriptor.columns.iter().position(|c| c == column)?;
        self.current.as_ref()?.value(index)
    }

    /// Advance and return the row.
    pub async fn next_row(&mut self) -> Result<Option<ReaderRow>> {
        if self.read().await? {
            Ok(self.current.clone())
        } else {
            Ok(None)
        }
    }

    /// Close the reader, releasing server-side state of every partition.
    pub async fn close(&mut self) {
        if self.state == ReaderState::Open {
            self.release().await;
        }
        self.state = ReaderState::Closed;
        self.current = None;
    }

    /// Consume the reader as a stream of rows; the stream ends after the
    /// first error.
    pub fn into_stream(self) -> impl Stream<Item = Result<ReaderRow>> + Send {
        stream::unfold(Some(self), |reader| async move {
            let mut reader = reader?;
            match reader.next_row().await {
                Ok(Some(row)) => Some((Ok(row), Some(reader))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    fn label(&self) -> String {
        self.partitions
            .first()
            .map(|p| p.reader_id.clone())
            .unwrap_or_else(|| "<empty>".to_string())
    }

    // -------------------------------------------------------------------------
    // Merge disciplines
    // -------------------------------------------------------------------------

    async fn next_plain(&mut self) -> Result<Option<ReaderRow>> {
        let count = self.partitions.len();
        for step in 0..count {
            let index = (self.next_partition + step) % count;
            self.fill(index).await?;
            if let Some(row) = self.partitions[index].pop() {
                self.next_partition = (index + 1) % count;
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    async fn next_ordered(&mut self) -> Result<Option<ReaderRow>> {
        for index in 0..self.partitions.len() {
            self.fill(index).await?;
        }

        // ties go to the lower partition index
        let mut best: Option<(usize, &ReaderRow)> = None;
        for (index, partition) in self.partitions.iter().enumerate() {
            let Some(head) = partition.peek() else {
                continue;
            };
            match best {
                Some((_, current)) if self.descriptor.compare(current, head).is_le() => {}
                _ => best = Some((index, head)),
            }
        }
        let best = best.map(|(index, _)| index);
        Ok(best.and_then(|index| self.partitions[index].pop()))
    }

    async fn next_grouped(&mut self) -> Result<Option<ReaderRow>> {
        if self.grouped.is_none() {
            let mut order: Vec<String> = Vec::new();
            let mut groups: HashMap<String, Vec<ReaderRow>> = HashMap::new();
            for index in 0..self.partitions.len() {
                loop {
                    self.fill(index).await?;
                    let Some(row) = self.partitions[index].pop() else {
                        break;
                    };
                    let key = self.descriptor.group_key(&row);
                    groups
                        .entry(key.clone())
                        .or_insert_with(|| {
                            order.push(key);
                            Vec::new()
                        })
                        .push(row);
                }
            }
            let rows = order
                .into_iter()
                .flat_map(|key| groups.remove(&key).unwrap_or_default())
                .collect();
            self.grouped = Some(rows);
        }
        Ok(self.grouped.as_mut().and_then(VecDeque::pop_front))
    }

    /// Fetch the next chunk of a partition if its buffer ran dry.
    async fn fill(&mut self, index: usize) -> Result<()> {
        while self.partitions[index].needs_fetch() {
            let (server, reader_id, next_index) = {
                let p = &self.partitions[index];
                (p.server.clone(), p.reader_id.clone(), p.next_index())
            };
            match self
                .source
                .next_chunk(&server, &reader_id, next_index, self.chunk_size)
                .await
            {
                Ok(chunk) => {
                    let partition = &mut self.partitions[index];
                    partition.push_chunk(chunk);
                    if partition.is_exhausted() {
                        self.registry.deregister(&server, &reader_id);
                    }
                }
                Err(Error::ConnectionLost { .. }) => {
                    tracing::warn!(
                        server = %server,
                        reader_id = %reader_id,
                        "Connection lost while fetching reader chunk, dropping partition"
                    );
                    self.partitions[index].invalidate();
                    self.registry.deregister(&server, &reader_id);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Dispose server-side state of partitions that still hold it.
    async fn release(&mut self) {
        for partition in &self.partitions {
            if !partition.holds_server_state() {
                continue;
            }
            self.registry.deregister(&partition.server, &partition.reader_id);
            if let Err(e) = self
                .source
                .dispose_reader(&partition.server, &partition.reader_id)
                .await
            {
                tracing::warn!(
                    server = %partition.server,
                    reader_id = %partition.reader_id,
                    error = %e,
                    "Failed to dispose reader partition"
                );
            }
            partition.invalidate();
        }
    }
}

impl Drop for DistributedReader {
    fn drop(&mut self) {
        if self.state != ReaderState::Open {
            return;
        }
        let pending: Vec<(ServerAddress, String)> = self
            .partitions
            .iter()
            .filter(|p| p.holds_server_state())
            .map(|p| (p.server.clone(), p.reader_id.clone()))
            .collect();
        if pending.is_empty() {
            return;
        }
        for (server, reader_id) in &pending {
            self.registry.deregister(server, reader_id);
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let source = Arc::clone(&self.source);
                runtime.spawn(async move {
                    for (server, reader_id) in pending {
                        if let Err(e) = source.dispose_reader(&server, &reader_id).await {
                            tracing::debug!(server = %server, error = %e, "Dispose on drop failed");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::debug!(
                    partitions = pending.len(),
                    "Reader dropped outside a runtime, server partitions left to expire"
                );
            }
        }
    }
}

impl std::fmt::Debug for DistributedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedReader")
            .field("mode", &self.mode)
            .field("partitions", &self.partitions.len())
            .field("state", &self.state)
            .field("query_id", &self.query_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::query::{OrderByColumn, SortDirection};
    use parking_lot::Mutex;
    use serde_json::json;

    /// Serves pre-split rows per (server, reader) and records disposals.
    #[derive(Default)]
    struct ScriptedSource {
        rows: Mutex<HashMap<(ServerAddress, String), VecDeque<ReaderRow>>>,
        descriptor: ReaderDescriptor,
        disposed: Mutex<Vec<String>>,
        lost: Mutex<Vec<ServerAddress>>,
    }

    impl ScriptedSource {
        fn chunk(&self, server: &ServerAddress, reader_id: &str, size: usize) -> ReaderChunk {
            let mut rows = self.rows.lock();
            let queue = rows
                .get_mut(&(server.clone(), reader_id.to_string()))
                .expect("scripted reader");
            let take = size.min(queue.len());
            let batch: Vec<ReaderRow> = queue.drain(..take).collect();
            ReaderChunk {
                reader_id: reader_id.to_string(),
                server: server.clone(),
                rows: batch,
                next_index: 0,
                is_last: queue.is_empty(),
                descriptor: self.descriptor.clone(),
            }
        }
    }

    #[async_trait]
    impl ChunkSource for ScriptedSource {
        async fn next_chunk(
            &self,
            server: &ServerAddress,
            reader_id: &str,
            _next_index: u64,
            chunk_size: usize,
        ) -> Result<ReaderChunk> {
            if self.lost.lock().contains(server) {
                return Err(Error::ConnectionLost {
                    server: server.to_string(),
                });
            }
            Ok(self.chunk(server, reader_id, chunk_size))
        }

        async fn dispose_reader(&self, _server: &ServerAddress, reader_id: &str) -> Result<()> {
            self.disposed.lock().push(reader_id.to_string());
            Ok(())
        }
    }

    fn setup(
        parts: Vec<Vec<i64>>,
        descriptor: ReaderDescriptor,
        chunk: usize,
    ) -> (Arc<ScriptedSource>, Arc<PartitionRegistry>, DistributedReader) {
        let mut source = ScriptedSource {
            descriptor,
            ..Default::default()
        };
        for (i, values) in parts.iter().enumerate() {
            let rows = values
                .iter()
                .map(|v| ReaderRow::new(Some(format!("k{}", v)), vec![json!(v)]))
                .collect();
            source
                .rows
                .get_mut()
                .insert((ServerAddress::new(format!("s{}", i)), "r".to_string()), rows);
        }
        let source = Arc::new(source);
        let registry = Arc::new(PartitionRegistry::new());
        let firsts = (0..parts.len())
            .map(|i| source.chunk(&ServerAddress::new(format!("s{}", i)), "r", chunk))
            .collect();
        let reader = DistributedReader::new(source.clone(), registry.clone(), firsts, chunk);
        (source, registry, reader)
    }

    async fn drain(reader: &mut DistributedReader) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(row) = reader.next_row().await.unwrap() {
            out.push(row.values[0].as_i64().unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_plain_merge_yields_every_row_once() {
        let (_, registry, mut reader) = setup(
            vec![vec![1, 2, 3, 4], vec![10, 11], vec![20, 21, 22]],
            ReaderDescriptor::plain(vec!["v".into()]),
            2,
        );
        assert_eq!(registry.open_total(), 2);

        let mut rows = drain(&mut reader).await;
        rows.sort();
        assert_eq!(rows, vec![1, 2, 3, 4, 10, 11, 20, 21, 22]);
        assert_eq!(registry.open_total(), 0);
        assert!(!reader.read().await.unwrap());
    }

    #[tokio::test]
    async fn test_ordered_merge_descending() {
        let descriptor = ReaderDescriptor {
            columns: vec!["v".into()],
            order_by: vec![OrderByColumn {
                column: 0,
                direction: SortDirection::Descending,
            }],
            group_by: vec![],
        };
        let (_, _, mut reader) = setup(vec![vec![9, 5, 1], vec![8, 7, 2], vec![6]], descriptor, 1);
        assert_eq!(drain(&mut reader).await, vec![9, 8, 7, 6, 5, 2, 1]);
    }

    #[tokio::test]
    async fn test_grouped_rows_are_contiguous() {
        let descriptor = ReaderDescriptor {
            columns: vec!["v".into()],
            order_by: vec![],
            group_by: vec![0],
        };
        let (_, _, mut reader) = setup(vec![vec![1, 2, 1], vec![2, 3, 1]], descriptor, 1);
        let rows = drain(&mut reader).await;
        assert_eq!(rows.len(), 6);
        // once a group ends it never reappears
        let mut seen = Vec::new();
        for v in rows {
            if seen.last() != Some(&v) {
                assert!(!seen.contains(&v), "group {} split", v);
                seen.push(v);
            }
        }
    }

    #[tokio::test]
    async fn test_close_disposes_open_partitions() {
        let (source, registry, mut reader) = setup(
            vec![vec![1, 2, 3], vec![4, 5, 6]],
            ReaderDescriptor::plain(vec!["v".into()]),
            1,
        );
        assert!(reader.read().await.unwrap());
        reader.close().await;

        assert_eq!(source.disposed.lock().len(), 2);
        assert_eq!(registry.open_total(), 0);
        assert!(matches!(reader.read().await, Err(Error::ReaderClosed(_))));
    }

    #[tokio::test]
    async fn test_connection_loss_during_fetch_drops_partition() {
        let (source, _, mut reader) = setup(
            vec![vec![1, 2, 3], vec![4, 5, 6]],
            ReaderDescriptor::plain(vec!["v".into()]),
            1,
        );
        source.lost.lock().push(ServerAddress::new("s1"));

        let mut rows = drain(&mut reader).await;
        rows.sort();
        // first chunk of s1 was buffered before the loss
        assert_eq!(rows, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stream_adapter() {
        use futures::StreamExt;

        let (_, _, reader) = setup(
            vec![vec![1, 2], vec![3]],
            ReaderDescriptor::plain(vec!["v".into()]),
            1,
        );
        let rows: Vec<_> = reader.into_stream().collect().await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.is_ok()));
    }
}
