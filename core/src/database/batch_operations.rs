use std::{fmt, num::NonZeroUsize, ops::Range};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// The type of batch operation to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchOperationType {
    Insert,
    Update,
    Delete,
}

impl BatchOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchOperationType::Insert => "insert",
            BatchOperationType::Update => "update",
            BatchOperationType::Delete => "delete",
        }
    }

    /// Rows are keyed by primary key for everything except inserts.
    pub fn targets_existing_rows(&self) -> bool {
        !matches!(self, BatchOperationType::Insert)
    }
}

impl fmt::Display for BatchOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reserved SQL keywords that need quoting.
pub const RESERVED_KEYWORDS: &[&str] =
    &["group", "user", "order", "table", "index", "primary", "key"];

/// A contiguous slice of the caller's entities, identified by its position in the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: usize,
    pub range: Range<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    pub fn rows<'a, E>(&self, entities: &'a [E]) -> &'a [E] {
        &entities[self.range.clone()]
    }
}

pub fn batch_count(total: usize, batch_size: NonZeroUsize) -> usize {
    total.div_ceil(batch_size.get())
}

/// Splits `total` rows into `ceil(total / batch_size)` batches, in input order.
pub fn partition(total: usize, batch_size: NonZeroUsize, first_batch_id: usize) -> Vec<Batch> {
    let size = batch_size.get();
    (0..batch_count(total, batch_size))
        .map(|index| {
            let start = index * size;
            Batch { id: first_batch_id + index, range: start..usize::min(start + size, total) }
        })
        .collect()
}

/// SQL text for one batch, consumed once by the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedStatement {
    pub sql: String,
    pub operation: BatchOperationType,
    pub batch_id: usize,
    pub entity: String,
    pub rows: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Idle,
    Batching,
    Generating,
    Executing,
    Committed,
    RolledBack,
}

impl WriteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteState::Committed | WriteState::RolledBack)
    }

    pub fn can_transition_to(&self, next: WriteState) -> bool {
        use WriteState::*;

        matches!(
            (self, next),
            (Idle, Batching)
                | (Batching, Generating)
                | (Generating, Executing)
                | (Executing, Committed)
                | (Executing, RolledBack)
                // nothing to write
                | (Idle, Committed)
        )
    }
}

/// Outcome of a committed bulk write. Failures are reported through `BulkWriteError` and always
/// mean nothing was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub rows_affected: u64,
    pub statements_executed: usize,
    pub batches: usize,
    pub state: WriteState,
}

impl WriteResult {
    pub fn empty() -> Self {
        WriteResult {
            rows_affected: 0,
            statements_executed: 0,
            batches: 0,
            state: WriteState::Committed,
        }
    }

    pub fn success(&self) -> bool {
        self.state == WriteState::Committed
    }
}
