//! In-memory item sources.

use crate::error::ItemError;
use crate::execution::Position;
use crate::item::{ItemCursor, ItemSource};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Replays a vector of records. Position `n` is the `n`-th record.
///
/// ```
/// use ironbatch::testing::VecSource;
/// use ironbatch::{ItemCursor, ItemError, ItemSource, Position};
///
/// let source = VecSource::new(vec!["a", "b", "c"]).fail_at(1, ItemError::malformed("bad row"));
/// let mut cursor = source.open(Some(Position(1))).unwrap();
/// assert!(cursor.next().unwrap().is_err());
/// assert_eq!(cursor.next().unwrap().unwrap(), "c");
/// assert_eq!(source.opens(), vec![Some(Position(1))]);
/// ```
pub struct VecSource<T> {
    items: Arc<Vec<T>>,
    failures: Arc<BTreeMap<u64, ItemError>>,
    opens: Mutex<Vec<Option<Position>>>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(items),
            failures: Arc::new(BTreeMap::new()),
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Reports `error` instead of the record at `index`. The record still counts
    /// as read, as a malformed line would.
    #[must_use]
    pub fn fail_at(mut self, index: u64, error: ItemError) -> Self {
        Arc::make_mut(&mut self.failures).insert(index, error);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The `resume_from` argument of every `open` call so far.
    #[must_use]
    pub fn opens(&self) -> Vec<Option<Position>> {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl<T> ItemSource for VecSource<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Item = T;
    type Cursor = VecCursor<T>;

    fn open(&self, resume_from: Option<Position>) -> Result<VecCursor<T>, ItemError> {
        self.opens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(resume_from);

        let start = resume_from.unwrap_or(Position::START);
        if start.0 > self.items.len() as u64 {
            return Err(ItemError::invalid(format!(
                "cannot resume at {start}, source has {} records",
                self.items.len()
            )));
        }
        Ok(VecCursor {
            items: Arc::clone(&self.items),
            failures: Arc::clone(&self.failures),
            position: start,
        })
    }
}

/// Cursor over a [`VecSource`].
pub struct VecCursor<T> {
    items: Arc<Vec<T>>,
    failures: Arc<BTreeMap<u64, ItemError>>,
    position: Position,
}

impl<T: Clone> ItemCursor for VecCursor<T> {
    type Item = T;

    fn next(&mut self) -> Option<Result<T, ItemError>> {
        let index = self.position.0;
        let item = self.items.get(usize::try_from(index).ok()?)?;
        self.position = self.position.next();
        match self.failures.get(&index) {
            Some(error) => Some(Err(error.clone())),
            None => Some(Ok(item.clone())),
        }
    }

    fn position(&self) -> Position {
        self.position
    }
}
