//! Item I/O capabilities consumed by chunk-oriented steps.
//!
//! A step is assembled from three collaborators:
//!
//! - an [`ItemSource`], opened into an [`ItemCursor`] that yields raw records in order
//!   and can be re-opened at any position it previously reported;
//! - an [`ItemTransform`], a side-effect-free mapping that may drop a record by
//!   returning `Ok(None)`;
//! - an [`ItemSink`], which commits a whole batch atomically.
//!
//! Concrete file formats and databases plug in by implementing these traits; see
//! [`crate::io`] for CSV and JSON Lines implementations.

use crate::error::ItemError;
use crate::execution::Position;

/// A finite, ordered, re-seekable record source.
pub trait ItemSource: Send + Sync {
    type Item: Send + 'static;
    type Cursor: ItemCursor<Item = Self::Item>;

    /// Opens a cursor at `resume_from`, or at the first record when `None`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying resource cannot be opened or positioned.
    fn open(&self, resume_from: Option<Position>) -> Result<Self::Cursor, ItemError>;
}

/// An open read handle over an [`ItemSource`].
pub trait ItemCursor {
    type Item;

    /// Returns the next record, `None` at end of source.
    ///
    /// A record that cannot be decoded yields `Some(Err(_))`; the cursor has
    /// already moved past it, so the caller may continue reading.
    fn next(&mut self) -> Option<Result<Self::Item, ItemError>>;

    /// Number of raw records consumed so far.
    fn position(&self) -> Position;
}

/// Record-level transformation applied between source and sink.
///
/// Returning `Ok(None)` filters the record out of its chunk. Implementations
/// must not touch execution state; they can be re-run on restart.
pub trait ItemTransform<I>: Send + Sync {
    type Output: Send + 'static;

    /// # Errors
    ///
    /// Returns an error classified by the step's skip policy.
    fn apply(&self, item: I) -> Result<Option<Self::Output>, ItemError>;
}

/// Atomic batch writer.
///
/// `commit` must be all-or-nothing over the batch and safe to call again with
/// the same batch after a failure.
pub trait ItemSink<O>: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when nothing from the batch was persisted.
    fn commit(&self, batch: &[O]) -> Result<(), ItemError>;
}

/// Identity transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl<I: Send + 'static> ItemTransform<I> for PassThrough {
    type Output = I;

    fn apply(&self, item: I) -> Result<Option<I>, ItemError> {
        Ok(Some(item))
    }
}

/// Adapts a closure into an [`ItemTransform`].
pub struct FnTransform<F>(pub F);

impl<I, O, F> ItemTransform<I> for FnTransform<F>
where
    O: Send + 'static,
    F: Fn(I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    type Output = O;

    fn apply(&self, item: I) -> Result<Option<O>, ItemError> {
        (self.0)(item)
    }
}

/// Adapts a closure into an [`ItemSink`].
pub struct FnSink<F>(pub F);

impl<O, F> ItemSink<O> for FnSink<F>
where
    F: Fn(&[O]) -> Result<(), ItemError> + Send + Sync,
{
    fn commit(&self, batch: &[O]) -> Result<(), ItemError> {
        (self.0)(batch)
    }
}

impl<O, S: ItemSink<O> + ?Sized> ItemSink<O> for std::sync::Arc<S> {
    fn commit(&self, batch: &[O]) -> Result<(), ItemError> {
        (**self).commit(batch)
    }
}

impl<S: ItemSource + ?Sized> ItemSource for std::sync::Arc<S> {
    type Item = S::Item;
    type Cursor = S::Cursor;

    fn open(&self, resume_from: Option<Position>) -> Result<Self::Cursor, ItemError> {
        (**self).open(resume_from)
    }
}
