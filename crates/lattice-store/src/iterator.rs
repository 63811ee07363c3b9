//! The relationship iterator contract.
//!
//! Iterators are finite and forward-only. `close` is mandatory and
//! idempotent; every use after close reports the closed-iterator error.
//! In debug builds, dropping an iterator without closing it panics, which
//! catches leaked iterators in tests before they ship.

use lattice_types::Relationship;

use crate::error::StoreError;
use crate::options::{Cursor, SortOrder};

/// A finite, forward-only sequence of relationships.
pub trait RelationshipIterator: Send {
    /// The next relationship, or `None` at the end of the sequence or
    /// after a deferred error.
    fn next(&mut self) -> Option<Relationship>;

    /// Any deferred error, including use-after-close.
    fn err(&self) -> Option<&StoreError>;

    /// A resumable position. Only defined when the query had a sort order
    /// and at least one row has been produced.
    fn cursor(&self) -> Result<Cursor, StoreError>;

    /// Release the iterator. Mandatory, idempotent.
    fn close(&mut self);
}

/// An iterator over rows materialized from a snapshot.
pub struct BufferedIterator {
    items: std::vec::IntoIter<Relationship>,
    order: SortOrder,
    limit: Option<u64>,
    produced: u64,
    last: Option<Relationship>,
    closed: bool,
    err: Option<StoreError>,
}

impl BufferedIterator {
    pub fn new(items: Vec<Relationship>, order: SortOrder, limit: Option<u64>) -> Self {
        Self {
            items: items.into_iter(),
            order,
            limit,
            produced: 0,
            last: None,
            closed: false,
            err: None,
        }
    }

    /// An iterator that reports the given error on first use.
    pub fn errored(err: StoreError) -> Self {
        Self {
            items: Vec::new().into_iter(),
            order: SortOrder::Unsorted,
            limit: None,
            produced: 0,
            last: None,
            closed: false,
            err: Some(err),
        }
    }
}

impl RelationshipIterator for BufferedIterator {
    fn next(&mut self) -> Option<Relationship> {
        if self.closed || self.err.is_some() {
            return None;
        }

        if let Some(limit) = self.limit {
            if self.produced >= limit {
                return None;
            }
        }

        let rel = self.items.next()?;
        self.produced += 1;
        self.last = Some(rel.clone());
        Some(rel)
    }

    fn err(&self) -> Option<&StoreError> {
        self.err.as_ref()
    }

    fn cursor(&self) -> Result<Cursor, StoreError> {
        if self.closed {
            return Err(StoreError::ClosedIterator);
        }
        if self.order == SortOrder::Unsorted {
            return Err(StoreError::CursorsWithoutSorting);
        }
        self.last.clone().ok_or(StoreError::EmptyCursor)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.err = Some(StoreError::ClosedIterator);
        }
    }
}

impl Drop for BufferedIterator {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        if !self.closed && !std::thread::panicking() {
            panic!("relationship iterator dropped before close() was called");
        }
    }
}

/// Drains an iterator into a vector, closing it and surfacing any
/// deferred error.
pub fn collect_all(
    mut iter: Box<dyn RelationshipIterator>,
) -> Result<Vec<Relationship>, StoreError> {
    let mut out = Vec::new();
    while let Some(rel) = iter.next() {
        out.push(rel);
    }
    let deferred = iter.err().map(|e| StoreError::Internal(e.to_string()));
    iter.close();
    match deferred {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rels(n: usize) -> Vec<Relationship> {
        (0..n)
            .map(|i| Relationship::new("document", format!("doc-{i}"), "viewer", "user", "alice"))
            .collect()
    }

    #[test]
    fn produces_all_then_ends() {
        let mut iter = BufferedIterator::new(rels(3), SortOrder::Unsorted, None);
        let mut count = 0;
        while iter.next().is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(iter.err().is_none());
        iter.close();
    }

    #[test]
    fn limit_bounds_production() {
        let mut iter = BufferedIterator::new(rels(5), SortOrder::Unsorted, Some(2));
        assert!(iter.next().is_some());
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
        iter.close();
    }

    #[test]
    fn closed_iterator_reports_error() {
        let mut iter = BufferedIterator::new(rels(3), SortOrder::ByResource, None);
        iter.next();
        iter.close();
        assert!(iter.next().is_none());
        assert!(matches!(iter.err(), Some(StoreError::ClosedIterator)));
        assert!(matches!(iter.cursor(), Err(StoreError::ClosedIterator)));
        // Idempotent.
        iter.close();
        assert!(matches!(iter.err(), Some(StoreError::ClosedIterator)));
    }

    #[test]
    fn cursor_rules() {
        let mut iter = BufferedIterator::new(rels(2), SortOrder::ByResource, None);
        assert!(matches!(iter.cursor(), Err(StoreError::EmptyCursor)));
        let first = iter.next().unwrap();
        assert_eq!(iter.cursor().unwrap(), first);
        iter.close();

        let mut unsorted = BufferedIterator::new(rels(2), SortOrder::Unsorted, None);
        unsorted.next();
        assert!(matches!(unsorted.cursor(), Err(StoreError::CursorsWithoutSorting)));
        unsorted.close();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "dropped before close")]
    fn dropping_unclosed_iterator_panics_in_debug() {
        let iter = BufferedIterator::new(rels(1), SortOrder::Unsorted, None);
        drop(iter);
    }
}
