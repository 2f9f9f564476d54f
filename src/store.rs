//! Per-replica book storage.
//!
//! Every chain process owns one [`Store`]: an insertion-ordered collection of
//! books, each tagged with a replication status. An entry is *dirty* while a
//! write for it is still travelling toward the tail, and *clean* once the
//! tail has acknowledged the value back upstream. Reads served from a clean
//! local entry are guaranteed to match the tail.

use serde::{Deserialize, Serialize};

/// A catalog item. Equality is by (name, price); the name is the natural key
/// within a [`Store`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub name: String,
    pub price: f64,
}

impl Book {
    pub fn new(name: impl Into<String>, price: f64) -> Self {
        Self {
            name: name.into(),
            price,
        }
    }
}

/// A book plus its replication status on this replica.
#[derive(Debug, Clone)]
pub struct Entry {
    pub book: Book,
    pub clean: bool,
}

/// Insertion-ordered book storage for a single chain process.
///
/// Invariant: at most one entry per book name. Insertion order is preserved
/// for display only; it carries no protocol meaning.
#[derive(Debug, Default)]
pub struct Store {
    entries: Vec<Entry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry for `book.name`.
    ///
    /// A new write always leaves the entry dirty, even when the incoming
    /// price equals the stored one: cleanliness certifies a specific write
    /// reached the tail, and this is a new write.
    pub fn upsert(&mut self, book: Book) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.book.name == book.name) {
            entry.book.price = book.price;
            entry.clean = false;
            return;
        }
        self.entries.push(Entry { book, clean: false });
    }

    /// Marks the entry for `name` clean. No-op when the name is absent.
    pub fn mark_clean(&mut self, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.book.name == name) {
            entry.clean = true;
        }
    }

    /// Looks up the entry for `name`.
    pub fn get(&self, name: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.book.name == name)
    }

    /// All books in insertion order.
    pub fn books(&self) -> Vec<Book> {
        self.entries.iter().map(|e| e.book.clone()).collect()
    }

    /// All entries in insertion order (used for status displays).
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_inserts_dirty_entry() {
        let mut store = Store::new();
        store.upsert(Book::new("dune", 9.99));

        let entry = store.get("dune").expect("entry present");
        assert_eq!(entry.book.price, 9.99);
        assert!(!entry.clean);
    }

    #[test]
    fn upsert_overwrites_price_and_dirties() {
        let mut store = Store::new();
        store.upsert(Book::new("dune", 9.99));
        store.mark_clean("dune");

        store.upsert(Book::new("dune", 12.50));
        let entry = store.get("dune").expect("entry present");
        assert_eq!(entry.book.price, 12.50);
        assert!(!entry.clean, "new write must invalidate cleanliness");
        assert_eq!(store.len(), 1, "name is unique within a store");
    }

    #[test]
    fn upsert_same_price_still_dirties() {
        let mut store = Store::new();
        store.upsert(Book::new("dune", 9.99));
        store.mark_clean("dune");

        store.upsert(Book::new("dune", 9.99));
        assert!(!store.get("dune").expect("entry present").clean);
    }

    #[test]
    fn mark_clean_missing_name_is_noop() {
        let mut store = Store::new();
        store.mark_clean("ghost");
        assert!(store.is_empty());
    }

    #[test]
    fn books_preserve_insertion_order() {
        let mut store = Store::new();
        store.upsert(Book::new("b", 2.0));
        store.upsert(Book::new("a", 1.0));
        store.upsert(Book::new("c", 3.0));
        store.upsert(Book::new("a", 1.5));

        let books = store.books();
        let names: Vec<&str> = books.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }
}
