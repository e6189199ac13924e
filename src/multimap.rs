//! `DiskMultiMap`: a persistent hash multimap over a `BinaryFile`.
//!
//! The file holds a `Header`, a bucket array of `Header::num_buckets` offsets, and a record area.
//! Each bucket threads two singly-linked lists through its records: a horizontal chain
//! (`next_key`) across distinct keys, and per-key vertical chains (`next_equal`) across records
//! sharing a key. Freed records are threaded onto a free list rooted at the header's `freespace`
//! offset and are reused by `insert` before the file is grown.

use std::collections::HashSet;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use quick_error::quick_error;
use slog::Logger;

use crate::binary_file::{self, BinaryFile};
use crate::record::{Header, Record, CHAR_LIMIT};

quick_error! {
    /// A `DiskMultiMap` operation error.
    #[derive(Debug)]
    pub enum Error {
        /// `key`, `value`, or `context` exceeded `CHAR_LIMIT` bytes.
        StringTooLong {
            display("string exceeds the {}-byte limit", CHAR_LIMIT)
            description("string too long")
        }
        /// The map has not been opened (via `create_new`/`open_existing`).
        NotOpen {
            display("map is not open")
            description("map is not open")
        }
        /// The underlying file is shorter than a valid header plus bucket array.
        Truncated {
            display("file is too short to hold the declared bucket array")
            description("truncated multimap file")
        }
        /// The underlying `BinaryFile` failed.
        Disk(err: binary_file::Error) {
            from()
            display("disk error: {}", err)
            description("disk error")
        }
    }
}

/// A persistent on-disk hash multimap.
pub struct DiskMultiMap {
    bf: BinaryFile,
    header: Header,
    open: bool,
    log: Logger,
}

impl Default for DiskMultiMap {
    fn default() -> Self {
        DiskMultiMap::new()
    }
}

impl DiskMultiMap {
    /// Create a map with a discarding logger. Use `with_logger` to attach a real drain.
    pub fn new() -> DiskMultiMap {
        DiskMultiMap {
            bf: BinaryFile::default(),
            header: Header::new(0),
            open: false,
            log: Logger::root(slog::Discard, o!()),
        }
    }

    /// Attach `logger` to this map, for `trace!`/`debug!` output on inserts, erases, and
    /// free-list activity.
    pub fn with_logger(logger: Logger) -> DiskMultiMap {
        DiskMultiMap {
            log: logger,
            ..DiskMultiMap::new()
        }
    }

    /// Initialize a new, empty map file at `path` with `num_buckets` bucket slots.
    pub fn create_new<P: AsRef<Path>>(&mut self, path: P, num_buckets: u32) -> Result<(), Error> {
        self.close();
        self.bf.create_new(path)?;

        let header = Header::new(num_buckets);
        self.bf.write_at(&header.encode(), 0)?;

        let zero_slot = [0u8; 8];
        for i in 0..num_buckets {
            self.bf.write_at(&zero_slot, header.bucket_slot_offset(i))?;
        }

        debug!(self.log, "created multimap"; "num_buckets" => num_buckets);
        self.header = header;
        self.open = true;
        Ok(())
    }

    /// Open an existing map file at `path`, loading its header. Does not validate the record
    /// area.
    pub fn open_existing<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        self.close();
        self.bf.open_existing(path)?;

        let mut buf = [0u8; crate::record::HEADER_SIZE as usize];
        self.bf.read_at(&mut buf, 0)?;
        let header = Header::decode(&buf);

        let min_len = header.record_area_base();
        if self.bf.file_length()? < min_len {
            self.bf.close();
            return Err(Error::Truncated);
        }

        debug!(self.log, "opened multimap"; "num_buckets" => header.num_buckets);
        self.header = header;
        self.open = true;
        Ok(())
    }

    /// Release the underlying file. Safe to call repeatedly and at drop.
    pub fn close(&mut self) {
        self.bf.close();
        self.open = false;
    }

    /// Whether `create_new`/`open_existing` has succeeded and `close` has not since been called.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Insert `(key, value, context)`.
    ///
    /// Prepends to the horizontal chain on a new key, or prepends within the vertical chain
    /// (just below the horizontal head) when `key` already has records in this bucket.
    pub fn insert(&mut self, key: &str, value: &str, context: &str) -> Result<(), Error> {
        check_lengths(key, value, context)?;
        if !self.open {
            return Err(Error::NotOpen);
        }

        let slot = self.alloc_slot()?;
        let bucket_offset = self.bucket_offset_for(key);
        let bucket_head = self.read_offset(bucket_offset)?;

        if bucket_head == 0 {
            // Empty bucket: new record is both the horizontal and vertical head.
            let record = Record::new(key, value, context, 0, 0);
            self.write_record(slot, &record)?;
            self.write_offset(bucket_offset, slot)?;
        } else {
            let mut cur_offset = bucket_head;
            let mut cur = self.read_record(cur_offset)?;
            let mut visited = HashSet::new();
            while cur.key != key {
                debug_assert_no_cycle(&mut visited, cur_offset);
                if cur.next_key == 0 {
                    break;
                }
                cur_offset = cur.next_key;
                cur = self.read_record(cur_offset)?;
            }

            if cur.key == key {
                // Equal key found: prepend within the vertical chain, below the horizontal head.
                let record = Record::new(key, value, context, 0, cur.next_equal);
                self.write_record(slot, &record)?;
                cur.next_equal = slot;
                self.write_record(cur_offset, &cur)?;
            } else {
                // No equal key: prepend to the horizontal chain.
                let record = Record::new(key, value, context, bucket_head, 0);
                self.write_record(slot, &record)?;
                self.write_offset(bucket_offset, slot)?;
            }
        }

        trace!(self.log, "inserted record"; "key" => key, "slot" => slot);
        Ok(())
    }

    /// Search for `key`, returning an iterator positioned at the horizontal-chain node for that
    /// key (the head of its vertical chain), or an invalid iterator if `key` is absent or a
    /// precondition is violated.
    pub fn search(&self, key: &str) -> Result<Iter<'_>, Error> {
        if !self.open || key.len() > CHAR_LIMIT {
            return Ok(Iter::invalid(self));
        }

        let bucket_offset = self.bucket_offset_for(key);
        let bucket_head = self.read_offset(bucket_offset)?;
        if bucket_head == 0 {
            return Ok(Iter::invalid(self));
        }

        let mut cur_offset = bucket_head;
        let mut cur = self.read_record(cur_offset)?;
        let mut visited = HashSet::new();
        while cur.key != key {
            debug_assert_no_cycle(&mut visited, cur_offset);
            if cur.next_key == 0 {
                return Ok(Iter::invalid(self));
            }
            cur_offset = cur.next_key;
            cur = self.read_record(cur_offset)?;
        }

        Ok(Iter::at(self, cur_offset))
    }

    /// Remove every record matching the exact `(key, value, context)` triple, returning how many
    /// were removed (normally 0 or 1 in a well-formed map).
    pub fn erase(&mut self, key: &str, value: &str, context: &str) -> Result<usize, Error> {
        if key.len() > CHAR_LIMIT || value.len() > CHAR_LIMIT || context.len() > CHAR_LIMIT {
            return Ok(0);
        }
        if !self.open {
            return Ok(0);
        }

        let bucket_offset = self.bucket_offset_for(key);
        let bucket_head = self.read_offset(bucket_offset)?;
        if bucket_head == 0 {
            return Ok(0);
        }

        // Locate the horizontal-chain node for `key`, remembering the preceding horizontal node
        // (`prev`/`prev_offset`, left zeroed if `key`'s node is already the bucket's own
        // horizontal head). `prev`/`prev_offset` are carried unchanged into the vertical-removal
        // walk below; the walk advances them but never re-seeds them from the bucket head.
        let mut cur_offset = bucket_head;
        let mut cur = self.read_record(cur_offset)?;
        let mut prev_offset: u64 = 0;
        let mut prev = Record::new("", "", "", 0, 0);
        let mut visited = HashSet::new();
        while cur.key != key {
            debug_assert_no_cycle(&mut visited, cur_offset);
            if cur.next_key == 0 {
                return Ok(0);
            }
            prev_offset = cur_offset;
            prev = cur.clone();
            cur_offset = cur.next_key;
            cur = self.read_record(cur_offset)?;
        }

        let mut erased = 0usize;
        let mut visited = HashSet::new();

        loop {
            debug_assert_no_cycle(&mut visited, cur_offset);
            if cur.value == value && cur.context == context {
                if bucket_head == cur_offset {
                    // Case A: match is the current horizontal head.
                    if cur.next_equal != 0 {
                        let mut promoted = self.read_record(cur.next_equal)?;
                        promoted.next_key = cur.next_key;
                        self.write_record(cur.next_equal, &promoted)?;
                        self.write_offset(bucket_offset, cur.next_equal)?;
                    } else {
                        self.write_offset(bucket_offset, cur.next_key)?;
                    }
                } else if prev.next_key == cur_offset {
                    // Case B: cur is the head of a separate vertical chain within the bucket.
                    if cur.next_equal != 0 {
                        let mut promoted = self.read_record(cur.next_equal)?;
                        promoted.next_key = cur.next_key;
                        self.write_record(cur.next_equal, &promoted)?;
                        prev.next_key = cur.next_equal;
                    } else {
                        prev.next_key = cur.next_key;
                    }
                    self.write_record(prev_offset, &prev)?;
                } else {
                    // Case C: cur is a non-head node of prev's vertical chain.
                    prev.next_equal = cur.next_equal;
                    self.write_record(prev_offset, &prev)?;
                }

                let next = cur.next_equal;
                self.free_slot(cur_offset, &mut cur)?;
                erased += 1;

                if next == 0 {
                    break;
                }
                cur_offset = next;
                cur = self.read_record(cur_offset)?;
            } else {
                prev_offset = cur_offset;
                prev = cur.clone();

                let next = cur.next_equal;
                if next == 0 {
                    break;
                }
                cur_offset = next;
                cur = self.read_record(cur_offset)?;
            }
        }

        trace!(self.log, "erased records"; "key" => key, "count" => erased);
        Ok(erased)
    }

    /// Total number of distinct (key, value, context) records currently stored, obtained by
    /// summing over every bucket's horizontal and vertical chains. Intended for tests and
    /// diagnostics, not the hot path.
    #[cfg(test)]
    pub fn len(&self) -> Result<usize, Error> {
        let mut count = 0;
        for i in 0..self.header.num_buckets {
            let mut cur_offset = self.read_offset(self.header.bucket_slot_offset(i))?;
            while cur_offset != 0 {
                let cur = self.read_record(cur_offset)?;
                count += 1;
                let mut eq = cur.next_equal;
                while eq != 0 {
                    let node = self.read_record(eq)?;
                    count += 1;
                    eq = node.next_equal;
                }
                cur_offset = cur.next_key;
            }
        }
        Ok(count)
    }

    fn bucket_offset_for(&self, key: &str) -> u64 {
        let h = seahash::hash(key.as_bytes());
        let index = (h % self.header.num_buckets as u64) as u32;
        self.header.bucket_slot_offset(index)
    }

    /// Pop a slot off the free list, or grow the file, returning its offset.
    fn alloc_slot(&mut self) -> Result<u64, Error> {
        if self.header.freespace != 0 {
            let slot = self.header.freespace;
            let freed = self.read_record(slot)?;
            self.header.freespace = freed.next_key;
            self.write_header()?;
            trace!(self.log, "reused freed slot"; "slot" => slot);
            Ok(slot)
        } else {
            let slot = self.bf.file_length()?;
            Ok(slot)
        }
    }

    /// Push `offset` (whose content is `record`) onto the free list.
    fn free_slot(&mut self, offset: u64, record: &mut Record) -> Result<(), Error> {
        record.next_key = self.header.freespace;
        self.header.freespace = offset;
        self.write_record(offset, record)?;
        self.write_header()?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), Error> {
        self.bf.write_at(&self.header.encode(), 0)?;
        Ok(())
    }

    fn read_offset(&self, at: u64) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.bf.read_at(&mut buf, at)?;
        Ok(LittleEndian::read_u64(&buf))
    }

    fn write_offset(&self, at: u64, value: u64) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, value);
        self.bf.write_at(&buf, at)?;
        Ok(())
    }

    fn read_record(&self, at: u64) -> Result<Record, Error> {
        let mut buf = [0u8; crate::record::RECORD_SIZE as usize];
        self.bf.read_at(&mut buf, at)?;
        Ok(Record::decode(&buf))
    }

    fn write_record(&self, at: u64, record: &Record) -> Result<(), Error> {
        self.bf.write_at(&record.encode(), at)?;
        Ok(())
    }
}

fn check_lengths(key: &str, value: &str, context: &str) -> Result<(), Error> {
    if key.len() > CHAR_LIMIT || value.len() > CHAR_LIMIT || context.len() > CHAR_LIMIT {
        Err(Error::StringTooLong)
    } else {
        Ok(())
    }
}

/// Panics in debug builds if `offset` has already been visited, catching a corrupted (cyclic)
/// chain early rather than looping forever.
fn debug_assert_no_cycle(visited: &mut HashSet<u64>, offset: u64) {
    debug_assert!(
        visited.insert(offset),
        "cycle detected while walking a multimap chain at offset {}",
        offset
    );
}

/// A `(key, value, context)` triple yielded by [`Iter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Triple {
    pub key: String,
    pub value: String,
    pub context: String,
}

/// An iterator over a vertical (equal-key) chain produced by [`DiskMultiMap::search`].
///
/// Invalidated by any mutation of the underlying map; do not interleave mutation with iteration
/// on the same iterator.
pub struct Iter<'a> {
    map: &'a DiskMultiMap,
    offset: u64,
    cache: Triple,
    cache_offset: Option<u64>,
}

impl<'a> Iter<'a> {
    fn invalid(map: &'a DiskMultiMap) -> Iter<'a> {
        Iter {
            map,
            offset: 0,
            cache: Triple::default(),
            cache_offset: None,
        }
    }

    fn at(map: &'a DiskMultiMap, offset: u64) -> Iter<'a> {
        Iter {
            map,
            offset,
            cache: Triple::default(),
            cache_offset: None,
        }
    }

    /// Whether this iterator is positioned at a live record.
    pub fn is_valid(&self) -> bool {
        self.offset != 0
    }

    /// Read the triple this iterator is currently positioned at. Returns an empty triple if
    /// invalid. Caches the decoded triple until `advance` moves the offset.
    pub fn get(&mut self) -> Result<&Triple, Error> {
        if !self.is_valid() {
            self.cache = Triple::default();
            self.cache_offset = Some(self.offset);
        } else if self.cache_offset != Some(self.offset) {
            let record = self.map.read_record(self.offset)?;
            self.cache = Triple {
                key: record.key,
                value: record.value,
                context: record.context,
            };
            self.cache_offset = Some(self.offset);
        }
        Ok(&self.cache)
    }

    /// Advance to the next record in the vertical chain. No-op if already invalid.
    pub fn advance(&mut self) -> Result<(), Error> {
        if !self.is_valid() {
            return Ok(());
        }
        let record = self.map.read_record(self.offset)?;
        self.offset = record.next_equal;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn opened(num_buckets: u32) -> (DiskMultiMap, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.dat");
        let mut map = DiskMultiMap::new();
        map.create_new(&path, num_buckets).unwrap();
        (map, dir)
    }

    #[test]
    fn with_logger_accepts_a_real_drain() {
        use slog::Drain;

        let decorator = slog_term::PlainDecorator::new(std::io::sink());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let logger = slog::Logger::root(drain, o!());

        let dir = tempdir().unwrap();
        let path = dir.path().join("map.dat");
        let mut map = DiskMultiMap::with_logger(logger);
        map.create_new(&path, 4).unwrap();
        map.insert("a", "1", "ctx").unwrap();
        assert!(map.search("a").unwrap().is_valid());
    }

    fn collect_values(map: &DiskMultiMap, key: &str) -> Vec<String> {
        let mut it = map.search(key).unwrap();
        let mut out = Vec::new();
        while it.is_valid() {
            out.push(it.get().unwrap().value.clone());
            it.advance().unwrap();
        }
        out
    }

    #[test]
    fn insert_then_search_round_trips() {
        let (mut map, _dir) = opened(4);
        map.insert("a", "1", "ctx").unwrap();
        map.insert("b", "2", "ctx").unwrap();

        let mut it = map.search("a").unwrap();
        assert!(it.is_valid());
        let t = it.get().unwrap().clone();
        assert_eq!(t.key, "a");
        assert_eq!(t.value, "1");
        assert_eq!(t.context, "ctx");
        it.advance().unwrap();
        assert!(!it.is_valid());

        assert!(!map.search("nope").unwrap().is_valid());
    }

    #[test]
    fn search_returns_every_value_for_a_repeated_key() {
        let (mut map, _dir) = opened(4);
        map.insert("k", "first", "ctx").unwrap();
        map.insert("k", "second", "ctx").unwrap();
        map.insert("k", "third", "ctx").unwrap();

        let mut values = collect_values(&map, "k");
        values.sort();
        assert_eq!(values, vec!["first", "second", "third"]);
    }

    #[test]
    fn erase_removes_exact_triple_and_frees_its_slot_for_reuse() {
        let (mut map, _dir) = opened(4);
        map.insert("k", "v1", "ctx").unwrap();
        map.insert("k", "v2", "ctx").unwrap();
        assert_eq!(map.len().unwrap(), 2);

        let erased = map.erase("k", "v1", "ctx").unwrap();
        assert_eq!(erased, 1);
        assert_eq!(map.len().unwrap(), 1);
        assert_eq!(collect_values(&map, "k"), vec!["v2"]);

        // Erasing an absent triple is a no-op, not an error.
        assert_eq!(map.erase("k", "v1", "ctx").unwrap(), 0);

        let len_before = map.len().unwrap();
        map.insert("other", "v3", "ctx").unwrap();
        assert_eq!(map.len().unwrap(), len_before + 1);
    }

    #[test]
    fn erase_handles_bucket_head_middle_and_tail_of_vertical_chain() {
        let (mut map, _dir) = opened(1);
        map.insert("k", "head", "ctx").unwrap();
        map.insert("k", "middle", "ctx").unwrap();
        map.insert("k", "tail", "ctx").unwrap();

        assert_eq!(map.erase("k", "middle", "ctx").unwrap(), 1);
        let mut values = collect_values(&map, "k");
        values.sort();
        assert_eq!(values, vec!["head", "tail"]);

        assert_eq!(map.erase("k", "head", "ctx").unwrap(), 1);
        assert_eq!(collect_values(&map, "k"), vec!["tail"]);

        assert_eq!(map.erase("k", "tail", "ctx").unwrap(), 1);
        assert!(!map.search("k").unwrap().is_valid());
    }

    #[test]
    fn erase_separate_vertical_chain_within_a_shared_bucket() {
        // Force two distinct keys into the same bucket.
        let (mut map, _dir) = opened(1);
        map.insert("x", "x1", "ctx").unwrap();
        map.insert("y", "y1", "ctx").unwrap();
        map.insert("y", "y2", "ctx").unwrap();

        assert_eq!(map.erase("y", "y1", "ctx").unwrap(), 1);
        assert_eq!(collect_values(&map, "y"), vec!["y2"]);
        assert_eq!(collect_values(&map, "x"), vec!["x1"]);
    }

    #[test]
    fn oversize_strings_are_rejected_or_treated_as_absent() {
        let (mut map, _dir) = opened(4);
        let too_long = "x".repeat(CHAR_LIMIT + 1);

        assert!(matches!(
            map.insert(&too_long, "v", "ctx"),
            Err(Error::StringTooLong)
        ));
        assert!(!map.search(&too_long).unwrap().is_valid());
        assert_eq!(map.erase(&too_long, "v", "ctx").unwrap(), 0);
    }

    #[test]
    fn operations_on_a_closed_map_fail_cleanly() {
        let mut map = DiskMultiMap::new();
        assert!(matches!(
            map.insert("k", "v", "ctx"),
            Err(Error::NotOpen)
        ));
        assert!(!map.search("k").unwrap().is_valid());
        assert_eq!(map.erase("k", "v", "ctx").unwrap(), 0);
    }

    #[test]
    fn data_persists_across_close_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("map.dat");

        {
            let mut map = DiskMultiMap::new();
            map.create_new(&path, 4).unwrap();
            map.insert("k", "v", "ctx").unwrap();
        }

        let mut map = DiskMultiMap::new();
        map.open_existing(&path).unwrap();
        assert_eq!(collect_values(&map, "k"), vec!["v"]);
        map.insert("k2", "v2", "ctx").unwrap();
        assert_eq!(collect_values(&map, "k2"), vec!["v2"]);
    }
}
