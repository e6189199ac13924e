//! `IntelWeb`, a bidirectional threat-intel crawl engine built on two [`DiskMultiMap`]s.
//!
//! `forward` stores `(from, to, context)`: "`from` created `to`". `reverse` stores the same
//! observation the other way around, `(to, from, context)`: "`to` was created by `from`". Having
//! both directions lets a crawl discover malicious entities regardless of which role (initiator or
//! target) the known-bad indicator played in a given telemetry line.

use std::collections::{BTreeSet, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use quick_error::quick_error;
use slog::Logger;

use crate::multimap::{self, DiskMultiMap, Triple};

quick_error! {
    /// An `IntelWeb` operation error.
    #[derive(Debug)]
    pub enum Error {
        /// The web has not been opened.
        NotOpen {
            display("intel web is not open")
            description("intel web is not open")
        }
        /// The `forward` map failed.
        Forward(err: multimap::Error) {
            display("forward map error: {}", err)
            description("forward map error")
        }
        /// The `reverse` map failed.
        Reverse(err: multimap::Error) {
            display("reverse map error: {}", err)
            description("reverse map error")
        }
        /// Reading the telemetry file during `ingest` failed.
        Io(err: io::Error) {
            from()
            display("I/O error: {}", err)
            description("I/O error")
        }
        /// A search/iterator operation failed during `crawl`; which map it came from is not
        /// tracked separately since both are probed symmetrically at every step.
        Crawl(err: multimap::Error) {
            display("crawl error: {}", err)
            description("crawl error")
        }
    }
}

/// An observed telemetry event: `from` acted on `to` within `context`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractionTuple {
    pub from: String,
    pub to: String,
    pub context: String,
}

impl InteractionTuple {
    fn new(from: &str, to: &str, context: &str) -> InteractionTuple {
        InteractionTuple {
            from: from.to_string(),
            to: to.to_string(),
            context: context.to_string(),
        }
    }

    /// The sort key: lexicographic on `(context, from, to)`, per the crate's interaction total
    /// order.
    fn sort_key(&self) -> (&str, &str, &str) {
        (&self.context, &self.from, &self.to)
    }
}

impl PartialOrd for InteractionTuple {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InteractionTuple {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Two `DiskMultiMap`s addressing the same telemetry from both directions.
pub struct IntelWeb {
    forward: DiskMultiMap,
    reverse: DiskMultiMap,
    open: bool,
    log: Logger,
}

impl Default for IntelWeb {
    fn default() -> Self {
        IntelWeb::new()
    }
}

impl IntelWeb {
    pub fn new() -> IntelWeb {
        IntelWeb {
            forward: DiskMultiMap::new(),
            reverse: DiskMultiMap::new(),
            open: false,
            log: Logger::root(slog::Discard, o!()),
        }
    }

    pub fn with_logger(logger: Logger) -> IntelWeb {
        IntelWeb {
            forward: DiskMultiMap::with_logger(logger.new(o!("map" => "forward"))),
            reverse: DiskMultiMap::with_logger(logger.new(o!("map" => "reverse"))),
            open: false,
            log: logger,
        }
    }

    /// Create `{prefix}_forward_hash_table.dat` and `{prefix}_reverse_hash_table.dat`, sized for
    /// `max_data_items` at a 0.75 load factor. Closes both maps if either fails to create.
    pub fn create_new<P: AsRef<Path>>(&mut self, prefix: P, max_data_items: u32) -> Result<(), Error> {
        self.close();

        const LOAD_FACTOR: f64 = 0.75;
        let num_buckets = (max_data_items as f64 / LOAD_FACTOR).ceil() as u32;

        let prefix = prefix.as_ref();
        let forward_path = forward_path(prefix);
        let reverse_path = reverse_path(prefix);

        if let Err(err) = self.forward.create_new(&forward_path, num_buckets) {
            self.close();
            return Err(Error::Forward(err));
        }
        if let Err(err) = self.reverse.create_new(&reverse_path, num_buckets) {
            self.close();
            return Err(Error::Reverse(err));
        }

        debug!(self.log, "created intel web"; "num_buckets" => num_buckets);
        self.open = true;
        Ok(())
    }

    /// Open both maps for `prefix`. Closes both if either fails to open.
    pub fn open_existing<P: AsRef<Path>>(&mut self, prefix: P) -> Result<(), Error> {
        self.close();

        let prefix = prefix.as_ref();
        if let Err(err) = self.forward.open_existing(forward_path(prefix)) {
            self.close();
            return Err(Error::Forward(err));
        }
        if let Err(err) = self.reverse.open_existing(reverse_path(prefix)) {
            self.close();
            return Err(Error::Reverse(err));
        }

        self.open = true;
        Ok(())
    }

    /// Close both maps unconditionally.
    pub fn close(&mut self) {
        self.forward.close();
        self.reverse.close();
        self.open = false;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Ingest whitespace-tokenized `context from to` lines from `path`. Lines with fewer than
    /// three tokens are skipped silently. Aborts (leaving prior lines' inserts in place) on the
    /// first insert failure.
    pub fn ingest<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        if !self.open {
            return Err(Error::NotOpen);
        }

        let file = File::open(path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            let mut tokens = line.split_whitespace();
            let (context, from, to) = match (tokens.next(), tokens.next(), tokens.next()) {
                (Some(context), Some(from), Some(to)) => (context, from, to),
                _ => {
                    trace!(self.log, "skipping malformed ingest line"; "line" => line.as_str());
                    continue;
                }
            };

            self.forward
                .insert(from, to, context)
                .map_err(Error::Forward)?;
            self.reverse
                .insert(to, from, context)
                .map_err(Error::Reverse)?;
        }

        Ok(())
    }

    /// Breadth-first expansion from `indicators`: an entity is "bad" once it is reachable from a
    /// known-bad indicator through the ingested telemetry, and is further expanded only while its
    /// combined forward+reverse prevalence stays under `min_prevalence_to_be_good`. Returns how
    /// many entities were newly marked bad during this call; `out_entities` and
    /// `out_interactions` are replaced (not appended to) with the full, ordered result.
    pub fn crawl(
        &self,
        indicators: &[String],
        min_prevalence_to_be_good: u32,
        out_entities: &mut Vec<String>,
        out_interactions: &mut Vec<InteractionTuple>,
    ) -> Result<u32, Error> {
        out_entities.clear();
        out_interactions.clear();
        if !self.open {
            return Ok(0);
        }

        let mut bad_entities: BTreeSet<String> = BTreeSet::new();
        let mut bad_interactions: BTreeSet<InteractionTuple> = BTreeSet::new();
        let mut queue: VecDeque<String> = indicators.iter().cloned().collect();
        let mut discovered = 0u32;

        while let Some(cur) = queue.pop_front() {
            // Probe the forward map: `cur` as the initiator of recorded interactions.
            let mut it = self.forward.search(&cur).map_err(Error::Crawl)?;
            if it.is_valid() && bad_entities.insert(cur.clone()) {
                discovered += 1;
                self.drain_matches(&mut it, &cur, true, min_prevalence_to_be_good, &mut bad_interactions, &mut queue)?;

                let mut rev_it = self.reverse.search(&cur).map_err(Error::Crawl)?;
                self.drain_matches(&mut rev_it, &cur, false, min_prevalence_to_be_good, &mut bad_interactions, &mut queue)?;
            }

            // Probe the reverse map: `cur` as the target, i.e. "created by" some initiator.
            let mut it = self.reverse.search(&cur).map_err(Error::Crawl)?;
            if it.is_valid() && bad_entities.insert(cur.clone()) {
                discovered += 1;
                self.drain_matches(&mut it, &cur, false, min_prevalence_to_be_good, &mut bad_interactions, &mut queue)?;

                let mut fwd_it = self.forward.search(&cur).map_err(Error::Crawl)?;
                self.drain_matches(&mut fwd_it, &cur, true, min_prevalence_to_be_good, &mut bad_interactions, &mut queue)?;
            }
        }

        out_entities.extend(bad_entities);
        out_interactions.extend(bad_interactions);
        debug!(self.log, "crawl complete";
               "entities" => out_entities.len(), "interactions" => out_interactions.len());
        Ok(discovered)
    }

    /// Walk `it` to completion, recording an interaction per record and enqueueing any neighbor
    /// entity whose combined prevalence is under `threshold`.
    fn drain_matches(
        &self,
        it: &mut multimap::Iter<'_>,
        anchor: &str,
        anchor_is_from: bool,
        threshold: u32,
        bad_interactions: &mut BTreeSet<InteractionTuple>,
        queue: &mut VecDeque<String>,
    ) -> Result<(), Error> {
        while it.is_valid() {
            let Triple { value, context, .. } = it.get().map_err(Error::Crawl)?.clone();

            let interaction = if anchor_is_from {
                InteractionTuple::new(anchor, &value, &context)
            } else {
                InteractionTuple::new(&value, anchor, &context)
            };
            bad_interactions.insert(interaction);

            if self.prevalence_under_threshold(&value, threshold)? {
                queue.push_back(value);
            }

            it.advance().map_err(Error::Crawl)?;
        }
        Ok(())
    }

    /// Remove every record touching `entity`, in both maps and both recorded roles (as the
    /// canonical key, and as the swapped-role "child creating parent" pair). Collects target
    /// triples before erasing anything, so a `search` iterator is never mutated mid-walk.
    pub fn purge(&mut self, entity: &str) -> Result<bool, Error> {
        if !self.open {
            return Ok(false);
        }

        let forward_hits = self.collect(self.forward.search(entity).map_err(Error::Forward)?)?;
        let reverse_hits = self.collect(self.reverse.search(entity).map_err(Error::Reverse)?)?;

        let mut purged = false;

        for m in &forward_hits {
            purged = true;
            self.forward
                .erase(&m.key, &m.value, &m.context)
                .map_err(Error::Forward)?;
            self.reverse
                .erase(&m.value, &m.key, &m.context)
                .map_err(Error::Reverse)?;
            // Child-creating-parent: the same pair may also have been recorded with roles
            // swapped.
            self.forward
                .erase(&m.value, &m.key, &m.context)
                .map_err(Error::Forward)?;
            self.reverse
                .erase(&m.key, &m.value, &m.context)
                .map_err(Error::Reverse)?;
        }

        for m in &reverse_hits {
            purged = true;
            self.reverse
                .erase(&m.key, &m.value, &m.context)
                .map_err(Error::Reverse)?;
            self.forward
                .erase(&m.value, &m.key, &m.context)
                .map_err(Error::Forward)?;
            self.reverse
                .erase(&m.value, &m.key, &m.context)
                .map_err(Error::Reverse)?;
            self.forward
                .erase(&m.key, &m.value, &m.context)
                .map_err(Error::Forward)?;
        }

        trace!(self.log, "purged entity"; "entity" => entity, "purged" => purged);
        Ok(purged)
    }

    /// Whether `key`'s combined forward+reverse record count is strictly under `threshold`. May
    /// short-circuit before counting every record.
    fn prevalence_under_threshold(&self, key: &str, threshold: u32) -> Result<bool, Error> {
        let mut count = 0u32;

        let mut it = self.forward.search(key).map_err(Error::Forward)?;
        while it.is_valid() {
            count += 1;
            if count >= threshold {
                return Ok(false);
            }
            it.advance().map_err(Error::Forward)?;
        }

        let mut it = self.reverse.search(key).map_err(Error::Reverse)?;
        while it.is_valid() {
            count += 1;
            if count >= threshold {
                return Ok(false);
            }
            it.advance().map_err(Error::Reverse)?;
        }

        Ok(count < threshold)
    }

    fn collect(&self, mut it: multimap::Iter<'_>) -> Result<Vec<Triple>, Error> {
        let mut out = Vec::new();
        while it.is_valid() {
            out.push(it.get().map_err(Error::Crawl)?.clone());
            it.advance().map_err(Error::Crawl)?;
        }
        Ok(out)
    }
}

fn forward_path(prefix: &Path) -> std::path::PathBuf {
    with_suffix(prefix, "_forward_hash_table.dat")
}

fn reverse_path(prefix: &Path) -> std::path::PathBuf {
    with_suffix(prefix, "_reverse_hash_table.dat")
}

fn with_suffix(prefix: &Path, suffix: &str) -> std::path::PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    std::path::PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn ingested(lines: &[&str]) -> (IntelWeb, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let prefix = dir.path().join("web");

        let telemetry_path = dir.path().join("telemetry.txt");
        let mut file = File::create(&telemetry_path).unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        drop(file);

        let mut web = IntelWeb::new();
        web.create_new(&prefix, 64).unwrap();
        web.ingest(&telemetry_path).unwrap();
        (web, dir)
    }

    #[test]
    fn ingest_skips_malformed_lines_and_populates_both_directions() {
        let (web, _dir) = ingested(&["process a b", "short line", "process c d"]);

        let mut entities = Vec::new();
        let mut interactions = Vec::new();
        let discovered = web
            .crawl(&["a".to_string()], 1000, &mut entities, &mut interactions)
            .unwrap();
        assert_eq!(discovered, 2);
        assert_eq!(entities, vec!["a", "b"]);
        assert_eq!(
            interactions,
            vec![InteractionTuple::new("a", "b", "process")]
        );
    }

    #[test]
    fn crawl_expands_outward_through_both_maps_while_under_threshold() {
        // a -> b -> c, all under the same context, low prevalence everywhere.
        let (web, _dir) = ingested(&["ctx a b", "ctx b c"]);

        let mut entities = Vec::new();
        let mut interactions = Vec::new();
        web.crawl(&["a".to_string()], 1000, &mut entities, &mut interactions)
            .unwrap();

        assert_eq!(entities, vec!["a", "b", "c"]);
        assert_eq!(
            interactions,
            vec![
                InteractionTuple::new("a", "b", "ctx"),
                InteractionTuple::new("b", "c", "ctx"),
            ]
        );
    }

    #[test]
    fn crawl_does_not_expand_past_a_prevalent_entity() {
        // b is created by many distinct parents, so it is too prevalent to expand through.
        let (web, _dir) = ingested(&[
            "ctx a b", "ctx p1 b", "ctx p2 b", "ctx p3 b", "ctx b c",
        ]);

        let mut entities = Vec::new();
        let mut interactions = Vec::new();
        web.crawl(&["a".to_string()], 2, &mut entities, &mut interactions)
            .unwrap();

        // b is reached (it is bad, being linked from a known-bad indicator) but its own
        // high prevalence stops the crawl from continuing on to c.
        assert!(entities.contains(&"b".to_string()));
        assert!(!entities.contains(&"c".to_string()));
    }

    #[test]
    fn crawl_on_unknown_indicator_finds_nothing() {
        let (web, _dir) = ingested(&["ctx a b"]);

        let mut entities = Vec::new();
        let mut interactions = Vec::new();
        let discovered = web
            .crawl(&["nobody".to_string()], 1000, &mut entities, &mut interactions)
            .unwrap();

        assert_eq!(discovered, 0);
        assert!(entities.is_empty());
        assert!(interactions.is_empty());
    }

    #[test]
    fn purge_removes_an_entity_from_both_directions() {
        let (mut web, _dir) = ingested(&["ctx a b", "ctx b c"]);

        assert!(web.purge("b").unwrap());

        let mut entities = Vec::new();
        let mut interactions = Vec::new();
        web.crawl(&["a".to_string()], 1000, &mut entities, &mut interactions)
            .unwrap();

        // a -> b is gone, so the crawl from a no longer reaches b or c.
        assert_eq!(entities, vec!["a"]);
        assert!(interactions.is_empty());

        // Purging an entity with no recorded interactions is a no-op.
        assert!(!web.purge("b").unwrap());
    }

    #[test]
    fn purge_on_a_closed_web_returns_false() {
        let mut web = IntelWeb::new();
        assert!(!web.purge("anything").unwrap());
    }
}
