use std::collections::HashMap;

/// Ordered string table of a profile.
///
/// Ids are positions in the table, as `profile.proto` expects, and entry 0
/// is always the empty string. Insertion order is kept so identical
/// profiles encode to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    entries: Vec<String>,
    index: HashMap<String, i64>,
}

impl Default for StringTable {
    fn default() -> Self {
        Self {
            entries: vec![String::new()],
            index: HashMap::from([(String::new(), 0)]),
        }
    }
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a table from decoded entries. An empty input yields the
    /// default table; a first entry other than `""` is rejected.
    pub fn from_entries(entries: Vec<String>) -> Option<Self> {
        if entries.is_empty() {
            return Some(Self::new());
        }
        if !entries[0].is_empty() {
            return None;
        }
        let mut index = HashMap::with_capacity(entries.len());
        for (id, s) in entries.iter().enumerate() {
            // Duplicates keep their first id.
            index.entry(s.clone()).or_insert(id as i64);
        }
        Some(Self { entries, index })
    }

    /// Returns the id of `s`, appending it on first use.
    pub fn intern(&mut self, s: &str) -> i64 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }
        let id = self.entries.len() as i64;
        self.entries.push(s.to_string());
        self.index.insert(s.to_string(), id);
        id
    }

    pub fn resolve(&self, id: i64) -> Option<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|i| self.entries.get(i))
            .map(String::as_str)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Number of strings, including the leading empty one.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_follow_insertion_order() {
        let mut table = StringTable::new();
        assert_eq!(table.resolve(0), Some(""));
        assert_eq!(table.intern("cpu-sampler"), 1);
        assert_eq!(table.intern("relay-stdout"), 2);
        assert_eq!(table.intern("cpu-sampler"), 1);
        assert_eq!(table.intern(""), 0);
        assert_eq!(table.len(), 3);
        assert_eq!(table.resolve(2), Some("relay-stdout"));
        assert_eq!(table.resolve(3), None);
        assert_eq!(table.resolve(-1), None);
    }

    #[test]
    fn test_distinct_strings_never_share_an_id() {
        let mut table = StringTable::new();
        let ids: Vec<i64> = (0..1000).map(|i| table.intern(&format!("thread-{}", i))).collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn test_from_entries() {
        let table = StringTable::from_entries(vec!["".into(), "heap".into(), "bytes".into()]).unwrap();
        let mut rebuilt = StringTable::new();
        rebuilt.intern("heap");
        rebuilt.intern("bytes");
        assert_eq!(table, rebuilt);

        assert!(StringTable::from_entries(vec!["heap".into()]).is_none());
        assert_eq!(StringTable::from_entries(Vec::new()), Some(StringTable::new()));
    }
}
