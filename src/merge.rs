use log::info;
use std::collections::{HashMap, HashSet};

use crate::dataset::TabularDataset;

/// An ordered set of loaded tables plus the rows produced by merging them on
/// a key column.
///
/// `merged_rows` stays empty until a merge key that belongs to the common
/// headers has been applied; it is cleared whenever the table set changes.
#[derive(Debug, Default)]
pub struct MultiTableCollection {
    tables: Vec<TabularDataset>,
    merged_rows: Vec<HashMap<String, String>>,
}

impl MultiTableCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&mut self, table: TabularDataset) {
        self.tables.push(table);
        self.merged_rows.clear();
    }

    pub fn remove_table(&mut self, index: usize) -> Option<TabularDataset> {
        if index >= self.tables.len() {
            return None;
        }
        self.merged_rows.clear();
        Some(self.tables.remove(index))
    }

    pub fn clear(&mut self) {
        self.tables.clear();
        self.merged_rows.clear();
    }

    pub fn tables(&self) -> &[TabularDataset] {
        &self.tables
    }

    pub fn total_row_count(&self) -> usize {
        self.tables.iter().map(|t| t.row_count()).sum()
    }

    /// Headers present in every table, in first-table order.
    pub fn common_headers(&self) -> Vec<String> {
        let Some(first) = self.tables.first() else {
            return Vec::new();
        };
        first
            .headers
            .iter()
            .filter(|h| self.tables[1..].iter().all(|t| t.headers.contains(h)))
            .cloned()
            .collect()
    }

    /// Headers present in any table, in order of first appearance.
    pub fn all_headers(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut headers = Vec::new();
        for table in &self.tables {
            for header in &table.headers {
                if seen.insert(header.clone()) {
                    headers.push(header.clone());
                }
            }
        }
        headers
    }

    pub fn merged_rows(&self) -> &[HashMap<String, String>] {
        &self.merged_rows
    }

    /// Outer-joins every table's rows on `key_column` and stores the result.
    ///
    /// Rows whose trimmed key value is empty cannot be merged and are
    /// excluded. Key values keep the order of their first appearance across
    /// tables in insertion order. When the same column carries conflicting
    /// values, the later table (by insertion order) wins; within one table,
    /// the later row wins. Selecting an empty key or one that is not a common
    /// header clears the merged rows entirely.
    ///
    /// Returns the number of merged rows. Recomputing with the same inputs is
    /// deterministic and idempotent.
    pub fn merge(&mut self, key_column: &str) -> usize {
        self.merged_rows.clear();
        if key_column.is_empty() || !self.common_headers().iter().any(|h| h == key_column) {
            return 0;
        }

        // Per-table index: key value -> rows sharing that key, in row order.
        let mut indexes: Vec<HashMap<&str, Vec<&HashMap<String, String>>>> = Vec::new();
        let mut key_order: Vec<&str> = Vec::new();
        let mut seen_keys: HashSet<&str> = HashSet::new();
        for table in &self.tables {
            let mut index: HashMap<&str, Vec<&HashMap<String, String>>> = HashMap::new();
            for row in &table.rows {
                let key = row.get(key_column).map(|v| v.trim()).unwrap_or("");
                if key.is_empty() {
                    continue;
                }
                index.entry(key).or_default().push(row);
                if seen_keys.insert(key) {
                    key_order.push(key);
                }
            }
            indexes.push(index);
        }

        let mut merged = Vec::new();
        for key in key_order {
            let mut record: HashMap<String, String> = HashMap::new();
            let mut contributed = false;
            for index in &indexes {
                let Some(rows) = index.get(key) else { continue };
                for row in rows {
                    for (column, value) in row.iter() {
                        record.insert(column.clone(), value.clone());
                    }
                    contributed = true;
                }
            }
            // should not occur given the index construction, but guard anyway
            if contributed {
                merged.push(record);
            }
        }

        info!(
            "merged {} tables on '{}': {} rows",
            self.tables.len(),
            key_column,
            merged.len()
        );
        self.merged_rows = merged;
        self.merged_rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(label: &str, headers: &[&str], rows: &[&[&str]]) -> TabularDataset {
        TabularDataset {
            headers: headers.iter().map(|h| h.to_string()).collect(),
            rows: rows
                .iter()
                .map(|row| {
                    headers
                        .iter()
                        .zip(row.iter())
                        .map(|(h, v)| (h.to_string(), v.to_string()))
                        .collect()
                })
                .collect(),
            source_label: label.to_string(),
        }
    }

    #[test]
    fn test_merge_outer_join() {
        let mut collection = MultiTableCollection::new();
        collection.add_table(table(
            "a",
            &["id", "name"],
            &[&["1", "Alice"], &["2", "Bob"]],
        ));
        collection.add_table(table(
            "b",
            &["id", "score"],
            &[&["2", "95"], &["3", "80"]],
        ));

        assert_eq!(collection.common_headers(), vec!["id"]);
        assert_eq!(collection.all_headers(), vec!["id", "name", "score"]);

        let count = collection.merge("id");
        assert_eq!(count, 3);
        let rows = collection.merged_rows();
        // key order follows first appearance across insertion-order tables
        assert_eq!(rows[0]["id"], "1");
        assert_eq!(rows[0]["name"], "Alice");
        assert!(rows[0].get("score").is_none());
        assert_eq!(rows[1]["id"], "2");
        assert_eq!(rows[1]["name"], "Bob");
        assert_eq!(rows[1]["score"], "95");
        assert_eq!(rows[2]["id"], "3");
        assert_eq!(rows[2]["score"], "80");
    }

    #[test]
    fn test_merge_is_deterministic() {
        let mut collection = MultiTableCollection::new();
        collection.add_table(table(
            "a",
            &["id", "name"],
            &[&["2", "Bob"], &["1", "Alice"]],
        ));
        collection.add_table(table("b", &["id", "city"], &[&["1", "Paris"]]));

        collection.merge("id");
        let first: Vec<_> = collection.merged_rows().to_vec();
        collection.merge("id");
        assert_eq!(collection.merged_rows(), &first[..]);
    }

    #[test]
    fn test_merge_last_write_wins() {
        let mut collection = MultiTableCollection::new();
        collection.add_table(table("a", &["key", "name"], &[&["1", "Alice"]]));
        collection.add_table(table("b", &["key", "name"], &[&["1", "Bob"]]));

        collection.merge("key");
        assert_eq!(collection.merged_rows()[0]["name"], "Bob");
    }

    #[test]
    fn test_merge_skips_empty_keys() {
        let mut collection = MultiTableCollection::new();
        collection.add_table(table(
            "a",
            &["id", "name"],
            &[&["", "NoKey"], &[" ", "Blank"], &["1", "Alice"]],
        ));
        collection.add_table(table("b", &["id"], &[&["1"]]));

        let count = collection.merge("id");
        assert_eq!(count, 1);
        assert_eq!(collection.merged_rows()[0]["name"], "Alice");
    }

    #[test]
    fn test_merge_with_invalid_key_clears_rows() {
        let mut collection = MultiTableCollection::new();
        collection.add_table(table("a", &["id", "name"], &[&["1", "Alice"]]));
        collection.add_table(table("b", &["other"], &[&["x"]]));

        collection.merge("id"); // not a common header
        assert!(collection.merged_rows().is_empty());
        collection.merge("");
        assert!(collection.merged_rows().is_empty());
    }

    #[test]
    fn test_adding_table_clears_merged_rows() {
        let mut collection = MultiTableCollection::new();
        collection.add_table(table("a", &["id"], &[&["1"]]));
        collection.merge("id");
        assert_eq!(collection.merged_rows().len(), 1);
        collection.add_table(table("b", &["id"], &[&["2"]]));
        assert!(collection.merged_rows().is_empty());
    }
}
