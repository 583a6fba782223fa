//! The Index type: `{$id, key, type, attributes[], lengths[], orders[]}`
//! (§3 Index).

use crate::query::SortOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Key,
    Unique,
    Fulltext,
}

/// Sentinel used in `lengths` when a string attribute's declared size
/// equals the adapter's index-length limit — the adapter indexes the full
/// column rather than a prefix (§4.2 "Index create/delete/rename").
pub const INDEX_LENGTH_UNBOUNDED: Option<u32> = None;

#[derive(Debug, Clone)]
pub struct Index {
    pub id: String,
    pub key: String,
    pub index_type: IndexType,
    pub attributes: Vec<String>,
    pub lengths: Vec<Option<u32>>,
    pub orders: Vec<Option<SortOrder>>,
}

impl Index {
    pub fn new(key: impl Into<String>, index_type: IndexType, attributes: Vec<String>) -> Self {
        let key = key.into();
        let n = attributes.len();
        Self {
            id: key.clone(),
            key,
            index_type,
            attributes,
            lengths: vec![None; n],
            orders: vec![None; n],
        }
    }

    pub fn single_key(attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self::new(format!("idx_{attribute}"), IndexType::Key, vec![attribute])
    }

    pub fn single_unique(attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self::new(format!("idx_unique_{attribute}"), IndexType::Unique, vec![attribute])
    }

    pub fn references(&self, attribute_key: &str) -> bool {
        self.attributes.iter().any(|a| a == attribute_key)
    }

    /// Renames every occurrence of `old_key` to `new_key` within this
    /// index's attribute list (§4.2 "renameAttribute").
    pub fn rename_attribute(&mut self, old_key: &str, new_key: &str) {
        for attr in &mut self.attributes {
            if attr == old_key {
                *attr = new_key.to_string();
            }
        }
    }

    /// Removes `attribute_key` from this index (and its paired
    /// `lengths`/`orders` slot), shrinking a composite index rather than
    /// destroying it (§4.2 "deleteAttribute": "prunes it from every index,
    /// deleting indexes that become empty"). The caller drops the index
    /// once `attributes` is empty.
    pub fn prune_attribute(&mut self, attribute_key: &str) {
        if let Some(pos) = self.attributes.iter().position(|a| a == attribute_key) {
            self.attributes.remove(pos);
            self.lengths.remove(pos);
            self.orders.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_key_index_has_one_attribute() {
        let idx = Index::single_key("email");
        assert_eq!(idx.attributes, vec!["email".to_string()]);
        assert_eq!(idx.index_type, IndexType::Key);
    }

    #[test]
    fn rename_attribute_updates_matching_entries_only() {
        let mut idx = Index::new("idx_compound", IndexType::Key, vec!["a".into(), "b".into()]);
        idx.rename_attribute("a", "renamed");
        assert_eq!(idx.attributes, vec!["renamed".to_string(), "b".to_string()]);
    }

    #[test]
    fn prune_attribute_shrinks_composite_index() {
        let mut idx = Index::new("idx_compound", IndexType::Key, vec!["a".into(), "b".into(), "c".into()]);
        idx.lengths[1] = Some(10);
        idx.prune_attribute("b");
        assert_eq!(idx.attributes, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(idx.lengths, vec![None, None]);
    }
}
