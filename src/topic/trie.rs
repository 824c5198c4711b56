//! Topic trie indexing subscription filters by level
//!
//! Literal levels are children keyed by `CompactString`; `+` and `#` have
//! dedicated slots so matching a topic only visits branches that can match.
//! Empty branches are pruned on removal.

use ahash::AHashMap;
use compact_str::CompactString;
use smallvec::SmallVec;

#[derive(Debug)]
struct TrieNode<V> {
    /// Value for a filter ending at this node
    value: Option<V>,
    children: AHashMap<CompactString, TrieNode<V>>,
    /// `+` child
    single_wildcard: Option<Box<TrieNode<V>>>,
    /// Value for a filter ending in `#` at this node
    multi_wildcard: Option<V>,
}

impl<V> TrieNode<V> {
    fn new() -> Self {
        Self {
            value: None,
            children: AHashMap::new(),
            single_wildcard: None,
            multi_wildcard: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.value.is_none()
            && self.multi_wildcard.is_none()
            && self.single_wildcard.is_none()
            && self.children.is_empty()
    }
}

impl<V> Default for TrieNode<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Filter-keyed trie with wildcard-aware topic matching
#[derive(Debug)]
pub struct TopicTrie<V> {
    root: TrieNode<V>,
    len: usize,
}

impl<V> TopicTrie<V> {
    pub fn new() -> Self {
        Self {
            root: TrieNode::new(),
            len: 0,
        }
    }

    /// Number of filters holding a value
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slot for `filter`, creating the path if needed
    fn slot_mut(&mut self, filter: &str) -> &mut Option<V> {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => return &mut node.multi_wildcard,
                "+" => {
                    node = node
                        .single_wildcard
                        .get_or_insert_with(|| Box::new(TrieNode::new()))
                }
                _ => node = node.children.entry(CompactString::new(level)).or_default(),
            }
        }
        &mut node.value
    }

    /// Insert a value for a filter, returning the previous one
    pub fn insert(&mut self, filter: &str, value: V) -> Option<V> {
        let previous = self.slot_mut(filter).replace(value);
        if previous.is_none() {
            self.len += 1;
        }
        previous
    }

    /// Value for `filter`, inserting `V::default()` when absent
    pub fn get_or_default(&mut self, filter: &str) -> &mut V
    where
        V: Default,
    {
        let slot = self.slot_mut(filter);
        if slot.is_none() {
            self.len += 1;
        }
        // re-borrow after updating len
        self.slot_mut(filter).get_or_insert_with(V::default)
    }

    pub fn get_mut(&mut self, filter: &str) -> Option<&mut V> {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            match level {
                "#" => return node.multi_wildcard.as_mut(),
                "+" => node = node.single_wildcard.as_deref_mut()?,
                _ => node = node.children.get_mut(level)?,
            }
        }
        node.value.as_mut()
    }

    /// Remove a filter, pruning branches left empty
    pub fn remove(&mut self, filter: &str) -> Option<V> {
        let levels: SmallVec<[&str; 8]> = filter.split('/').collect();
        let removed = Self::remove_recursive(&mut self.root, &levels);
        if removed.is_some() {
            self.len -= 1;
        }
        removed
    }

    fn remove_recursive(node: &mut TrieNode<V>, levels: &[&str]) -> Option<V> {
        let Some((&level, rest)) = levels.split_first() else {
            return node.value.take();
        };

        match level {
            "#" => node.multi_wildcard.take(),
            "+" => {
                let child = node.single_wildcard.as_deref_mut()?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.single_wildcard = None;
                }
                removed
            }
            _ => {
                let child = node.children.get_mut(level)?;
                let removed = Self::remove_recursive(child, rest);
                if child.is_empty() {
                    node.children.remove(level);
                }
                removed
            }
        }
    }

    /// Apply `f` to every value; values for which it returns true are removed
    pub fn remove_by_predicate<F>(&mut self, mut f: F)
    where
        F: FnMut(&mut V) -> bool,
    {
        let removed = Self::remove_by_predicate_recursive(&mut self.root, &mut f);
        self.len -= removed;
    }

    fn remove_by_predicate_recursive<F>(node: &mut TrieNode<V>, f: &mut F) -> usize
    where
        F: FnMut(&mut V) -> bool,
    {
        let mut removed = 0;

        if node.value.as_mut().is_some_and(|v| f(v)) {
            node.value = None;
            removed += 1;
        }
        if node.multi_wildcard.as_mut().is_some_and(|v| f(v)) {
            node.multi_wildcard = None;
            removed += 1;
        }
        if let Some(child) = node.single_wildcard.as_deref_mut() {
            removed += Self::remove_by_predicate_recursive(child, f);
            if child.is_empty() {
                node.single_wildcard = None;
            }
        }
        node.children.retain(|_, child| {
            removed += Self::remove_by_predicate_recursive(child, f);
            !child.is_empty()
        });

        removed
    }

    /// Call `callback` with the value of every filter matching `topic`
    pub fn matches<F>(&self, topic: &str, mut callback: F)
    where
        F: FnMut(&V),
    {
        let levels: SmallVec<[&str; 8]> = topic.split('/').collect();
        let is_dollar = topic.starts_with('$');
        Self::matches_recursive(&self.root, &levels, 0, is_dollar, &mut callback);
    }

    fn matches_recursive<F>(
        node: &TrieNode<V>,
        levels: &[&str],
        index: usize,
        is_dollar: bool,
        callback: &mut F,
    ) where
        F: FnMut(&V),
    {
        // wildcards at the first level never match $ topics
        let wildcards = !(is_dollar && index == 0);

        if wildcards {
            if let Some(ref v) = node.multi_wildcard {
                callback(v);
            }
        }

        let Some(level) = levels.get(index) else {
            if let Some(ref v) = node.value {
                callback(v);
            }
            return;
        };

        if wildcards {
            if let Some(ref child) = node.single_wildcard {
                Self::matches_recursive(child, levels, index + 1, is_dollar, callback);
            }
        }
        if let Some(child) = node.children.get(*level) {
            Self::matches_recursive(child, levels, index + 1, is_dollar, callback);
        }
    }

    /// Visit every stored value
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&V),
    {
        Self::for_each_recursive(&self.root, &mut f);
    }

    fn for_each_recursive<F>(node: &TrieNode<V>, f: &mut F)
    where
        F: FnMut(&V),
    {
        if let Some(ref v) = node.value {
            f(v);
        }
        if let Some(ref v) = node.multi_wildcard {
            f(v);
        }
        if let Some(ref child) = node.single_wildcard {
            Self::for_each_recursive(child, f);
        }
        for child in node.children.values() {
            Self::for_each_recursive(child, f);
        }
    }
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}
