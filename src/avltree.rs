//! Ordered map backing the flow indices.
//!
//! An AVL tree whose nodes carry a key plus the list of values inserted
//! under that key, in insertion order. Re-inserting a value that is already
//! present under its key is a no-op, which is what deduplicates flows, and
//! what makes top-N tie-breaking deterministic: values under an equal key
//! come back in the order they went in.

use smallvec::SmallVec;

struct Node<K, V> {
    key: K,
    values: SmallVec<[V; 1]>,
    height: i32,
    left: Option<Box<Node<K, V>>>,
    right: Option<Box<Node<K, V>>>,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V) -> Box<Self> {
        let mut values = SmallVec::new();
        values.push(value);
        Box::new(Node {
            key,
            values,
            height: 1,
            left: None,
            right: None,
        })
    }
}

/// Self-balancing ordered map from `K` to one or more values.
pub struct Tree<K, V> {
    root: Option<Box<Node<K, V>>>,
    len: usize,
}

impl<K, V> Default for Tree<K, V> {
    fn default() -> Self {
        Tree { root: None, len: 0 }
    }
}

fn height<K, V>(node: &Option<Box<Node<K, V>>>) -> i32 {
    node.as_ref().map_or(0, |n| n.height)
}

fn update_height<K, V>(node: &mut Node<K, V>) {
    node.height = 1 + height(&node.left).max(height(&node.right));
}

fn balance_factor<K, V>(node: &Node<K, V>) -> i32 {
    height(&node.left) - height(&node.right)
}

fn rotate_right<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let mut new_root = node.left.take().expect("rotate_right without left child");
    node.left = new_root.right.take();
    update_height(&mut node);
    new_root.right = Some(node);
    update_height(&mut new_root);
    new_root
}

fn rotate_left<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    let mut new_root = node.right.take().expect("rotate_left without right child");
    node.right = new_root.left.take();
    update_height(&mut node);
    new_root.left = Some(node);
    update_height(&mut new_root);
    new_root
}

fn rebalance<K, V>(mut node: Box<Node<K, V>>) -> Box<Node<K, V>> {
    update_height(&mut node);
    let bf = balance_factor(&node);
    if bf > 1 {
        if balance_factor(node.left.as_ref().unwrap()) < 0 {
            node.left = Some(rotate_left(node.left.take().unwrap()));
        }
        return rotate_right(node);
    }
    if bf < -1 {
        if balance_factor(node.right.as_ref().unwrap()) > 0 {
            node.right = Some(rotate_right(node.right.take().unwrap()));
        }
        return rotate_left(node);
    }
    node
}

impl<K: Ord, V: Clone + PartialEq> Tree<K, V> {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Number of values stored (not distinct keys).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `value` under `key`. An equal key keeps its node; the value is
    /// appended unless an equal value is already recorded under that key.
    pub fn insert(&mut self, key: K, value: V) {
        let root = self.root.take();
        let mut inserted = false;
        self.root = Some(Self::insert_node(root, key, value, &mut inserted));
        if inserted {
            self.len += 1;
        }
    }

    fn insert_node(
        node: Option<Box<Node<K, V>>>,
        key: K,
        value: V,
        inserted: &mut bool,
    ) -> Box<Node<K, V>> {
        let mut node = match node {
            None => {
                *inserted = true;
                return Node::new(key, value);
            }
            Some(n) => n,
        };

        match key.cmp(&node.key) {
            std::cmp::Ordering::Less => {
                node.left = Some(Self::insert_node(node.left.take(), key, value, inserted));
            }
            std::cmp::Ordering::Greater => {
                node.right = Some(Self::insert_node(node.right.take(), key, value, inserted));
            }
            std::cmp::Ordering::Equal => {
                if !node.values.contains(&value) {
                    node.values.push(value);
                    *inserted = true;
                }
                return node;
            }
        }
        rebalance(node)
    }

    /// Values stored under `key`, in insertion order. Empty slice if absent.
    pub fn get(&self, key: &K) -> &[V] {
        let mut cur = self.root.as_deref();
        while let Some(node) = cur {
            match key.cmp(&node.key) {
                std::cmp::Ordering::Less => cur = node.left.as_deref(),
                std::cmp::Ordering::Greater => cur = node.right.as_deref(),
                std::cmp::Ordering::Equal => return &node.values,
            }
        }
        &[]
    }

    pub fn contains(&self, key: &K) -> bool {
        !self.get(key).is_empty()
    }

    /// In-order traversal. The visitor sees every value, smallest key first,
    /// values under one key in insertion order.
    pub fn each<F: FnMut(&K, &V)>(&self, mut f: F) {
        Self::each_node(self.root.as_deref(), &mut f);
    }

    fn each_node<F: FnMut(&K, &V)>(node: Option<&Node<K, V>>, f: &mut F) {
        if let Some(n) = node {
            Self::each_node(n.left.as_deref(), f);
            for v in &n.values {
                f(&n.key, v);
            }
            Self::each_node(n.right.as_deref(), f);
        }
    }

    /// All values, smallest key first.
    pub fn dump(&self) -> Vec<V> {
        let mut out = Vec::with_capacity(self.len);
        self.each(|_, v| out.push(v.clone()));
        out
    }

    /// The `n` values under the largest keys, largest key first. Values
    /// sharing a key are emitted in insertion order.
    pub fn top_n(&self, n: usize) -> Vec<V> {
        let mut out = Vec::with_capacity(n.min(self.len));
        Self::top_n_node(self.root.as_deref(), n, &mut out);
        out
    }

    fn top_n_node(node: Option<&Node<K, V>>, n: usize, out: &mut Vec<V>) {
        let Some(node) = node else { return };
        Self::top_n_node(node.right.as_deref(), n, out);
        for v in &node.values {
            if out.len() >= n {
                return;
            }
            out.push(v.clone());
        }
        Self::top_n_node(node.left.as_deref(), n, out);
    }
}

impl<K: Ord + Clone, V: Clone + PartialEq> Tree<K, V> {
    /// Entries present in every input tree, compared by key and value.
    ///
    /// The smallest input is iterated and each of its entries is kept iff all
    /// other inputs contain it. No inputs yields an empty tree; a single
    /// input comes back as-is; any empty input empties the result.
    pub fn intersection(trees: &[&Tree<K, V>]) -> Tree<K, V> {
        let mut result = Tree::new();
        let Some(smallest) = trees.iter().min_by_key(|t| t.len()) else {
            return result;
        };
        if smallest.is_empty() {
            return result;
        }

        smallest.each(|key, value| {
            let everywhere = trees
                .iter()
                .all(|t| std::ptr::eq(*t, *smallest) || t.get(key).contains(value));
            if everywhere {
                result.insert(key.clone(), value.clone());
            }
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_from(keys: &[i64]) -> Tree<i64, i64> {
        let mut t = Tree::new();
        for &k in keys {
            t.insert(k, k);
        }
        t
    }

    #[test]
    fn test_insert_and_dump_sorted() {
        let t = tree_from(&[5, 3, 8, 1, 4, 9, 2, 7, 6]);
        assert_eq!(t.dump(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(t.len(), 9);
    }

    #[test]
    fn test_insert_sequential_stays_balanced() {
        // 1024 ascending inserts degenerate to a list without rotations;
        // a sane height keeps the recursive traversals shallow.
        let mut t = Tree::new();
        for k in 0i64..1024 {
            t.insert(k, k);
        }
        assert_eq!(t.len(), 1024);
        assert_eq!(t.dump().len(), 1024);
        assert_eq!(t.top_n(3), vec![1023, 1022, 1021]);
    }

    #[test]
    fn test_duplicate_value_is_noop() {
        let mut t: Tree<i64, i64> = Tree::new();
        t.insert(1, 10);
        t.insert(1, 10);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get(&1), &[10]);
    }

    #[test]
    fn test_equal_key_appends_in_insertion_order() {
        let mut t: Tree<u64, &str> = Tree::new();
        t.insert(40, "first");
        t.insert(40, "second");
        t.insert(7, "small");
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(&40), &["first", "second"]);
        // Top-1 must pick the value inserted first under the shared key.
        assert_eq!(t.top_n(1), vec!["first"]);
        assert_eq!(t.top_n(2), vec!["first", "second"]);
        assert_eq!(t.top_n(5), vec!["first", "second", "small"]);
    }

    #[test]
    fn test_get_missing_is_empty() {
        let t = tree_from(&[1, 2, 3]);
        assert!(t.get(&42).is_empty());
        assert!(!t.contains(&42));
        assert!(t.contains(&2));
    }

    #[test]
    fn test_each_visits_in_order() {
        let t = tree_from(&[3, 1, 2]);
        let mut seen = Vec::new();
        t.each(|k, _| seen.push(*k));
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_top_n_larger_than_len() {
        let t = tree_from(&[1, 2]);
        assert_eq!(t.top_n(10), vec![2, 1]);
    }

    #[test]
    fn test_intersection_basic() {
        let a = tree_from(&[1, 2, 3, 4]);
        let b = tree_from(&[2, 4, 6]);
        let c = tree_from(&[4, 2, 0]);
        let res = Tree::intersection(&[&a, &b, &c]);
        assert_eq!(res.dump(), vec![2, 4]);
    }

    #[test]
    fn test_intersection_empty_input_list() {
        let res: Tree<i64, i64> = Tree::intersection(&[]);
        assert!(res.is_empty());
    }

    #[test]
    fn test_intersection_single_input() {
        let a = tree_from(&[3, 1]);
        let res = Tree::intersection(&[&a]);
        assert_eq!(res.dump(), vec![1, 3]);
    }

    #[test]
    fn test_intersection_with_empty_tree() {
        let a = tree_from(&[1, 2]);
        let b: Tree<i64, i64> = Tree::new();
        let res = Tree::intersection(&[&a, &b]);
        assert!(res.is_empty());
    }
}
