//! Disjoint sets over object identities.

use std::sync::Arc;

use crate::weak::WeakIdentityMap;

enum Parent<K> {
    Root,
    Node(Arc<K>),
}

/// Union-find whose elements are `Arc` identities.
///
/// Members hold their parent strongly, so a class's canonical representative
/// stays alive as long as any member of the class does. Roots are stored as
/// [`Parent::Root`] rather than a self reference, which would otherwise pin
/// every root forever.
pub struct UnionFind<K> {
    parents: WeakIdentityMap<K, Parent<K>>,
}

impl<K> UnionFind<K> {
    pub fn new() -> Self {
        UnionFind {
            parents: WeakIdentityMap::new(),
        }
    }

    pub fn contains(&self, vec: &Arc<K>) -> bool {
        self.parents.contains(vec)
    }

    /// Returns the representative of `vec`'s class.
    ///
    /// Unseen elements are registered as their own root. Every node visited
    /// on the way up is re-pointed directly at the root.
    pub fn canonical(&mut self, vec: &Arc<K>) -> Arc<K> {
        if !self.parents.contains(vec) {
            self.parents.insert(vec, Parent::Root);
            return Arc::clone(vec);
        }

        let mut visited = Vec::new();
        let mut curr = Arc::clone(vec);
        while let Some(Parent::Node(parent)) = self.parents.get(&curr) {
            let parent = Arc::clone(parent);
            visited.push(curr);
            curr = parent;
        }

        // The last visited node already points at the root.
        visited.pop();
        for node in visited {
            self.parents.insert(&node, Parent::Node(Arc::clone(&curr)));
        }
        curr
    }

    /// Joins the classes of `src` and `tgt`. The root of `tgt` stays canonical.
    pub fn merge(&mut self, src: &Arc<K>, tgt: &Arc<K>) {
        let root_src = self.canonical(src);
        let root_tgt = self.canonical(tgt);
        if Arc::ptr_eq(&root_src, &root_tgt) {
            return;
        }
        self.parents.insert(&root_src, Parent::Node(root_tgt));
    }

    pub fn same_set(&mut self, a: &Arc<K>, b: &Arc<K>) -> bool {
        let root_a = self.canonical(a);
        let root_b = self.canonical(b);
        Arc::ptr_eq(&root_a, &root_b)
    }

    /// Drops elements that died, releasing roots only they kept alive.
    pub fn purge(&mut self) {
        self.parents.purge();
    }

    /// Number of live elements tracked.
    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}

impl<K> Default for UnionFind<K> {
    fn default() -> Self {
        Self::new()
    }
}
