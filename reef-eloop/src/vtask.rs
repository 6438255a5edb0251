//! Virtual-task tree.
//!
//! A red-black tree of pending tasks keyed lexicographically on
//! `(vtime, seqid)`, with the minimum cached so the common pop is O(1).
//! Nodes live in a slab arena and are addressed by ids, so cancelled tasks
//! can be removed by handle without a search. `cancel_all` only flags
//! tasks; workers drop flagged tasks when they fetch them, running the
//! task's cancel hook instead of its body.

use slab::Slab;

/// Work item ordered by virtual time.
pub struct VTask {
    /// Virtual deadline; lower runs first.
    pub vtime: u64,
    /// Tie-breaker preserving submission order.
    pub seqid: u64,
    /// Task body.
    pub exec: Box<dyn FnOnce() + Send>,
    /// Invoked instead of `exec` when the task was cancelled.
    pub cancel: Option<Box<dyn FnOnce() + Send>>,
    /// Set by [`VTaskTree::cancel_all`].
    pub cancelled: bool,
}

impl VTask {
    /// Task with a body and no cancel hook.
    pub fn new(vtime: u64, seqid: u64, exec: impl FnOnce() + Send + 'static) -> Self {
        Self {
            vtime,
            seqid,
            exec: Box::new(exec),
            cancel: None,
            cancelled: false,
        }
    }

    fn key(&self) -> (u64, u64) {
        (self.vtime, self.seqid)
    }
}

impl core::fmt::Debug for VTask {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VTask")
            .field("vtime", &self.vtime)
            .field("seqid", &self.seqid)
            .field("cancelled", &self.cancelled)
            .finish()
    }
}

/// Stable handle to a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

const NIL: usize = usize::MAX;

struct Node {
    task: VTask,
    parent: usize,
    child: [usize; 2],
    red: bool,
}

/// The timestamp-ordered task tree.
pub struct VTaskTree {
    nodes: Slab<Node>,
    root: usize,
    min: usize,
}

impl Default for VTaskTree {
    fn default() -> Self {
        Self::new()
    }
}

impl VTaskTree {
    /// Empty tree.
    pub fn new() -> Self {
        Self {
            nodes: Slab::new(),
            root: NIL,
            min: NIL,
        }
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether no task is queued.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Virtual time of the next task to run.
    pub fn min_vtime(&self) -> Option<u64> {
        (self.min != NIL).then(|| self.nodes[self.min].task.vtime)
    }

    /// Queue a task; O(1) min upkeep when it becomes the new minimum.
    pub fn push(&mut self, task: VTask) -> TaskId {
        let key = task.key();
        let id = self.nodes.insert(Node {
            task,
            parent: NIL,
            child: [NIL, NIL],
            red: true,
        });

        // standard descent
        let mut parent = NIL;
        let mut at = self.root;
        let mut dir = 0;
        let mut is_min = true;
        while at != NIL {
            parent = at;
            dir = usize::from(key >= self.nodes[at].task.key());
            is_min &= dir == 0;
            at = self.nodes[at].child[dir];
        }

        self.nodes[id].parent = parent;
        if parent == NIL {
            self.root = id;
        } else {
            self.nodes[parent].child[dir] = id;
        }
        self.insert_fixup(id);

        if is_min {
            self.min = id;
        }
        TaskId(id)
    }

    /// Take the minimum task.
    pub fn pop(&mut self) -> Option<VTask> {
        if self.min == NIL {
            return None;
        }
        let id = self.min;
        self.min = self.successor(id);
        Some(self.unlink(id))
    }

    /// Take a specific task by handle.
    pub fn remove(&mut self, id: TaskId) -> Option<VTask> {
        if !self.nodes.contains(id.0) {
            return None;
        }
        if self.min == id.0 {
            self.min = self.successor(id.0);
        }
        Some(self.unlink(id.0))
    }

    /// Flag every queued task as cancelled without unlinking anything.
    pub fn cancel_all(&mut self) {
        for (_, node) in self.nodes.iter_mut() {
            node.task.cancelled = true;
        }
    }

    fn successor(&self, id: usize) -> usize {
        let mut at = id;
        if self.nodes[at].child[1] != NIL {
            at = self.nodes[at].child[1];
            while self.nodes[at].child[0] != NIL {
                at = self.nodes[at].child[0];
            }
            return at;
        }
        loop {
            let parent = self.nodes[at].parent;
            if parent == NIL {
                return NIL;
            }
            if self.nodes[parent].child[0] == at {
                return parent;
            }
            at = parent;
        }
    }

    fn is_red(&self, id: usize) -> bool {
        id != NIL && self.nodes[id].red
    }

    fn set_parent_link(&mut self, old: usize, parent: usize, new: usize) {
        if parent == NIL {
            self.root = new;
        } else {
            let dir = usize::from(self.nodes[parent].child[1] == old);
            self.nodes[parent].child[dir] = new;
        }
        if new != NIL {
            self.nodes[new].parent = parent;
        }
    }

    /// Rotate `id` down toward `dir`, lifting its opposite child.
    fn rotate(&mut self, id: usize, dir: usize) {
        let up = self.nodes[id].child[1 - dir];
        let inner = self.nodes[up].child[dir];

        self.nodes[id].child[1 - dir] = inner;
        if inner != NIL {
            self.nodes[inner].parent = id;
        }

        let parent = self.nodes[id].parent;
        self.set_parent_link(id, parent, up);

        self.nodes[up].child[dir] = id;
        self.nodes[id].parent = up;
    }

    fn insert_fixup(&mut self, mut id: usize) {
        while self.is_red(self.nodes[id].parent) {
            let parent = self.nodes[id].parent;
            let gparent = self.nodes[parent].parent;
            let pdir = usize::from(self.nodes[gparent].child[1] == parent);
            let uncle = self.nodes[gparent].child[1 - pdir];

            if self.is_red(uncle) {
                self.nodes[parent].red = false;
                self.nodes[uncle].red = false;
                self.nodes[gparent].red = true;
                id = gparent;
                continue;
            }

            if self.nodes[parent].child[1 - pdir] == id {
                self.rotate(parent, pdir);
                id = parent;
            }
            let parent = self.nodes[id].parent;
            let gparent = self.nodes[parent].parent;
            self.nodes[parent].red = false;
            self.nodes[gparent].red = true;
            self.rotate(gparent, 1 - pdir);
        }
        let root = self.root;
        self.nodes[root].red = false;
    }

    /// Unlink and return the task at `id`, rebalancing as needed.
    fn unlink(&mut self, id: usize) -> VTask {
        // splice out `id` itself, or its successor when it has two children
        let splice = if self.nodes[id].child[0] == NIL || self.nodes[id].child[1] == NIL {
            id
        } else {
            let mut s = self.nodes[id].child[1];
            while self.nodes[s].child[0] != NIL {
                s = self.nodes[s].child[0];
            }
            s
        };
        let splice_child = if self.nodes[splice].child[0] != NIL {
            self.nodes[splice].child[0]
        } else {
            self.nodes[splice].child[1]
        };

        let splice_parent = self.nodes[splice].parent;
        let splice_red = self.nodes[splice].red;

        // the side of the hole the splice leaves behind
        let (fix_parent, fix_dir) = if splice == id {
            let dir = if splice_parent == NIL {
                0
            } else {
                usize::from(self.nodes[splice_parent].child[1] == splice)
            };
            (splice_parent, dir)
        } else if splice_parent == id {
            // the successor was id's direct right child; after the graft
            // the hole hangs off the successor's right side
            (splice, 1)
        } else {
            // the successor was a leftmost descendant
            (splice_parent, 0)
        };

        if splice_child != NIL {
            self.nodes[splice_child].parent = splice_parent;
        }
        self.set_parent_link(splice, splice_parent, splice_child);

        if splice != id {
            // move the successor into id's place, keeping id's color
            let parent = self.nodes[id].parent;
            let children = self.nodes[id].child;
            let red = self.nodes[id].red;

            self.set_parent_link(id, parent, splice);
            self.nodes[splice].child = children;
            self.nodes[splice].red = red;
            for child in children {
                if child != NIL {
                    self.nodes[child].parent = splice;
                }
            }
        }

        if !splice_red {
            self.delete_fixup(splice_child, fix_parent, fix_dir);
        }

        self.nodes.remove(id).task
    }

    /// Restore the red-black invariants after removing a black node whose
    /// (possibly nil) replacement `at` hangs off `parent` on side `dir`.
    fn delete_fixup(&mut self, mut at: usize, mut parent: usize, mut dir: usize) {
        while parent != NIL && !self.is_red(at) {
            let mut sibling = self.nodes[parent].child[1 - dir];
            debug_assert!(sibling != NIL, "black deficit implies a sibling");

            if self.is_red(sibling) {
                self.nodes[sibling].red = false;
                self.nodes[parent].red = true;
                self.rotate(parent, dir);
                sibling = self.nodes[parent].child[1 - dir];
            }

            let near = self.nodes[sibling].child[dir];
            let far = self.nodes[sibling].child[1 - dir];
            if !self.is_red(near) && !self.is_red(far) {
                self.nodes[sibling].red = true;
                at = parent;
                parent = self.nodes[at].parent;
                if parent != NIL {
                    dir = usize::from(self.nodes[parent].child[1] == at);
                }
                continue;
            }

            if !self.is_red(far) {
                self.nodes[near].red = false;
                self.nodes[sibling].red = true;
                self.rotate(sibling, 1 - dir);
                sibling = self.nodes[parent].child[1 - dir];
            }

            let far = self.nodes[sibling].child[1 - dir];
            self.nodes[sibling].red = self.nodes[parent].red;
            self.nodes[parent].red = false;
            if far != NIL {
                self.nodes[far].red = false;
            }
            self.rotate(parent, dir);
            at = self.root;
            break;
        }
        if at != NIL {
            self.nodes[at].red = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn task(vtime: u64, seqid: u64) -> VTask {
        VTask::new(vtime, seqid, || {})
    }

    fn check_rb(tree: &VTaskTree) {
        fn walk(tree: &VTaskTree, id: usize, blacks: &mut Option<usize>, depth: usize) -> usize {
            if id == NIL {
                return 1;
            }
            let node = &tree.nodes[id];
            if node.red {
                assert!(!tree.is_red(node.child[0]), "red child under red parent");
                assert!(!tree.is_red(node.child[1]), "red child under red parent");
            }
            let lh = walk(tree, node.child[0], blacks, depth + 1);
            let rh = walk(tree, node.child[1], blacks, depth + 1);
            assert_eq!(lh, rh, "black height mismatch");
            lh + usize::from(!node.red)
        }
        if tree.root != NIL {
            assert!(!tree.nodes[tree.root].red, "red root");
            walk(tree, tree.root, &mut None, 0);
        }
    }

    #[test]
    fn pops_in_vtime_then_seqid_order() {
        let mut tree = VTaskTree::new();
        tree.push(task(20, 1));
        tree.push(task(10, 2));
        tree.push(task(10, 3));
        tree.push(task(5, 4));
        tree.push(task(30, 5));

        let order: Vec<(u64, u64)> = std::iter::from_fn(|| tree.pop())
            .map(|t| (t.vtime, t.seqid))
            .collect();
        assert_eq!(order, vec![(5, 4), (10, 2), (10, 3), (20, 1), (30, 5)]);
    }

    #[test]
    fn min_is_cached_across_mutations() {
        let mut tree = VTaskTree::new();
        let mut ids = Vec::new();
        for seq in 0..100u64 {
            ids.push(tree.push(task(1000 - seq, seq)));
        }
        assert_eq!(tree.min_vtime(), Some(901));

        // removing the minimum by handle advances the cache
        let min_id = *ids.last().unwrap();
        let removed = tree.remove(min_id).unwrap();
        assert_eq!(removed.vtime, 901);
        assert_eq!(tree.min_vtime(), Some(902));
    }

    #[test]
    fn cancel_all_flags_without_unlinking() {
        let mut tree = VTaskTree::new();
        for seq in 0..10u64 {
            tree.push(task(seq, seq));
        }
        tree.cancel_all();
        assert_eq!(tree.len(), 10);
        for _ in 0..10 {
            assert!(tree.pop().unwrap().cancelled);
        }
        assert!(tree.pop().is_none());
    }

    #[test]
    fn random_push_pop_remove_stays_ordered() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut tree = VTaskTree::new();
        let mut ids = Vec::new();
        let mut seq = 0u64;

        for _ in 0..3000 {
            match rng.gen_range(0..3) {
                0 | 1 => {
                    seq += 1;
                    ids.push((tree.push(task(rng.gen_range(0..500), seq)), seq));
                }
                _ if !ids.is_empty() => {
                    let at = rng.gen_range(0..ids.len());
                    let (id, _) = ids.swap_remove(at);
                    tree.remove(id);
                }
                _ => {}
            }
            if rng.gen_ratio(1, 128) {
                check_rb(&tree);
            }
        }

        check_rb(&tree);
        let mut last = (0u64, 0u64);
        while let Some(t) = tree.pop() {
            assert!((t.vtime, t.seqid) >= last);
            last = (t.vtime, t.seqid);
        }
    }
}
