//! Caller tree stored as an arena.
//!
//! Nodes are never freed. Detaching a node unlinks it from its parent and
//! clears its parent index, which makes the whole subtree unreachable from
//! the root.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct CallNode {
    pub name: String,
    pub body: Option<String>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl CallNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }
}

#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<CallNode>,
}

impl CallTree {
    pub fn new(root_name: &str, root_body: Option<String>) -> Self {
        Self {
            nodes: vec![CallNode {
                name: root_name.to_string(),
                body: root_body,
                parent: None,
                children: Vec::new(),
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &CallNode {
        &self.nodes[id.0]
    }

    pub fn set_body(&mut self, id: NodeId, body: String) {
        self.nodes[id.0].body = Some(body);
    }

    pub fn add_child(&mut self, parent: NodeId, name: &str, body: Option<String>) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(CallNode {
            name: name.to_string(),
            body,
            parent: Some(parent),
            children: Vec::new(),
        });
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Unlink `id` from its parent. Returns false if it was not attached.
    pub fn detach(&mut self, id: NodeId) -> bool {
        let Some(parent) = self.nodes[id.0].parent.take() else {
            return false;
        };
        let siblings = &mut self.nodes[parent.0].children;
        let before = siblings.len();
        siblings.retain(|c| *c != id);
        siblings.len() != before
    }

    /// Nodes from the root down to `id`, root first.
    pub fn path_from_root(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = vec![id];
        let mut current = id;
        while let Some(parent) = self.nodes[current.0].parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    pub fn path_names(&self, id: NodeId) -> Vec<String> {
        self.path_from_root(id)
            .into_iter()
            .map(|n| self.nodes[n.0].name.clone())
            .collect()
    }

    /// Bodies along the path, root first. `None` marks a node whose body was
    /// never set.
    pub fn path_bodies(&self, id: NodeId) -> Vec<Option<String>> {
        self.path_from_root(id)
            .into_iter()
            .map(|n| self.nodes[n.0].body.clone())
            .collect()
    }

    /// Edges between `id` and the root. A detached node reports its depth
    /// within its detached subtree.
    pub fn depth(&self, id: NodeId) -> usize {
        self.path_from_root(id).len() - 1
    }

    /// True when `name` already names `id` or one of its ancestors.
    pub fn has_ancestor_named(&self, id: NodeId, name: &str) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if self.nodes[node.0].name == name {
                return true;
            }
            current = self.nodes[node.0].parent;
        }
        false
    }

    /// Leaves reachable from the root, depth-first in child order.
    pub fn leaves(&self) -> Vec<NodeId> {
        let mut leaves = Vec::new();
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            let children = &self.nodes[id.0].children;
            if children.is_empty() {
                leaves.push(id);
            } else {
                stack.extend(children.iter().rev());
            }
        }
        leaves
    }

    /// Number of nodes attached to the root, root included.
    pub fn attached_len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            count += 1;
            stack.extend(self.nodes[id.0].children.iter());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (CallTree, NodeId, NodeId, NodeId) {
        let mut tree = CallTree::new("sink", Some("sink body".into()));
        let root = tree.root();
        let a = tree.add_child(root, "a", Some("a body".into()));
        let b = tree.add_child(root, "b", None);
        let c = tree.add_child(a, "c", Some("c body".into()));
        (tree, a, b, c)
    }

    #[test]
    fn test_paths_are_root_first() {
        let (tree, _, _, c) = sample();
        assert_eq!(tree.path_names(c), ["sink", "a", "c"]);
        assert_eq!(
            tree.path_bodies(c),
            [
                Some("sink body".to_string()),
                Some("a body".to_string()),
                Some("c body".to_string())
            ]
        );
        assert_eq!(tree.depth(c), 2);
        assert_eq!(tree.depth(tree.root()), 0);
    }

    #[test]
    fn test_detach_unlinks_both_directions() {
        let (mut tree, a, b, c) = sample();
        assert!(tree.detach(a));
        assert_eq!(tree.node(tree.root()).children(), [b]);
        assert_eq!(tree.node(a).parent(), None);
        assert_eq!(tree.leaves(), [b]);
        assert!(!tree.leaves().contains(&c));
        assert!(!tree.detach(a));
    }

    #[test]
    fn test_leaves_in_child_order() {
        let (tree, _, b, c) = sample();
        assert_eq!(tree.leaves(), [c, b]);
        assert_eq!(tree.attached_len(), 4);
    }

    #[test]
    fn test_ancestor_names() {
        let (tree, _, _, c) = sample();
        assert!(tree.has_ancestor_named(c, "sink"));
        assert!(tree.has_ancestor_named(c, "c"));
        assert!(!tree.has_ancestor_named(c, "b"));
    }

    #[test]
    fn test_single_root_is_leaf() {
        let tree = CallTree::new("only", None);
        assert_eq!(tree.leaves(), [tree.root()]);
    }
}
