//! An arena-indexed doubly linked list which keeps cache entries in recency order.
//!
//! The head of the list is always the least recently used entry and therefore the eviction
//! candidate, the tail is the most recently used one. All structural operations (append, remove)
//! are O(1).
//!
//! Nodes are addressed via [NodeId] handles instead of references. A handle carries the slot index
//! and a generation counter which is bumped whenever a slot is vacated, so a handle to a removed
//! node can never alias a recycled slot: operations on such a handle simply report a miss. This
//! matters because handles are stored in the key index which is readable outside the exclusive
//! section guarding this list, so a handle may well be stale by the time it is used.
//!
//! The list itself provides no synchronization; the owning cache serializes all access.

/// A stable, generation-stamped handle to a list node.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct NodeId {
    index: usize,
    generation: u64,
}

/// The live part of a slot: the payload plus the chain links.
struct Node<T> {
    value: T,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<T> {
    generation: u64,
    // None marks a vacant slot awaiting reuse.
    node: Option<Node<T>>,
}

/// A doubly linked list over an arena of slots, with O(1) append and removal.
pub(crate) struct LinkedList<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<T> LinkedList<T> {
    /// Creates an empty list.
    pub fn new() -> Self {
        LinkedList {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// Returns the number of linked nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Determines if the list contains no nodes.
    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a handle to the first (least recently appended) node, if any.
    pub fn first(&self) -> Option<NodeId> {
        self.head.map(|index| NodeId {
            index,
            generation: self.slots[index].generation,
        })
    }

    /// Returns a handle to the last (most recently appended) node, if any.
    #[allow(dead_code)]
    pub fn last(&self) -> Option<NodeId> {
        self.tail.map(|index| NodeId {
            index,
            generation: self.slots[index].generation,
        })
    }

    /// Returns the payload of the given node or None if the handle is stale.
    #[allow(dead_code)]
    pub fn get(&self, id: NodeId) -> Option<&T> {
        let slot = self.slots.get(id.index)?;
        if slot.generation != id.generation {
            return None;
        }

        slot.node.as_ref().map(|node| &node.value)
    }

    /// Appends the given value at the tail of the list and returns its handle.
    pub fn append_last(&mut self, value: T) -> NodeId {
        let node = Node {
            value,
            prev: self.tail,
            next: None,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };

        match self.tail {
            Some(tail) => self.node_mut(tail).next = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;

        NodeId {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Unlinks the given node and returns its payload.
    ///
    /// A stale handle (the node has been removed before, possibly with its slot since reused)
    /// yields None and leaves the list untouched.
    pub fn remove(&mut self, id: NodeId) -> Option<T> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }

        let node = slot.node.take()?;
        slot.generation += 1;
        self.free.push(id.index);

        match node.prev {
            Some(prev) => self.node_mut(prev).next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }
        self.len -= 1;

        Some(node.value)
    }

    /// Removes all nodes.
    ///
    /// Slots are vacated rather than dropped so that handles handed out earlier remain inert
    /// instead of aliasing freshly appended nodes.
    pub fn clear(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                slot.generation += 1;
                self.free.push(index);
            }
        }
        self.head = None;
        self.tail = None;
        self.len = 0;
    }

    /// Iterates over all payloads from the first to the last node.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let index = cursor?;
            let node = self.slots[index]
                .node
                .as_ref()
                .expect("A linked node vanished from its slot!");
            cursor = node.next;
            Some(&node.value)
        })
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        self.slots[index]
            .node
            .as_mut()
            .expect("A linked node vanished from its slot!")
    }
}
