//! Packed node state storage
//!
//! Every tree node owns two bits in a `u32` word array, sixteen nodes per
//! word. A zero-filled array reads as an all-free tree, so attaching
//! storage is a single `write_bytes`.

/// Bits of state stored per node.
pub(crate) const STATE_BITS: usize = 2;

/// Node states packed into one `u32` word.
pub(crate) const NODES_PER_WORD: usize = u32::BITS as usize / STATE_BITS;

/// Bytes per packed state word.
pub(crate) const WORD_BYTES: usize = core::mem::size_of::<u32>();

const STATE_MASK: u32 = 0b11;

/// State of one tree node, two bits each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeState {
    /// Nothing in this subtree is allocated. Also the stored state of every
    /// descendant of a `Used` node, whose subtree is never rewritten.
    Free,
    /// At least one strict descendant is allocated.
    Partial,
    /// The node's whole block is allocated (or reserved at init).
    Used,
}

impl NodeState {
    const fn bits(self) -> u32 {
        match self {
            NodeState::Free => 0b00,
            NodeState::Partial => 0b01,
            NodeState::Used => 0b10,
        }
    }

    const fn from_bits(bits: u32) -> Self {
        match bits {
            0b00 => NodeState::Free,
            0b01 => NodeState::Partial,
            _ => NodeState::Used,
        }
    }
}

/// View over caller-provided tree storage.
///
/// The word array is held as a plain address, never as a pointer field.
/// Callers must keep the storage alive, writable and word-aligned for as
/// long as the view is attached.
pub(crate) struct StateTree {
    words_addr: usize,
    word_count: usize,
}

impl StateTree {
    /// A detached view; any attach replaces it.
    pub(crate) const fn new() -> Self {
        Self {
            words_addr: 0,
            word_count: 0,
        }
    }

    /// Point the view at `word_count` words at `words_addr` and zero them,
    /// which marks every node free.
    pub(crate) fn attach(&mut self, words_addr: usize, word_count: usize) {
        self.words_addr = words_addr;
        self.word_count = word_count;
        unsafe {
            core::ptr::write_bytes(words_addr as *mut u32, 0, word_count);
        }
    }

    /// Read the state of `node`. The index must be within the attached tree.
    pub(crate) fn get(&self, node: usize) -> NodeState {
        let (ptr, shift) = self.locate(node);
        let word = unsafe { *ptr };
        NodeState::from_bits((word >> shift) & STATE_MASK)
    }

    /// Write the state of `node`. The index must be within the attached tree.
    pub(crate) fn set(&mut self, node: usize, state: NodeState) {
        let (ptr, shift) = self.locate(node);
        unsafe {
            let mut word = *ptr;
            word &= !(STATE_MASK << shift);
            word |= state.bits() << shift;
            *ptr = word;
        }
    }

    fn locate(&self, node: usize) -> (*mut u32, usize) {
        let word_index = node / NODES_PER_WORD;
        debug_assert!(word_index < self.word_count);
        let shift = (node % NODES_PER_WORD) * STATE_BITS;
        ((self.words_addr + word_index * WORD_BYTES) as *mut u32, shift)
    }
}
