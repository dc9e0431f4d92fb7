//! Stack frame and variable map
//!
//! Locals are allocated bottom-up from the frame base: the cursor grows
//! downward and every name maps to a negative offset from the base
//! pointer. Offsets are stable for the whole function body. The prologue
//! reserves the frame with a placeholder that is patched to the final
//! aligned size at function end.

use std::collections::HashMap;

use crate::diag::n_error;
use crate::Result;

#[derive(Debug, Default)]
pub struct Frame {
    /// Negative offset from the base pointer, keyed by name. Zero is
    /// reserved as "unknown" and never stored.
    offsets: HashMap<String, i32>,
    sizes: HashMap<String, u32>,
    /// Bytes allocated below the base pointer so far.
    stack_var_pos: u32,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.offsets.clear();
        self.sizes.clear();
        self.stack_var_pos = 0;
    }

    /// Reserve `size` bytes for `name` and return its frame offset.
    /// `align` is honoured by rounding the cursor up first. A repeated
    /// name shadows the earlier declaration: the mapping is overwritten
    /// with a fresh slot and the old storage stays reserved.
    pub fn allocate(&mut self, name: &str, size: u32, align: u32) -> i32 {
        let aligned = crate::types::align_up(self.stack_var_pos + size, align.max(1));
        self.stack_var_pos = aligned;
        let offset = -(aligned as i32);
        self.offsets.insert(name.to_string(), offset);
        self.sizes.insert(name.to_string(), size);
        offset
    }

    /// Frame offset of a known local, or a generator bug.
    pub fn offset(&self, name: &str) -> Result<i32> {
        self.offsets
            .get(name)
            .copied()
            .ok_or_else(|| n_error(format!("unknown variable: {name}")))
    }

    pub fn lookup(&self, name: &str) -> Option<i32> {
        self.offsets.get(name).copied()
    }

    pub fn size(&self, name: &str) -> Result<u32> {
        self.sizes
            .get(name)
            .copied()
            .ok_or_else(|| n_error(format!("unknown variable: {name}")))
    }

    /// Total frame reservation, rounded up to keep the stack 16-aligned.
    pub fn frame_size(&self) -> u32 {
        crate::types::align_up(self.stack_var_pos, 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_grow_downward() {
        let mut frame = Frame::new();
        assert_eq!(frame.allocate("a", 8, 1), -8);
        assert_eq!(frame.allocate("b", 8, 1), -16);
        assert_eq!(frame.allocate("c", 4, 1), -20);
        assert_eq!(frame.offset("b").unwrap(), -16);
        assert_eq!(frame.size("c").unwrap(), 4);
    }

    #[test]
    fn test_no_offset_is_zero() {
        let mut frame = Frame::new();
        for i in 0..32 {
            let off = frame.allocate(&format!("v{i}"), 1, 1);
            assert_ne!(off, 0);
        }
    }

    #[test]
    fn test_alignment_honoured() {
        let mut frame = Frame::new();
        frame.allocate("byte", 1, 1);
        let off = frame.allocate("word", 8, 8);
        assert_eq!(off % 8, 0);
        assert_eq!(off, -16);
    }

    #[test]
    fn test_frame_size_sixteen_aligned() {
        let mut frame = Frame::new();
        frame.allocate("a", 8, 1);
        frame.allocate("b", 4, 1);
        assert_eq!(frame.frame_size(), 16);
        frame.allocate("c", 8, 1);
        assert_eq!(frame.frame_size(), 32);
    }

    #[test]
    fn test_unknown_variable_is_fatal() {
        let frame = Frame::new();
        assert!(frame.offset("ghost").is_err());
    }

    #[test]
    fn test_redeclaration_shadows_with_fresh_slot() {
        let mut frame = Frame::new();
        let first = frame.allocate("x", 8, 1);
        let second = frame.allocate("x", 8, 1);
        assert_ne!(first, second);
        assert_eq!(frame.offset("x").unwrap(), second);
        // The shadowed slot's storage stays reserved.
        assert_eq!(frame.frame_size(), 16);
    }
}
