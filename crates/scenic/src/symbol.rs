//! The symbol table: a stack of nested scopes over a generational slot
//! arena.
//!
//! Frame 0 is the global scope; macro invocations and `#local` blocks push
//! frames above it. Entries live in a shared slot arena so that
//! pass-by-reference macro parameters can hold a [`SymbolHandle`] instead of
//! a pointer: the handle carries the slot's generation, and a read through a
//! stale handle is diagnosed as a dangling access instead of reading freed
//! memory.

use ahash::AHashMap;

use crate::{
    diag::{ErrorKind, ParseError, ParseResult},
    value::{Value, ValueTag},
};

/// Generation-checked handle to a symbol slot. This is what a
/// parameter-reference value carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolHandle {
    slot: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot {
    value: Value,
    generation: u32,
    /// Deprecation message emitted on first read, if set.
    deprecated: Option<String>,
    occupied: bool,
}

#[derive(Debug, Default)]
struct Frame {
    names: AHashMap<String, u32>,
}

/// Where a found symbol lives, for scope-sensitive decisions (macro
/// arguments install references only when the entry's scope is strictly
/// outer to the callee frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Found {
    pub handle: SymbolHandle,
    /// Index of the frame holding the entry; 0 is the global frame.
    pub frame: usize,
}

#[derive(Debug)]
pub struct SymbolTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    frames: Vec<Frame>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    /// Creates a table with the global frame in place.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            frames: vec![Frame::default()],
        }
    }

    /// Number of open frames, including the global one.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push_frame(&mut self) {
        self.frames.push(Frame::default());
    }

    /// Pops the innermost frame, destroying its entries. Outstanding
    /// parameter-references into the frame become dangling and are caught by
    /// the generation check on their next use.
    ///
    /// # Panics
    /// Panics when asked to pop the global frame; that is a parser bug.
    pub fn pop_frame(&mut self) {
        assert!(self.frames.len() > 1, "attempted to pop the global symbol frame");
        let frame = self.frames.pop().expect("frame stack is never empty");
        for (_, slot_index) in frame.names {
            self.release(slot_index);
        }
    }

    fn release(&mut self, slot_index: u32) {
        let slot = &mut self.slots[slot_index as usize];
        slot.value = Value::Undefined;
        slot.generation = slot.generation.wrapping_add(1);
        slot.occupied = false;
        slot.deprecated = None;
        self.free.push(slot_index);
    }

    fn allocate(&mut self, value: Value) -> u32 {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = value;
            slot.occupied = true;
            index
        } else {
            let index = u32::try_from(self.slots.len()).expect("symbol arena exceeds u32");
            self.slots.push(Slot {
                value,
                generation: 0,
                deprecated: None,
                occupied: true,
            });
            index
        }
    }

    fn insert_in(&mut self, frame: usize, name: String, value: Value) -> SymbolHandle {
        if let Some(&existing) = self.frames[frame].names.get(&name) {
            // redefinition destroys the old value in place
            let slot = &mut self.slots[existing as usize];
            slot.value = value;
            slot.generation = slot.generation.wrapping_add(1);
            return SymbolHandle {
                slot: existing,
                generation: slot.generation,
            };
        }
        let slot = self.allocate(value);
        self.frames[frame].names.insert(name, slot);
        SymbolHandle {
            slot,
            generation: self.slots[slot as usize].generation,
        }
    }

    /// `#declare`: writes to the global frame.
    pub fn add_global(&mut self, name: impl Into<String>, value: Value) -> SymbolHandle {
        self.insert_in(0, name.into(), value)
    }

    /// `#local`: writes to the innermost frame. At file scope this is the
    /// global frame, matching the directive's documented fallback.
    pub fn add_local(&mut self, name: impl Into<String>, value: Value) -> SymbolHandle {
        let frame = self.frames.len() - 1;
        self.insert_in(frame, name.into(), value)
    }

    /// Tag of an existing binding, for redefinition warnings.
    #[must_use]
    pub fn existing_tag(&self, name: &str) -> Option<ValueTag> {
        self.find(name).map(|found| self.slots[found.handle.slot as usize].value.tag())
    }

    /// Innermost-outward lookup.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Found> {
        for (frame_index, frame) in self.frames.iter().enumerate().rev() {
            if let Some(&slot) = frame.names.get(name) {
                return Some(Found {
                    handle: SymbolHandle {
                        slot,
                        generation: self.slots[slot as usize].generation,
                    },
                    frame: frame_index,
                });
            }
        }
        None
    }

    /// Removes a binding (`#undef`), searching innermost-outward.
    /// Returns true when a binding existed.
    pub fn remove(&mut self, name: &str) -> bool {
        for frame_index in (0..self.frames.len()).rev() {
            if let Some(slot) = self.frames[frame_index].names.remove(name) {
                self.release(slot);
                return true;
            }
        }
        false
    }

    /// Marks a binding deprecated with a message emitted on first read.
    pub fn deprecate(&mut self, handle: SymbolHandle, message: impl Into<String>) {
        if let Some(slot) = self.slot_if_live(handle) {
            self.slots[slot].deprecated = Some(message.into());
        }
    }

    /// Takes the pending deprecation message, so it fires once.
    pub fn take_deprecation(&mut self, handle: SymbolHandle) -> Option<String> {
        let slot = self.slot_if_live(handle)?;
        self.slots[slot].deprecated.take()
    }

    fn slot_if_live(&self, handle: SymbolHandle) -> Option<usize> {
        let slot = self.slots.get(handle.slot as usize)?;
        (slot.occupied && slot.generation == handle.generation).then_some(handle.slot as usize)
    }

    fn dangling(&self, name_hint: &str) -> ParseError {
        ParseError::new(
            ErrorKind::Symbol,
            format!("dangling reference{}: the referenced value no longer exists", name_hint),
        )
    }

    /// Reads through a handle, verifying the generation.
    pub fn get(&self, handle: SymbolHandle) -> ParseResult<&Value> {
        match self.slot_if_live(handle) {
            Some(slot) => Ok(&self.slots[slot].value),
            None => Err(self.dangling("")),
        }
    }

    /// Writes through a handle, verifying the generation.
    pub fn get_mut(&mut self, handle: SymbolHandle) -> ParseResult<&mut Value> {
        match self.slot_if_live(handle) {
            Some(slot) => Ok(&mut self.slots[slot].value),
            None => Err(self.dangling("")),
        }
    }

    /// Follows parameter-reference chains to the ultimate storage slot.
    ///
    /// Chains are created when a macro forwards its own by-reference
    /// parameter to a nested macro; they are short, but a cycle (impossible
    /// through the directive surface) would hang, so the walk is bounded.
    pub fn resolve(&self, mut handle: SymbolHandle) -> ParseResult<SymbolHandle> {
        for _ in 0..64 {
            match self.slot_if_live(handle) {
                Some(slot) => match &self.slots[slot].value {
                    Value::ParamRef(next) => handle = *next,
                    _ => return Ok(handle),
                },
                None => return Err(self.dangling("")),
            }
        }
        Err(ParseError::new(ErrorKind::Symbol, "parameter reference chain too deep"))
    }

    /// Copies the value behind a handle, following reference chains.
    pub fn copy_value(&self, handle: SymbolHandle) -> ParseResult<Value> {
        let resolved = self.resolve(handle)?;
        Ok(self.get(resolved)?.copy())
    }

    /// Destroys the value behind a handle, leaving the binding undefined.
    pub fn destroy_value(&mut self, handle: SymbolHandle) -> ParseResult<()> {
        *self.get_mut(handle)? = Value::Undefined;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_global_visible_from_inner_frames() {
        let mut table = SymbolTable::new();
        table.add_global("x", Value::Scalar(1.0));
        table.push_frame();
        let found = table.find("x").unwrap();
        assert_eq!(found.frame, 0);
        assert_eq!(table.get(found.handle).unwrap(), &Value::Scalar(1.0));
        table.pop_frame();
    }

    #[test]
    fn test_local_shadows_and_pops() {
        let mut table = SymbolTable::new();
        table.add_global("x", Value::Scalar(1.0));
        table.push_frame();
        table.add_local("x", Value::Scalar(2.0));
        let inner = table.find("x").unwrap();
        assert_eq!(inner.frame, 1);
        assert_eq!(table.get(inner.handle).unwrap(), &Value::Scalar(2.0));
        table.pop_frame();
        let outer = table.find("x").unwrap();
        assert_eq!(outer.frame, 0);
        assert_eq!(table.get(outer.handle).unwrap(), &Value::Scalar(1.0));
    }

    #[test]
    fn test_stale_handle_is_dangling_not_garbage() {
        let mut table = SymbolTable::new();
        table.push_frame();
        let handle = table.add_local("tmp", Value::Scalar(7.0));
        table.pop_frame();
        // slot may be reused...
        table.add_global("other", Value::Scalar(9.0));
        // ...but the stale handle is caught by its generation
        let err = table.get(handle).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Symbol);
    }

    #[test]
    fn test_redefinition_replaces_value() {
        let mut table = SymbolTable::new();
        let old = table.add_global("x", Value::Scalar(1.0));
        table.add_global("x", Value::String("now a string".into()));
        let found = table.find("x").unwrap();
        assert_eq!(table.get(found.handle).unwrap().tag(), ValueTag::String);
        // the handle taken before redefinition no longer reads
        assert!(table.get(old).is_err());
    }

    #[test]
    fn test_reference_chain_resolution() {
        let mut table = SymbolTable::new();
        let target = table.add_global("storage", Value::Scalar(42.0));
        table.push_frame();
        let ref1 = table.add_local("p", Value::ParamRef(target));
        table.push_frame();
        let ref2 = table.add_local("q", Value::ParamRef(ref1));
        let resolved = table.resolve(ref2).unwrap();
        assert_eq!(table.get(resolved).unwrap(), &Value::Scalar(42.0));
        // writing through the resolved handle updates the original
        *table.get_mut(resolved).unwrap() = Value::Scalar(43.0);
        table.pop_frame();
        table.pop_frame();
        let found = table.find("storage").unwrap();
        assert_eq!(table.get(found.handle).unwrap(), &Value::Scalar(43.0));
    }

    #[test]
    fn test_remove_innermost_first() {
        let mut table = SymbolTable::new();
        table.add_global("x", Value::Scalar(1.0));
        table.push_frame();
        table.add_local("x", Value::Scalar(2.0));
        assert!(table.remove("x"));
        assert_eq!(table.find("x").unwrap().frame, 0);
        assert!(table.remove("x"));
        assert!(table.find("x").is_none());
        assert!(!table.remove("x"));
    }

    #[test]
    fn test_deprecation_fires_once() {
        let mut table = SymbolTable::new();
        let handle = table.add_global("old_name", Value::Scalar(1.0));
        table.deprecate(handle, "use new_name instead");
        assert_eq!(table.take_deprecation(handle), Some("use new_name instead".to_owned()));
        assert_eq!(table.take_deprecation(handle), None);
    }
}
