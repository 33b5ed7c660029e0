use crate::{
    utils::sync::{AtomicU64, Ordering},
    value::{pointer::FrameId, ManagedPointer, ObjectRef, StackValue, ValueKind},
    vm::error::EngineError,
};
use std::fmt::{self, Debug, Formatter};

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// Slot layout of a frame: arguments, then locals, then the evaluation stack.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameLayout {
    pub arguments: usize,
    pub locals: usize,
    pub max_stack: usize,
}

impl FrameLayout {
    pub fn local_base(&self) -> usize {
        self.arguments
    }

    /// Absolute index of the first evaluation stack slot; `top` starts here.
    pub fn stack_base(&self) -> usize {
        self.arguments + self.locals
    }

    pub fn total(&self) -> usize {
        self.stack_base() + self.max_stack
    }
}

/// The slots of one activation. Every slot holds a tagged [`StackValue`]; typed accessors
/// check the tag and fail with [`EngineError::SlotType`] on a mismatch.
pub struct Frame {
    id: FrameId,
    layout: FrameLayout,
    slots: Vec<StackValue>,
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("id", &self.id.0)
            .field("arguments", &&self.slots[..self.layout.local_base()])
            .field("locals", &&self.slots[self.layout.local_base()..self.layout.stack_base()])
            .finish_non_exhaustive()
    }
}

macro_rules! typed_slot {
    ($get:ident, $put:ident, $variant:ident, $ty:ty, $name:literal) => {
        pub fn $get(&self, slot: usize) -> Result<$ty, EngineError> {
            match self.get(slot)? {
                StackValue::$variant(v) => Ok(v.clone()),
                other => Err(Self::mismatch(slot, $name, other)),
            }
        }

        pub fn $put(&mut self, slot: usize, value: $ty) -> Result<(), EngineError> {
            self.put(slot, StackValue::$variant(value))
        }
    };
}

impl Frame {
    /// Creates a frame with `arguments` in the argument slots and zeroed locals.
    pub fn new(layout: FrameLayout, arguments: Vec<StackValue>, locals: &[ValueKind]) -> Self {
        let mut slots = arguments;
        slots.resize(layout.arguments, StackValue::null());
        slots.extend(locals.iter().map(|k| k.default_value()));
        slots.resize(layout.total(), StackValue::null());
        Self {
            id: FrameId(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed)),
            layout,
            slots,
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn mismatch(slot: usize, expected: &'static str, actual: &StackValue) -> EngineError {
        EngineError::SlotType {
            slot,
            expected,
            actual: format!("{:?}", actual),
        }
    }

    fn out_of_range(&self, slot: usize) -> EngineError {
        EngineError::SlotType {
            slot,
            expected: "a frame slot",
            actual: format!("index past frame of {} slots", self.slots.len()),
        }
    }

    pub fn get(&self, slot: usize) -> Result<&StackValue, EngineError> {
        self.slots.get(slot).ok_or_else(|| self.out_of_range(slot))
    }

    pub fn put(&mut self, slot: usize, value: StackValue) -> Result<(), EngineError> {
        let len = self.slots.len();
        match self.slots.get_mut(slot) {
            Some(s) => {
                *s = value;
                Ok(())
            }
            None => Err(EngineError::SlotType {
                slot,
                expected: "a frame slot",
                actual: format!("index past frame of {} slots", len),
            }),
        }
    }

    /// Moves out the value of `slot`, leaving null behind.
    pub fn take(&mut self, slot: usize) -> Result<StackValue, EngineError> {
        let value = self.get(slot)?.clone();
        self.clear(slot)?;
        Ok(value)
    }

    typed_slot!(get_int32, put_int32, Int32, i32, "int32");
    typed_slot!(get_int64, put_int64, Int64, i64, "int64");
    typed_slot!(get_native_int, put_native_int, NativeInt, isize, "native int");
    typed_slot!(get_float, put_native_float, NativeFloat, f64, "F");
    typed_slot!(get_object, put_object, ObjectRef, ObjectRef, "O");
    typed_slot!(get_pointer, put_pointer, ManagedPtr, ManagedPointer, "&");

    /// Copies the value and its tag from `src` to `dst`.
    pub fn copy(&mut self, src: usize, dst: usize) -> Result<(), EngineError> {
        let value = self.get(src)?.clone();
        self.put(dst, value)
    }

    pub fn clear(&mut self, slot: usize) -> Result<(), EngineError> {
        self.put(slot, StackValue::null())
    }

    /// Nulls every slot in `from..to`.
    pub fn clear_range(&mut self, from: usize, to: usize) {
        let to = to.min(self.slots.len());
        if from < to {
            self.slots[from..to].fill(StackValue::null());
        }
    }

    /// The evaluation stack contents below `top`, deepest first.
    pub fn stack(&self, top: usize) -> &[StackValue] {
        let base = self.layout.stack_base();
        &self.slots[base..top.clamp(base, self.slots.len())]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout {
            arguments: 1,
            locals: 1,
            max_stack: 2,
        }
    }

    #[test]
    fn test_new_frame_zeroes_locals() {
        let frame = Frame::new(layout(), vec![StackValue::Int32(4)], &[ValueKind::I8]);
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.get_int32(0), Ok(4));
        assert_eq!(frame.get_int64(1), Ok(0));
        assert_eq!(frame.get(2), Ok(&StackValue::null()));
    }

    #[test]
    fn test_typed_access_checks_tag() {
        let mut frame = Frame::new(layout(), vec![], &[ValueKind::I4]);
        frame.put_native_float(2, 1.5).unwrap();
        assert_eq!(frame.get_float(2), Ok(1.5));
        assert!(matches!(
            frame.get_int32(2),
            Err(EngineError::SlotType { slot: 2, expected: "int32", .. })
        ));
    }

    #[test]
    fn test_copy_and_clear() {
        let mut frame = Frame::new(layout(), vec![StackValue::Int64(-3)], &[ValueKind::I4]);
        frame.copy(0, 3).unwrap();
        assert_eq!(frame.get_int64(3), Ok(-3));
        frame.clear(3).unwrap();
        assert_eq!(frame.get_object(3), Ok(ObjectRef(None)));
        assert!(frame.put_int32(4, 1).is_err());
    }

    #[test]
    fn test_frames_get_distinct_ids() {
        let a = Frame::new(layout(), vec![], &[]);
        let b = Frame::new(layout(), vec![], &[]);
        assert_ne!(a.id(), b.id());
    }
}
