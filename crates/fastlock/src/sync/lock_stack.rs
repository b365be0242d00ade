//! Per-thread record of fast-locked objects.
//!
//! A fast lock is represented solely by the presence of the object on the owning
//! thread's lock-stack. Entries are kept in acquisition order, index 0 being the
//! oldest. A recursive acquisition pushes the object once more, so an object may
//! occur several times.
//!
//! The layout is `#[repr(C)]` and published through [`LockStack::TOP_OFFSET`],
//! [`LockStack::BASE_OFFSET`], [`LockStack::start_offset`] and [`LockStack::end_offset`]
//! so that generated code can address the fields directly.

use std::{
    fmt,
    mem::{offset_of, size_of},
};

use mmtk::{
    util::{Address, ObjectReference},
    vm::{slot::SimpleSlot, SlotVisitor},
};

use crate::options::syncflags_verify_lock_stack;

/// Poison value stored right below the first slot of every lock-stack.
///
/// Generated code that decrements `top` and loads the slot below reads this value on
/// underflow instead of unrelated memory. It is not word aligned and therefore never
/// equal to a valid object reference.
#[cfg(target_pointer_width = "64")]
pub const BAD_OOP_SENTINEL: usize = 0x2BAD_4B0B_BAAD_BABE;
#[cfg(target_pointer_width = "32")]
pub const BAD_OOP_SENTINEL: usize = 0xBAAD_BABE;

const SLOT_SIZE: usize = size_of::<Option<ObjectReference>>();

#[repr(C)]
pub struct LockStack {
    /// Number of live entries in `base`.
    top: u32,
    wait_was_inflated: bool,
    bad_oop_sentinel: usize,
    base: [Option<ObjectReference>; LockStack::CAPACITY],
}

const _: () = {
    assert!(SLOT_SIZE == size_of::<usize>());
    assert!(BAD_OOP_SENTINEL % size_of::<usize>() != 0);
    assert!(offset_of!(LockStack, base) == offset_of!(LockStack, bad_oop_sentinel) + SLOT_SIZE);
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    TopOutOfBounds(u32),
    EmptyLiveSlot(usize),
    StaleDeadSlot(usize),
    SentinelClobbered(usize),
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TopOutOfBounds(top) => write!(
                f,
                "top {} exceeds capacity {}",
                top,
                LockStack::CAPACITY
            ),
            Self::EmptyLiveSlot(index) => write!(f, "live slot {} holds no object", index),
            Self::StaleDeadSlot(index) => write!(f, "dead slot {} was not cleared", index),
            Self::SentinelClobbered(value) => {
                write!(f, "underflow sentinel overwritten with {:#x}", value)
            }
        }
    }
}

impl std::error::Error for VerifyError {}

#[cold]
#[inline(never)]
#[track_caller]
fn contract_violation(what: fmt::Arguments<'_>) -> ! {
    log::error!(target: "vmkit::lock_stack", "{}", what);
    panic!("lock-stack contract violation: {}", what);
}

impl LockStack {
    pub const CAPACITY: usize = 8;

    pub const TOP_OFFSET: usize = offset_of!(Self, top);
    pub const BASE_OFFSET: usize = offset_of!(Self, base);
    pub const SENTINEL_OFFSET: usize = offset_of!(Self, bad_oop_sentinel);

    pub const fn new() -> Self {
        Self {
            top: 0,
            wait_was_inflated: false,
            bad_oop_sentinel: BAD_OOP_SENTINEL,
            base: [None; Self::CAPACITY],
        }
    }

    /// Byte offset of the first slot.
    pub const fn start_offset() -> usize {
        Self::BASE_OFFSET
    }

    /// Byte offset one past the last slot.
    pub const fn end_offset() -> usize {
        Self::BASE_OFFSET + Self::CAPACITY * SLOT_SIZE
    }

    /// Given a byte offset in `[start_offset, end_offset]` calculate the index into the lock-stack.
    #[track_caller]
    pub fn to_index(offset: usize) -> usize {
        if offset < Self::start_offset()
            || offset > Self::end_offset()
            || (offset - Self::start_offset()) % SLOT_SIZE != 0
        {
            contract_violation(format_args!("{} is not a slot boundary", offset));
        }

        (offset - Self::start_offset()) / SLOT_SIZE
    }

    fn live(&self) -> &[Option<ObjectReference>] {
        &self.base[..self.top as usize]
    }

    fn count(&self, o: ObjectReference) -> usize {
        self.live().iter().filter(|entry| **entry == Some(o)).count()
    }

    #[track_caller]
    fn entry(&self, index: usize) -> ObjectReference {
        match self.live().get(index).copied().flatten() {
            Some(o) => o,
            None => contract_violation(format_args!(
                "no object at index {} (top = {})",
                index, self.top
            )),
        }
    }

    #[track_caller]
    fn count_present(&self, o: ObjectReference) -> usize {
        let count = self.count(o);
        if count == 0 {
            contract_violation(format_args!("{:?} is not on the lock-stack", o));
        }
        count
    }

    /// Checks the structural invariants of this lock-stack.
    pub fn check_consistency(&self) -> Result<(), VerifyError> {
        if self.top as usize > Self::CAPACITY {
            return Err(VerifyError::TopOutOfBounds(self.top));
        }

        if self.bad_oop_sentinel != BAD_OOP_SENTINEL {
            return Err(VerifyError::SentinelClobbered(self.bad_oop_sentinel));
        }

        let top = self.top as usize;
        if let Some(index) = self.base[..top].iter().position(Option::is_none) {
            return Err(VerifyError::EmptyLiveSlot(index));
        }

        if let Some(index) = self.base[top..].iter().position(Option::is_some) {
            return Err(VerifyError::StaleDeadSlot(top + index));
        }

        Ok(())
    }

    /// Verifies consistency of the lock-stack when `verify_lock_stack` is enabled.
    #[track_caller]
    pub fn verify(&self, msg: &str) {
        if !syncflags_verify_lock_stack() {
            return;
        }

        if let Err(error) = self.check_consistency() {
            contract_violation(format_args!("{}: {}", msg, error));
        }
    }

    /// Return true if we have room to push `n` objects onto this lock-stack.
    pub fn can_push(&self, n: usize) -> bool {
        self.top as usize + n <= Self::CAPACITY
    }

    pub fn is_full(&self) -> bool {
        self.top as usize == Self::CAPACITY
    }

    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    pub fn len(&self) -> usize {
        self.top as usize
    }

    /// Pushes an object on this lock-stack.
    ///
    /// The fast-lock protocol must inflate before the stack overflows, pushing onto
    /// a full stack is fatal.
    #[track_caller]
    pub fn push(&mut self, o: ObjectReference) {
        self.verify("pre-push");
        if !self.can_push(1) {
            contract_violation(format_args!("push of {:?} onto a full lock-stack", o));
        }

        self.base[self.top as usize] = Some(o);
        self.top += 1;
        self.verify("post-push");
    }

    /// Removes and returns the most recently pushed object.
    #[track_caller]
    pub fn pop(&mut self) -> ObjectReference {
        self.verify("pre-pop");
        if self.is_empty() {
            contract_violation(format_args!("pop from an empty lock-stack"));
        }

        let o = self.entry(self.len() - 1);
        self.top -= 1;
        self.base[self.top as usize] = None;
        self.verify("post-pop");
        o
    }

    /// The oldest object on this lock-stack.
    #[track_caller]
    pub fn bottom(&self) -> ObjectReference {
        self.entry(0)
    }

    /// The most recently pushed object.
    #[track_caller]
    pub fn top_entry(&self) -> ObjectReference {
        if self.is_empty() {
            contract_violation(format_args!("top of an empty lock-stack"));
        }
        self.entry(self.len() - 1)
    }

    /// Is `o` locked more than once by the owning thread.
    ///
    /// Precondition: this lock-stack must contain `o`.
    #[track_caller]
    pub fn is_recursive(&self, o: ObjectReference) -> bool {
        self.count_present(o) >= 2
    }

    /// Records a nested acquisition of `o` if it is the most recently locked object.
    ///
    /// Returns false without touching the stack if `o` is not on top or the stack has
    /// no room left; the caller then has to take the inflating slow path.
    pub fn try_recursive_enter(&mut self, o: ObjectReference) -> bool {
        if self.is_empty() || self.top_entry() != o {
            return false;
        }

        if !self.can_push(1) {
            log::trace!(
                target: "vmkit::lock_stack",
                "recursive enter of {:?} refused: lock-stack is full",
                o
            );
            return false;
        }

        self.push(o);
        true
    }

    /// Undoes one nested acquisition of `o`.
    ///
    /// Returns false if `o` is held only once (or is not on top), in which case the caller
    /// performs the final release.
    ///
    /// Precondition: this lock-stack must contain `o`.
    #[track_caller]
    pub fn try_recursive_exit(&mut self, o: ObjectReference) -> bool {
        if self.count_present(o) < 2 || self.top_entry() != o {
            return false;
        }

        self.pop();
        true
    }

    /// Removes every occurrence of `o` from an arbitrary location of this lock-stack.
    ///
    /// Precondition: this lock-stack must contain `o`.
    /// Returns the number of entries removed.
    #[track_caller]
    pub fn remove(&mut self, o: ObjectReference) -> usize {
        self.verify("pre-remove");
        let end = self.len();
        let mut inserted = 0;

        for i in 0..end {
            if self.base[i] != Some(o) {
                if inserted != i {
                    self.base[inserted] = self.base[i];
                }
                inserted += 1;
            }
        }

        let removed = end - inserted;
        if removed == 0 {
            contract_violation(format_args!("remove of {:?} which is not on the lock-stack", o));
        }

        self.base[inserted..end].fill(None);
        self.top = inserted as u32;
        self.verify("post-remove");

        removed
    }

    /// Tests whether `o` is on this lock-stack.
    pub fn contains(&self, o: ObjectReference) -> bool {
        self.live().contains(&Some(o))
    }

    /// Live entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = ObjectReference> + '_ {
        self.live().iter().flatten().copied()
    }

    /// Visits every live entry in push order. The visitor may overwrite the entry, e.g.
    /// with the forwarded address of a moved object.
    pub fn oops_do(&mut self, mut visit: impl FnMut(&mut ObjectReference)) {
        let top = self.len();
        for o in self.base[..top].iter_mut().flatten() {
            visit(o);
        }

        self.verify("post-oops_do");
    }

    /// Reports every live entry as a root slot.
    pub fn scan_slots<SV: SlotVisitor<SimpleSlot>>(&mut self, visitor: &mut SV) {
        let top = self.len();
        for entry in self.base[..top].iter_mut() {
            let slot = entry as *mut Option<ObjectReference>;
            visitor.visit_slot(SimpleSlot::from_address(Address::from_mut_ptr(slot)));
        }
    }

    pub fn wait_was_inflated(&self) -> bool {
        self.wait_was_inflated
    }

    pub fn set_wait_was_inflated(&mut self) {
        self.wait_was_inflated = true;
    }

    pub fn clear_wait_was_inflated(&mut self) {
        self.wait_was_inflated = false;
    }

    #[cfg(test)]
    pub(crate) fn raw_parts_mut(
        &mut self,
    ) -> (&mut u32, &mut usize, &mut [Option<ObjectReference>; Self::CAPACITY]) {
        (&mut self.top, &mut self.bad_oop_sentinel, &mut self.base)
    }
}

impl Default for LockStack {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockStack")
            .field("top", &self.top)
            .field("wait_was_inflated", &self.wait_was_inflated)
            .field("entries", &self.iter().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::mock_object as obj;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn stack_of(objs: &[ObjectReference]) -> LockStack {
        let mut ls = LockStack::new();
        for &o in objs {
            ls.push(o);
        }
        ls
    }

    #[test]
    fn fills_up_exactly_at_capacity() {
        let mut ls = LockStack::new();
        assert!(ls.is_empty());

        for i in 1..=LockStack::CAPACITY {
            assert!(!ls.is_full());
            assert!(ls.can_push(1));
            assert!(ls.can_push(LockStack::CAPACITY - ls.len()));
            assert!(!ls.can_push(LockStack::CAPACITY - ls.len() + 1));
            ls.push(obj(i));
        }

        assert!(ls.is_full());
        assert!(!ls.can_push(1));
        assert!(ls.can_push(0));
        assert_eq!(ls.len(), LockStack::CAPACITY);
    }

    #[test]
    #[should_panic(expected = "full lock-stack")]
    fn push_onto_full_stack_is_fatal() {
        init_logging();
        let mut ls = stack_of(&(1..=LockStack::CAPACITY).map(obj).collect::<Vec<_>>());
        ls.push(obj(100));
    }

    #[test]
    fn bottom_is_oldest_and_top_is_newest() {
        let ls = stack_of(&[obj(1), obj(2), obj(3)]);
        assert_eq!(ls.bottom(), obj(1));
        assert_eq!(ls.top_entry(), obj(3));

        let single = stack_of(&[obj(7)]);
        assert_eq!(single.bottom(), single.top_entry());
    }

    #[test]
    #[should_panic(expected = "empty lock-stack")]
    fn top_of_empty_stack_is_fatal() {
        LockStack::new().top_entry();
    }

    #[test]
    #[should_panic(expected = "no object at index 0")]
    fn bottom_of_empty_stack_is_fatal() {
        LockStack::new().bottom();
    }

    #[test]
    fn recursion_is_detected_across_positions() {
        let (a, b) = (obj(1), obj(2));
        let ls = stack_of(&[a, b, a]);

        assert!(ls.is_recursive(a));
        assert!(!ls.is_recursive(b));
        assert_eq!(ls.bottom(), a);
    }

    #[test]
    #[should_panic(expected = "is not on the lock-stack")]
    fn is_recursive_requires_presence() {
        stack_of(&[obj(1)]).is_recursive(obj(2));
    }

    #[test]
    fn recursive_enter_only_on_top() {
        let (a, b) = (obj(1), obj(2));
        let mut ls = LockStack::new();

        assert!(!ls.try_recursive_enter(a));
        assert!(ls.is_empty());

        ls.push(a);
        ls.push(b);
        assert!(!ls.try_recursive_enter(a));
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![a, b]);

        assert!(ls.try_recursive_enter(b));
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![a, b, b]);
        assert!(ls.is_recursive(b));
    }

    #[test]
    fn recursive_enter_refused_when_full() {
        let a = obj(1);
        let mut ls = stack_of(&[a; LockStack::CAPACITY]);

        assert!(!ls.try_recursive_enter(a));
        assert_eq!(ls.len(), LockStack::CAPACITY);
    }

    #[test]
    fn recursive_exit_folds_one_level() {
        let (a, b) = (obj(1), obj(2));
        let mut ls = stack_of(&[b, a]);
        assert!(ls.try_recursive_enter(a));
        assert!(ls.try_recursive_enter(a));

        assert!(ls.try_recursive_exit(a));
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![b, a, a]);
        assert!(ls.try_recursive_exit(a));
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![b, a]);

        // Final release goes through the non-recursive path.
        assert!(!ls.try_recursive_exit(a));
        assert_eq!(ls.len(), 2);
        assert_eq!(ls.pop(), a);
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![b]);
    }

    #[test]
    fn recursive_exit_requires_top_entry() {
        let (a, b) = (obj(1), obj(2));
        let mut ls = stack_of(&[a, a, b]);

        assert!(!ls.try_recursive_exit(a));
        assert_eq!(ls.len(), 3);
    }

    #[test]
    fn remove_compacts_and_preserves_order() {
        let (a, b, c) = (obj(1), obj(2), obj(3));
        let mut ls = stack_of(&[a, b, a]);

        assert_eq!(ls.remove(a), 2);
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![b]);
        assert!(!ls.contains(a));

        let mut ls = stack_of(&[c, a, b, a, c]);
        assert_eq!(ls.remove(a), 2);
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![c, b, c]);
        assert_eq!(ls.check_consistency(), Ok(()));
    }

    #[test]
    #[should_panic(expected = "not on the lock-stack")]
    fn remove_requires_presence() {
        stack_of(&[obj(1)]).remove(obj(2));
    }

    #[test]
    fn oops_do_visits_live_entries_in_order() {
        let (a, b, c) = (obj(1), obj(2), obj(3));
        let mut ls = stack_of(&[a, b, a]);
        let mut seen = Vec::new();

        ls.oops_do(|o| {
            seen.push(*o);
            if *o == a {
                *o = c;
            }
        });

        assert_eq!(seen, vec![a, b, a]);
        assert!(!ls.contains(a));
        assert!(ls.is_recursive(c));
        assert_eq!(ls.remove(c), 2);
        assert_eq!(ls.iter().collect::<Vec<_>>(), vec![b]);
    }

    struct Collect(Vec<SimpleSlot>);

    impl SlotVisitor<SimpleSlot> for Collect {
        fn visit_slot(&mut self, slot: SimpleSlot) {
            self.0.push(slot);
        }
    }

    #[test]
    fn scan_slots_reports_updatable_roots() {
        use mmtk::vm::slot::Slot;

        let (a, b) = (obj(1), obj(2));
        let mut ls = stack_of(&[a, b]);
        let mut visitor = Collect(Vec::new());
        ls.scan_slots(&mut visitor);

        assert_eq!(visitor.0.len(), 2);
        assert_eq!(visitor.0[0].load(), Some(a));
        assert_eq!(visitor.0[1].load(), Some(b));

        visitor.0[1].store(obj(3));
        assert_eq!(ls.top_entry(), obj(3));
    }

    #[test]
    fn wait_flag_is_independent_of_contents() {
        let mut ls = stack_of(&[obj(1)]);
        assert!(!ls.wait_was_inflated());

        ls.set_wait_was_inflated();
        assert!(ls.wait_was_inflated());
        assert_eq!(ls.len(), 1);

        ls.pop();
        assert!(ls.wait_was_inflated());
        ls.clear_wait_was_inflated();
        assert!(!ls.wait_was_inflated());
    }

    #[test]
    fn layout_places_sentinel_below_first_slot() {
        assert_eq!(
            LockStack::SENTINEL_OFFSET + size_of::<usize>(),
            LockStack::BASE_OFFSET
        );
        assert_eq!(
            LockStack::end_offset() - LockStack::start_offset(),
            LockStack::CAPACITY * size_of::<usize>()
        );
        assert_eq!(LockStack::to_index(LockStack::start_offset()), 0);
        assert_eq!(
            LockStack::to_index(LockStack::end_offset()),
            LockStack::CAPACITY
        );

        let ls = stack_of(&[obj(1)]);
        let raw = &ls as *const LockStack as *const u8;
        let sentinel = unsafe {
            raw.add(LockStack::BASE_OFFSET - size_of::<usize>())
                .cast::<usize>()
                .read()
        };
        let top = unsafe { raw.add(LockStack::TOP_OFFSET).cast::<u32>().read() };
        assert_eq!(sentinel, BAD_OOP_SENTINEL);
        assert_ne!(sentinel % size_of::<usize>(), 0);
        assert_eq!(top, 1);
    }

    #[test]
    #[should_panic(expected = "slot boundary")]
    fn misaligned_offset_is_rejected() {
        LockStack::to_index(LockStack::start_offset() + 1);
    }

    #[test]
    fn consistency_check_detects_corruption() {
        init_logging();
        let mut ls = stack_of(&[obj(1), obj(2)]);
        assert_eq!(ls.check_consistency(), Ok(()));

        {
            let (_, sentinel, _) = ls.raw_parts_mut();
            *sentinel = 0;
        }
        assert_eq!(ls.check_consistency(), Err(VerifyError::SentinelClobbered(0)));

        let mut ls = stack_of(&[obj(1), obj(2)]);
        {
            let (top, _, base) = ls.raw_parts_mut();
            *top = 1;
            assert!(base[1].is_some());
        }
        assert_eq!(ls.check_consistency(), Err(VerifyError::StaleDeadSlot(1)));

        let mut ls = LockStack::new();
        {
            let (top, _, _) = ls.raw_parts_mut();
            *top = 9;
        }
        assert_eq!(ls.check_consistency(), Err(VerifyError::TopOutOfBounds(9)));
    }
}
