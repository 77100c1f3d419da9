//! async-sdmmc - Work Queue
//!
//! A fixed-capacity arena of slots addressed by small integer handles. Slots
//! are linked into a FIFO queue; finished slots are parked on a garbage stack
//! which is only drained from the idle path, and reused first by `insert`.


/// Refers to one slot in a [`SlotQueue`].
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Handle(pub(crate) u8);

impl Handle {
    /// The slot index this handle refers to.
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Debug)]
struct Slot<T> {
    value: Option<T>,
    next: Option<u8>,
    linked: bool,
}

/// A FIFO of `T` stored in `N` fixed slots.
///
/// Linking and unlinking nodes happens with interrupts masked, so the interrupt
/// path may pop while task context pushes.
#[derive(Debug)]
pub struct SlotQueue<T, const N: usize> {
    slots: [Slot<T>; N],
    head: Option<u8>,
    tail: Option<u8>,
    free: Option<u8>,
    garbage: Option<u8>,
    len: usize,
}

impl<T, const N: usize> SlotQueue<T, N> {
    /// Create an empty queue with every slot on the free list.
    pub fn new() -> Self {
        assert!(N <= usize::from(u8::MAX));
        let slots = core::array::from_fn(|i| Slot {
            value: None,
            next: if i + 1 < N { Some((i + 1) as u8) } else { None },
            linked: false,
        });
        SlotQueue {
            slots,
            head: None,
            tail: None,
            free: if N > 0 { Some(0) } else { None },
            garbage: None,
            len: 0,
        }
    }

    /// Store a value in a slot, preferring recycled storage. The value is not
    /// queued yet. Gives the value back if every slot is taken.
    pub fn insert(&mut self, value: T) -> Result<Handle, T> {
        let index = match self.garbage.or(self.free) {
            Some(index) => index,
            None => return Err(value),
        };
        let slot = &mut self.slots[usize::from(index)];
        if self.garbage == Some(index) {
            self.garbage = slot.next;
        } else {
            self.free = slot.next;
        }
        slot.value = Some(value);
        slot.next = None;
        slot.linked = false;
        Ok(Handle(index))
    }

    /// Link a stored slot onto the tail of the queue.
    pub fn push_back(&mut self, handle: Handle) {
        critical_section::with(|_| {
            self.slots[handle.index()].next = None;
            self.slots[handle.index()].linked = true;
            match self.tail {
                Some(tail) => self.slots[usize::from(tail)].next = Some(handle.0),
                None => self.head = Some(handle.0),
            }
            self.tail = Some(handle.0);
            self.len += 1;
        })
    }

    /// Link a stored slot in front of the current head.
    pub fn push_front(&mut self, handle: Handle) {
        critical_section::with(|_| {
            self.slots[handle.index()].next = self.head;
            self.slots[handle.index()].linked = true;
            if self.tail.is_none() {
                self.tail = Some(handle.0);
            }
            self.head = Some(handle.0);
            self.len += 1;
        })
    }

    /// The slot at the head of the queue, the only one allowed to progress.
    pub fn head(&self) -> Option<Handle> {
        self.head.map(Handle)
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots.get(handle.index()).and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .and_then(|s| s.value.as_mut())
    }

    /// Unlink the head. Its value stays in the slot until it is retired or
    /// taken.
    pub fn pop_front(&mut self) -> Option<Handle> {
        critical_section::with(|_| {
            let head = self.head?;
            let slot = &mut self.slots[usize::from(head)];
            self.head = slot.next;
            slot.next = None;
            slot.linked = false;
            if self.head.is_none() {
                self.tail = None;
            }
            self.len -= 1;
            Some(Handle(head))
        })
    }

    /// Is this slot currently linked into the queue?
    pub fn is_queued(&self, handle: Handle) -> bool {
        self.slots
            .get(handle.index())
            .map(|s| s.linked)
            .unwrap_or(false)
    }

    /// Move an unlinked slot onto the garbage stack, returning its value.
    pub fn retire(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.linked {
            return None;
        }
        let value = slot.value.take()?;
        slot.next = self.garbage;
        self.garbage = Some(handle.0);
        Some(value)
    }

    /// Return an unlinked slot straight to the free list, returning its value.
    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.linked {
            return None;
        }
        let value = slot.value.take()?;
        slot.next = self.free;
        self.free = Some(handle.0);
        Some(value)
    }

    /// Drain the garbage stack onto the free list. Returns how many slots
    /// were reclaimed.
    pub fn collect_garbage(&mut self) -> usize {
        let mut count = 0;
        while let Some(index) = self.garbage {
            let slot = &mut self.slots[usize::from(index)];
            self.garbage = slot.next;
            slot.next = self.free;
            self.free = Some(index);
            count += 1;
        }
        count
    }

    /// Walk the queue from head to tail.
    pub fn iter(&self) -> Iter<'_, T, N> {
        Iter {
            queue: self,
            next: self.head,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of queued slots.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Number of slots parked on the garbage stack.
    pub fn garbage_len(&self) -> usize {
        let mut count = 0;
        let mut next = self.garbage;
        while let Some(index) = next {
            count += 1;
            next = self.slots[usize::from(index)].next;
        }
        count
    }
}

impl<T, const N: usize> Default for SlotQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over queued slots, head first.
pub struct Iter<'a, T, const N: usize> {
    queue: &'a SlotQueue<T, N>,
    next: Option<u8>,
}

impl<'a, T, const N: usize> Iterator for Iter<'a, T, N> {
    type Item = (Handle, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(index) = self.next {
            let slot = &self.queue.slots[usize::from(index)];
            self.next = slot.next;
            if let Some(value) = slot.value.as_ref() {
                return Some((Handle(index), value));
            }
        }
        None
    }
}

// ****************************************************************************
//
// End Of File
//
// ****************************************************************************
