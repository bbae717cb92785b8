//! Buffer resources that can cross a channel.
//!
//! - [`ArrayBuffer`] has a single owner. Transferring it moves its memory into
//!   the message and leaves the source detached (zero length, inert).
//! - [`SharedArrayBuffer`] is a refcounted handle to memory that every holder
//!   sees; a message carries the handle, never a copy of the bytes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SHARED_ID: AtomicU64 = AtomicU64::new(1);

struct BufferState {
    bytes: Vec<u8>,
    detached: bool,
    detachable: bool,
}

/// Exclusive, thread-bound byte buffer.
///
/// Clones are handles to the same buffer.
#[derive(Clone)]
pub struct ArrayBuffer {
    inner: Rc<RefCell<BufferState>>,
}

impl ArrayBuffer {
    /// Create a zero-filled buffer.
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Take ownership of `bytes`.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::with_state(bytes, true)
    }

    /// Wrap memory this context cannot give away.
    ///
    /// External buffers listed for transfer are copied instead of detached.
    pub fn external(bytes: Vec<u8>) -> Self {
        Self::with_state(bytes, false)
    }

    fn with_state(bytes: Vec<u8>, detachable: bool) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BufferState {
                bytes,
                detached: false,
                detachable,
            })),
        }
    }

    /// Byte length; zero once detached.
    pub fn len(&self) -> usize {
        self.inner.borrow().bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the contents were transferred away.
    pub fn is_detached(&self) -> bool {
        self.inner.borrow().detached
    }

    /// False for buffers created with [`ArrayBuffer::external`].
    pub fn is_detachable(&self) -> bool {
        self.inner.borrow().detachable
    }

    /// Copy of the current contents.
    pub fn to_vec(&self) -> Vec<u8> {
        self.inner.borrow().bytes.clone()
    }

    /// Run `f` over the contents.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.borrow().bytes)
    }

    /// Run `f` over the mutable contents.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.inner.borrow_mut().bytes)
    }

    /// True if both handles refer to the same buffer.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn identity(&self) -> usize {
        Rc::as_ptr(&self.inner) as *const () as usize
    }

    /// Move the contents out, leaving this handle detached.
    pub(crate) fn take_contents(&self) -> Vec<u8> {
        let mut state = self.inner.borrow_mut();
        state.detached = true;
        std::mem::take(&mut state.bytes)
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.borrow();
        f.debug_struct("ArrayBuffer")
            .field("len", &state.bytes.len())
            .field("detached", &state.detached)
            .field("detachable", &state.detachable)
            .finish()
    }
}

/// Backing store of a [`SharedArrayBuffer`].
///
/// Bytes are packed little-endian into 32-bit atomic words, so byte access
/// and aligned word access observe the same memory.
pub struct SharedMemory {
    id: u64,
    len: usize,
    words: Box<[AtomicU32]>,
}

impl SharedMemory {
    fn zeroed(len: usize) -> Arc<Self> {
        let words = (0..len.div_ceil(4)).map(|_| AtomicU32::new(0)).collect();
        Arc::new(Self {
            id: NEXT_SHARED_ID.fetch_add(1, Ordering::Relaxed),
            len,
            words,
        })
    }

    fn from_bytes(bytes: &[u8]) -> Arc<Self> {
        let words = bytes
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                AtomicU32::new(u32::from_le_bytes(word))
            })
            .collect();
        Arc::new(Self {
            id: NEXT_SHARED_ID.fetch_add(1, Ordering::Relaxed),
            len: bytes.len(),
            words,
        })
    }

    /// Process-unique identifier of this region.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Word holding byte `index`, and the bit shift of that byte inside it.
    fn byte_slot(&self, index: usize) -> Option<(&AtomicU32, u32)> {
        if index >= self.len {
            return None;
        }
        let shift = (index % 4) as u32 * 8;
        self.words.get(index / 4).map(|word| (word, shift))
    }

    /// Word starting at byte `offset`, which must be 4-aligned and in bounds.
    fn word_at(&self, offset: usize) -> Option<&AtomicU32> {
        if offset % 4 != 0 || offset.checked_add(4)? > self.len {
            return None;
        }
        self.words.get(offset / 4)
    }

    fn load_byte(&self, index: usize) -> Option<u8> {
        let (word, shift) = self.byte_slot(index)?;
        Some((word.load(Ordering::SeqCst) >> shift) as u8)
    }

    /// Apply `update` to byte `index`, returning the previous byte.
    fn update_byte(&self, index: usize, update: impl Fn(u8) -> u8) -> Option<u8> {
        let (word, shift) = self.byte_slot(index)?;
        let mask = 0xffu32 << shift;
        let previous = word
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                let byte = update((current >> shift) as u8);
                Some((current & !mask) | (u32::from(byte) << shift))
            })
            .unwrap_or_else(|current| current);
        Some((previous >> shift) as u8)
    }
}

impl fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemory")
            .field("id", &self.id)
            .field("len", &self.len)
            .finish()
    }
}

/// Refcounted handle to memory shared across threads.
#[derive(Clone)]
pub struct SharedArrayBuffer {
    memory: Arc<SharedMemory>,
}

impl SharedArrayBuffer {
    /// Allocate a zero-filled shared region.
    pub fn new(len: usize) -> Self {
        Self {
            memory: SharedMemory::zeroed(len),
        }
    }

    /// Allocate a shared region initialised from `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            memory: SharedMemory::from_bytes(bytes),
        }
    }

    pub(crate) fn from_memory(memory: Arc<SharedMemory>) -> Self {
        Self { memory }
    }

    pub(crate) fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    /// Identifier of the underlying region, equal for every alias.
    pub fn memory_id(&self) -> u64 {
        self.memory.id
    }

    /// Length of the region in bytes.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Read the byte at `index`.
    pub fn load(&self, index: usize) -> Option<u8> {
        self.memory.load_byte(index)
    }

    /// Write the byte at `index`. Returns false when out of bounds.
    pub fn store(&self, index: usize, value: u8) -> bool {
        self.memory.update_byte(index, |_| value).is_some()
    }

    /// Atomically add (wrapping) to the byte at `index`, returning the
    /// previous value.
    pub fn fetch_add(&self, index: usize, value: u8) -> Option<u8> {
        self.memory
            .update_byte(index, |byte| byte.wrapping_add(value))
    }

    /// Read the little-endian `u32` at a 4-aligned `offset`.
    pub fn load_u32(&self, offset: usize) -> Option<u32> {
        self.memory
            .word_at(offset)
            .map(|word| word.load(Ordering::SeqCst))
    }

    /// Atomically add (wrapping) to the little-endian `u32` at a 4-aligned
    /// `offset`, returning the previous value.
    pub fn fetch_add_u32(&self, offset: usize, value: u32) -> Option<u32> {
        self.memory
            .word_at(offset)
            .map(|word| word.fetch_add(value, Ordering::SeqCst))
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let end = offset.checked_add(len)?;
        if end > self.memory.len {
            return None;
        }
        (offset..end).map(|i| self.memory.load_byte(i)).collect()
    }

    /// Copy `bytes` into the region at `offset`. Returns false when out of bounds.
    ///
    /// Each byte is stored atomically; the write as a whole is not.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> bool {
        match offset.checked_add(bytes.len()) {
            Some(end) if end <= self.memory.len => {}
            _ => return false,
        }
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.update_byte(offset + i, |_| *byte);
        }
        true
    }

    /// Copy of the whole region.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes: Vec<u8> = self
            .memory
            .words
            .iter()
            .flat_map(|word| word.load(Ordering::SeqCst).to_le_bytes())
            .collect();
        bytes.truncate(self.memory.len);
        bytes
    }

    /// True if both handles alias the same memory.
    pub fn same_memory(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    /// Number of live handles to the region, across all threads.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.memory)
    }
}

impl fmt::Debug for SharedArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedArrayBuffer")
            .field("memory_id", &self.memory.id)
            .field("len", &self.memory.len())
            .finish()
    }
}
