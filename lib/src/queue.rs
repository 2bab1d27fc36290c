//! The buffer queue, i.e. the pool of buffers shared by a producer and a
//! consumer.
//!
//! Buffers are identified by their sequence number and go through the
//! following states:
//!
//! ```text
//!            request              flush               acquire
//! Released ----------> Requested -------> Flushed ------------> Acquired
//!    ^                     |                                        |
//!    |       cancel        |                release                 |
//!    +---------------------+----------------------------------------+
//! ```
//!
//! Released buffers are kept in the free list, flushed buffers in the dirty
//! list, in the order they were flushed. Buffers allocated outside of the
//! queue can also be attached, in which case they start in the `Attached`
//! state and can be flushed or released directly.
//!
//! All the state of a queue is protected by a single lock. The only operation
//! that can block is `request_buffer`, which waits (for at most the timeout
//! given in its config) for a buffer to be released when the queue is full.
//!
//! In shared mode the queue holds a single buffer that the producer and the
//! consumer access at the same time: requesting and acquiring always return
//! that buffer, whatever its state.
mod listener;
mod metadata;
mod slot;

pub use listener::*;
pub use metadata::*;
pub use slot::SlotState;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, error, warn};
use nix::unistd::getpid;

use crate::error::{Result, SurfaceError};
use crate::extra_data::BufferExtraData;
use crate::fence::Fence;
use crate::memory::{Allocator, BufferUsage, SurfaceBuffer};
use crate::{
    BufferFlushConfig, BufferRequestConfig, ColorGamut, Rect, ScalingMode, Transform,
    VerifyAllocInfo, DEFAULT_QUEUE_SIZE, MAX_QUEUE_SIZE, MAX_STRIDE_ALIGNMENT,
    MIN_STRIDE_ALIGNMENT,
};
use slot::BufferSlot;

static NEXT_QUEUE_ID: AtomicU32 = AtomicU32::new(0);

/// Queue ids are unique across processes: the pid fills the upper half.
fn new_unique_id() -> u64 {
    ((getpid().as_raw() as u64) << 32) | NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed) as u64
}

/// Current time in microseconds, used to timestamp flushed buffers.
fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Result of a successful `request_buffer`.
#[derive(Debug)]
pub struct RequestBufferReturn {
    pub sequence: u32,
    /// Only set if the producer has never seen this buffer, or must forget
    /// what it knows about it. `None` means the producer can reuse the buffer
    /// it cached for `sequence`.
    pub buffer: Option<Arc<SurfaceBuffer>>,
    /// Fence to wait on before writing into the buffer.
    pub fence: Arc<Fence>,
    /// Sequence numbers of the buffers deleted since the last request. The
    /// producer must drop them from its cache.
    pub deleting_buffers: Vec<u32>,
    /// Whether a free buffer with a different config has been replaced by a
    /// new allocation to satisfy this request.
    pub realloc_happened: bool,
}

/// Result of a successful `acquire_buffer`.
#[derive(Debug)]
pub struct AcquiredBuffer {
    pub buffer: Arc<SurfaceBuffer>,
    /// Fence to wait on before reading the buffer.
    pub fence: Arc<Fence>,
    /// Content timestamp, in microseconds.
    pub timestamp: i64,
    pub damage: Rect,
}

impl AcquiredBuffer {
    pub fn seq_num(&self) -> u32 {
        self.buffer.seq_num()
    }
}

struct QueueState {
    queue_size: u32,
    default_width: i32,
    default_height: i32,
    default_usage: BufferUsage,
    transform: Transform,
    slots: BTreeMap<u32, BufferSlot>,
    free_list: VecDeque<u32>,
    dirty_list: VecDeque<u32>,
    /// Buffers deleted since the last reuse, to be reported to the producer.
    deleting_list: Vec<u32>,
    /// Cleared when the consumer goes away.
    status: bool,
    /// Set when the producer dropped its buffer cache: every buffer must be
    /// sent again, until it has seen all of them.
    producer_cache_clean: bool,
    producer_cache_list: Vec<u32>,
    tunnel_handle: Option<Arc<TunnelHandle>>,
    delete_listener: Option<DeleteBufferListener>,
}

impl QueueState {
    fn used_size(&self) -> u32 {
        self.slots.len() as u32
    }

    fn slot(&self, sequence: u32) -> Result<&BufferSlot> {
        self.slots.get(&sequence).ok_or_else(|| {
            debug!("Buffer {} not found in cache", sequence);
            SurfaceError::NoEntry
        })
    }

    fn slot_mut(&mut self, sequence: u32) -> Result<&mut BufferSlot> {
        self.slots.get_mut(&sequence).ok_or_else(|| {
            debug!("Buffer {} not found in cache", sequence);
            SurfaceError::NoEntry
        })
    }

    /// Pick a free buffer for a request with `config`, preferring one
    /// allocated with the same config. In shared mode this is always the
    /// resident buffer, which stays where it is.
    fn pop_from_free_list(&mut self, is_shared: bool, config: &BufferRequestConfig) -> Option<u32> {
        if is_shared {
            if let Some(&sequence) = self.slots.keys().next() {
                return Some(sequence);
            }
        }

        let slots = &self.slots;
        match self
            .free_list
            .iter()
            .position(|seq| slots.get(seq).map_or(false, |s| s.config == *config))
        {
            Some(pos) => self.free_list.remove(pos),
            None => self.free_list.pop_front(),
        }
    }

    fn notify_delete(&self, sequence: u32) {
        if let Some(on_delete) = &self.delete_listener {
            on_delete(sequence);
        }
    }

    /// Remove a buffer for good, and remember to tell the producer.
    fn delete_buffer_in_cache(&mut self, sequence: u32) {
        if self.slots.remove(&sequence).is_some() {
            self.notify_delete(sequence);
            self.deleting_list.push(sequence);
        }
    }

    /// Get rid of `count` buffers, taking free ones first, then the oldest
    /// flushed ones. If that is not enough, buffers in use are flagged to be
    /// deleted as soon as they come back.
    fn delete_buffers(&mut self, mut count: u32) {
        while count > 0 {
            match self.free_list.pop_front() {
                Some(sequence) => self.delete_buffer_in_cache(sequence),
                None => break,
            }
            count -= 1;
        }

        while count > 0 {
            match self.dirty_list.pop_front() {
                Some(sequence) => self.delete_buffer_in_cache(sequence),
                None => break,
            }
            count -= 1;
        }

        for slot in self.slots.values_mut().filter(|s| !s.is_deleting) {
            if count == 0 {
                break;
            }
            slot.is_deleting = true;
            count -= 1;
        }
    }

    /// Delete every buffer.
    fn clear(&mut self) {
        for &sequence in self.slots.keys() {
            self.notify_delete(sequence);
        }
        self.slots.clear();
        self.free_list.clear();
        self.dirty_list.clear();
        self.deleting_list.clear();
    }

    fn set_producer_cache_clean(&mut self, flag: bool) {
        self.producer_cache_clean = flag;
        self.producer_cache_list.clear();
    }

    /// Whether the producer has been sent every resident buffer since its
    /// cache was cleaned.
    fn producer_cache_complete(&self) -> bool {
        self.slots
            .keys()
            .all(|seq| self.producer_cache_list.contains(seq))
    }
}

/// A bounded pool of buffers. See the module documentation.
pub struct BufferQueue {
    name: String,
    unique_id: u64,
    is_shared: bool,
    allocator: Arc<dyn Allocator>,
    state: Mutex<QueueState>,
    /// Signaled whenever a blocked `request_buffer` may be able to proceed.
    request_cond: Condvar,
    listener: Mutex<Option<Arc<dyn ConsumerListener>>>,
    release_listener: Mutex<Option<ReleaseListener>>,
}

impl BufferQueue {
    pub fn new(name: &str, is_shared: bool, allocator: Arc<dyn Allocator>) -> Self {
        let unique_id = new_unique_id();
        debug!(
            "Creating {}queue {} ({:#x})",
            if is_shared { "shared " } else { "" },
            name,
            unique_id
        );

        BufferQueue {
            name: name.to_owned(),
            unique_id,
            is_shared,
            allocator,
            state: Mutex::new(QueueState {
                queue_size: if is_shared { 1 } else { DEFAULT_QUEUE_SIZE },
                default_width: 0,
                default_height: 0,
                default_usage: BufferUsage::empty(),
                transform: Default::default(),
                slots: BTreeMap::new(),
                free_list: VecDeque::new(),
                dirty_list: VecDeque::new(),
                deleting_list: Vec::new(),
                status: true,
                producer_cache_clean: false,
                producer_cache_list: Vec::new(),
                tunnel_handle: None,
                delete_listener: None,
            }),
            request_cond: Condvar::new(),
            listener: Mutex::new(None),
            release_listener: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<QueueState> {
        self.state.lock().unwrap()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn is_shared(&self) -> bool {
        self.is_shared
    }

    /// Number of buffers currently owned by the queue, in any state.
    pub fn used_size(&self) -> u32 {
        self.lock().used_size()
    }

    fn check_request_config(config: &BufferRequestConfig) -> Result<()> {
        let align = config.stride_alignment;
        if !(MIN_STRIDE_ALIGNMENT..=MAX_STRIDE_ALIGNMENT).contains(&align) {
            warn!(
                "Stride alignment must be within [{}, {}], got {}",
                MIN_STRIDE_ALIGNMENT, MAX_STRIDE_ALIGNMENT, align
            );
            return Err(SurfaceError::InvalidArguments);
        }
        if align & (align - 1) != 0 {
            warn!("Stride alignment must be a power of 2, got {}", align);
            return Err(SurfaceError::InvalidArguments);
        }
        if config.color_gamut == ColorGamut::Invalid {
            warn!("Invalid color gamut requested");
            return Err(SurfaceError::InvalidArguments);
        }

        Ok(())
    }

    /// Allocate a new buffer for `config` and register it as requested.
    fn alloc_buffer(
        &self,
        state: &mut QueueState,
        config: &BufferRequestConfig,
    ) -> Result<Arc<SurfaceBuffer>> {
        let handle = self.allocator.alloc(config).map_err(|e| {
            error!("Failed to allocate buffer [{}] for {}: {}", config, self.name, e);
            e
        })?;
        self.allocator.map(&handle).map_err(|e| {
            error!("Failed to map buffer for {}: {}", self.name, e);
            e
        })?;

        let buffer = Arc::new(SurfaceBuffer::new(handle, config));
        state.slots.insert(
            buffer.seq_num(),
            BufferSlot::new(Arc::clone(&buffer), SlotState::Requested, config.clone()),
        );

        Ok(buffer)
    }

    /// Hand out the free buffer `sequence` for a request with `config`.
    fn reuse_buffer(
        &self,
        state: &mut QueueState,
        sequence: u32,
        config: &BufferRequestConfig,
        extra_data: &mut BufferExtraData,
    ) -> Result<RequestBufferReturn> {
        let need_realloc = match state.slots.get(&sequence) {
            Some(slot) => slot.config != *config,
            None => return Err(SurfaceError::InvalidArguments),
        };

        let mut sequence = sequence;
        if need_realloc {
            if self.is_shared {
                warn!("Cannot change the config of the buffer of a shared queue");
                return Err(SurfaceError::InvalidArguments);
            }
            state.delete_buffer_in_cache(sequence);
            self.request_cond.notify_all();
            sequence = self.alloc_buffer(state, config)?.seq_num();
        }

        let slot = state.slot_mut(sequence)?;
        slot.update_state(SlotState::Requested);
        let fence = Arc::clone(&slot.fence);
        let buffer = Arc::clone(&slot.buffer);
        *extra_data = buffer.extra_data();
        if self.is_shared {
            state.free_list.retain(|&seq| seq != sequence);
        }

        let deleting_buffers = std::mem::take(&mut state.deleting_list);

        let send_buffer = need_realloc || self.is_shared || state.producer_cache_clean;
        if state.producer_cache_clean {
            state.producer_cache_list.push(sequence);
            if state.producer_cache_complete() {
                state.set_producer_cache_clean(false);
            }
        }
        debug!(
            "Reusing buffer {} [{}] of {}{}",
            sequence,
            config,
            self.name,
            if need_realloc { " (reallocated)" } else { "" }
        );

        Ok(RequestBufferReturn {
            sequence,
            buffer: if send_buffer { Some(buffer) } else { None },
            fence,
            deleting_buffers,
            realloc_happened: need_realloc,
        })
    }

    /// Get a buffer to write into. `extra_data` receives the extra data
    /// currently attached to the buffer.
    pub fn request_buffer(
        &self,
        config: &BufferRequestConfig,
        extra_data: &mut BufferExtraData,
    ) -> Result<RequestBufferReturn> {
        if self.listener.lock().unwrap().is_none() {
            debug!("No consumer listening to {}", self.name);
            return Err(SurfaceError::NoConsumer);
        }
        Self::check_request_config(config)?;

        let mut state = self.lock();
        if !state.status {
            return Err(SurfaceError::NoConsumer);
        }

        if let Some(sequence) = state.pop_from_free_list(self.is_shared, config) {
            return self.reuse_buffer(&mut state, sequence, config, extra_data);
        }

        if state.used_size() >= state.queue_size {
            let timeout = Duration::from_millis(config.timeout.max(0) as u64);
            state = self
                .request_cond
                .wait_timeout_while(state, timeout, |s| {
                    s.status && s.free_list.is_empty() && s.used_size() >= s.queue_size
                })
                .unwrap()
                .0;

            if !state.status {
                return Err(SurfaceError::NoConsumer);
            }
            if let Some(sequence) = state.pop_from_free_list(self.is_shared, config) {
                return self.reuse_buffer(&mut state, sequence, config, extra_data);
            }
            if state.used_size() >= state.queue_size {
                debug!("All buffers of {} are in use", self.name);
                return Err(SurfaceError::NoBuffer);
            }
        }

        let buffer = self.alloc_buffer(&mut state, config)?;
        *extra_data = buffer.extra_data();
        debug!(
            "Allocated buffer {} [{}] for {}",
            buffer.seq_num(),
            config,
            self.name
        );

        Ok(RequestBufferReturn {
            sequence: buffer.seq_num(),
            buffer: Some(buffer),
            fence: Arc::new(Fence::invalid()),
            deleting_buffers: Vec::new(),
            realloc_happened: false,
        })
    }

    /// Give back a requested buffer without flushing it.
    pub fn cancel_buffer(&self, sequence: u32, extra_data: BufferExtraData) -> Result<()> {
        if self.is_shared {
            return Err(SurfaceError::InvalidOperating);
        }

        let mut state = self.lock();
        let slot = state.slot_mut(sequence)?;
        if slot.state() != SlotState::Requested {
            debug!("Cannot cancel buffer {} in state {}", sequence, slot.state());
            return Err(SurfaceError::InvalidOperating);
        }
        slot.update_state(SlotState::Released);
        slot.buffer.set_extra_data(extra_data);
        if slot.is_deleting {
            state.delete_buffer_in_cache(sequence);
            debug!("Deleted buffer {} of {} on cancel", sequence, self.name);
        } else {
            state.free_list.push_back(sequence);
        }
        drop(state);

        self.request_cond.notify_all();

        Ok(())
    }

    fn do_flush_buffer(
        &self,
        sequence: u32,
        extra_data: BufferExtraData,
        fence: Arc<Fence>,
        config: &BufferFlushConfig,
    ) -> Result<()> {
        let mut state = self.lock();
        // The buffer may have been cancelled since `flush_buffer` checked it.
        let slot = state.slot(sequence)?;
        if !self.is_shared
            && !matches!(slot.state(), SlotState::Requested | SlotState::Attached)
        {
            debug!("Cannot flush buffer {} in state {}", sequence, slot.state());
            return Err(SurfaceError::NoEntry);
        }
        if slot.is_deleting {
            state.delete_buffer_in_cache(sequence);
            drop(state);
            self.request_cond.notify_all();
            debug!("Deleted buffer {} of {} on flush", sequence, self.name);
            return Ok(());
        }

        let slot = state.slot_mut(sequence)?;
        if slot.config.usage.contains(BufferUsage::CPU_WRITE) {
            self.allocator.flush_cache(slot.buffer.handle())?;
        }
        slot.update_state(SlotState::Flushed);
        slot.buffer.set_extra_data(extra_data);
        slot.fence = fence;
        slot.damage = config.damage;
        slot.timestamp = match config.timestamp {
            0 => now_us(),
            timestamp => timestamp,
        };

        if self.is_shared {
            state.free_list.retain(|&seq| seq != sequence);
        }
        if !state.dirty_list.contains(&sequence) {
            state.dirty_list.push_back(sequence);
        }

        Ok(())
    }

    /// Queue a buffer filled by the producer, and tell the consumer about it.
    /// `fence` signals once the content of the buffer is ready to be read.
    pub fn flush_buffer(
        &self,
        sequence: u32,
        extra_data: BufferExtraData,
        fence: Arc<Fence>,
        config: &BufferFlushConfig,
    ) -> Result<()> {
        {
            let state = self.lock();
            if !state.status {
                return Err(SurfaceError::NoConsumer);
            }
            if config.damage.w < 0 || config.damage.h < 0 {
                warn!("Invalid damage {} for buffer {}", config.damage, sequence);
                return Err(SurfaceError::InvalidArguments);
            }
            let slot = state.slot(sequence)?;
            if !self.is_shared
                && !matches!(slot.state(), SlotState::Requested | SlotState::Attached)
            {
                debug!("Cannot flush buffer {} in state {}", sequence, slot.state());
                return Err(SurfaceError::NoEntry);
            }
        }

        if self.listener.lock().unwrap().is_none() {
            debug!("No consumer for {}, cancelling buffer {}", self.name, sequence);
            if let Err(e) = self.cancel_buffer(sequence, extra_data) {
                debug!("Failed to cancel buffer {}: {}", sequence, e);
            }
            return Err(SurfaceError::NoConsumer);
        }

        self.do_flush_buffer(sequence, extra_data, fence, config)?;

        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener.on_buffer_available();
        }

        Ok(())
    }

    /// Take the oldest flushed buffer for reading.
    pub fn acquire_buffer(&self) -> Result<AcquiredBuffer> {
        let mut state = self.lock();
        let sequence = if self.is_shared {
            let sequence = state.slots.keys().next().copied();
            state.dirty_list.clear();
            sequence
        } else {
            state.dirty_list.pop_front()
        }
        .ok_or(SurfaceError::NoBuffer)?;

        let slot = state.slot_mut(sequence)?;
        if slot.state() != SlotState::Flushed {
            warn!("Acquiring buffer {} in state {}", sequence, slot.state());
        }
        slot.update_state(SlotState::Acquired);

        Ok(AcquiredBuffer {
            buffer: Arc::clone(&slot.buffer),
            fence: Arc::clone(&slot.fence),
            timestamp: slot.timestamp,
            damage: slot.damage,
        })
    }

    /// Give an acquired buffer back to the producer. `fence` signals once the
    /// consumer is done reading the buffer.
    pub fn release_buffer(&self, sequence: u32, fence: Arc<Fence>) -> Result<()> {
        let buffer = {
            let state = self.lock();
            let slot = state.slot(sequence)?;
            if !self.is_shared
                && !matches!(slot.state(), SlotState::Acquired | SlotState::Attached)
            {
                debug!("Cannot release buffer {} in state {}", sequence, slot.state());
                return Err(SurfaceError::NoEntry);
            }
            Arc::clone(&slot.buffer)
        };

        if let Some(on_release) = self.release_listener.lock().unwrap().as_ref() {
            match on_release(&buffer) {
                Ok(()) => {
                    debug!("Buffer {} taken over by the release listener", sequence);
                    return Ok(());
                }
                Err(e) => debug!("Release listener declined buffer {}: {}", sequence, e),
            }
        }

        let mut state = self.lock();
        let slot = state.slot_mut(sequence)?;
        // Another release may have come first.
        if !self.is_shared
            && !matches!(slot.state(), SlotState::Acquired | SlotState::Attached)
        {
            debug!("Cannot release buffer {} in state {}", sequence, slot.state());
            return Err(SurfaceError::NoEntry);
        }
        slot.update_state(SlotState::Released);
        slot.fence = fence;
        if slot.is_deleting {
            state.delete_buffer_in_cache(sequence);
            debug!("Deleted buffer {} of {} on release", sequence, self.name);
        } else {
            if self.is_shared {
                state.dirty_list.retain(|&seq| seq != sequence);
            }
            if !state.free_list.contains(&sequence) {
                state.free_list.push_back(sequence);
            }
        }
        drop(state);

        self.request_cond.notify_all();

        Ok(())
    }

    /// Add a buffer allocated outside of the queue. If the queue is full,
    /// free or flushed buffers are deleted to make room for it.
    pub fn attach_buffer(&self, buffer: Arc<SurfaceBuffer>) -> Result<()> {
        if self.is_shared {
            return Err(SurfaceError::InvalidOperating);
        }

        let mut state = self.lock();
        let sequence = buffer.seq_num();
        if state.slots.contains_key(&sequence) {
            warn!("Buffer {} is already part of {}", sequence, self.name);
            return Err(SurfaceError::InvalidArguments);
        }

        let config = buffer.request_config();
        let damage = Rect::new(0, 0, config.width, config.height);
        let mut slot = BufferSlot::new(buffer, SlotState::Attached, config);
        slot.damage = damage;

        let used = state.used_size();
        if used >= state.queue_size {
            let needed = used - state.queue_size + 1;
            let evictable = (state.free_list.len() + state.dirty_list.len()) as u32;
            if evictable < needed {
                debug!("No room in {} to attach buffer {}", self.name, sequence);
                return Err(SurfaceError::OutOfRange);
            }
            state.delete_buffers(needed);
        }
        state.slots.insert(sequence, slot);

        Ok(())
    }

    /// Remove a requested or acquired buffer from the queue for good.
    pub fn detach_buffer(&self, sequence: u32) -> Result<()> {
        if self.is_shared {
            return Err(SurfaceError::InvalidOperating);
        }

        let mut state = self.lock();
        let slot_state = state.slot(sequence)?.state();
        if !matches!(slot_state, SlotState::Requested | SlotState::Acquired) {
            debug!("Cannot detach buffer {} in state {}", sequence, slot_state);
            return Err(SurfaceError::NoEntry);
        }
        state.notify_delete(sequence);
        state.slots.remove(&sequence);

        Ok(())
    }

    pub fn get_queue_size(&self) -> u32 {
        self.lock().queue_size
    }

    /// Change the maximum number of buffers of the queue. When shrinking, as
    /// many buffers as the size decreased by are deleted, right away if they
    /// are not in use, or as soon as they come back otherwise.
    pub fn set_queue_size(&self, queue_size: u32) -> Result<()> {
        if self.is_shared && queue_size != 1 {
            warn!("A shared queue can only hold one buffer");
            return Err(SurfaceError::InvalidArguments);
        }
        if queue_size == 0 || queue_size > MAX_QUEUE_SIZE {
            warn!(
                "Queue size must be within [1, {}], got {}",
                MAX_QUEUE_SIZE, queue_size
            );
            return Err(SurfaceError::InvalidArguments);
        }

        let mut state = self.lock();
        let old_size = std::mem::replace(&mut state.queue_size, queue_size);
        if queue_size < old_size {
            state.delete_buffers(old_size - queue_size);
        }
        drop(state);

        if queue_size > old_size {
            self.request_cond.notify_all();
        }
        debug!("Queue size of {} set to {}", self.name, queue_size);

        Ok(())
    }

    /// The producer goes to the background: free every buffer.
    pub fn go_background(&self) -> Result<()> {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener.on_go_background();
        }

        let mut state = self.lock();
        state.clear();
        state.set_producer_cache_clean(false);
        drop(state);

        self.request_cond.notify_all();

        Ok(())
    }

    /// Free every buffer, leaving the queue usable.
    pub fn clean_cache(&self) -> Result<()> {
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener.on_clean_cache();
        }

        self.lock().clear();
        self.request_cond.notify_all();

        Ok(())
    }

    pub fn on_consumer_died(&self) -> Result<()> {
        self.lock().clear();
        self.request_cond.notify_all();

        Ok(())
    }

    /// Mark the queue as alive or dead. Requests blocked on a dead queue
    /// return `NoConsumer`.
    pub fn set_status(&self, status: bool) {
        self.lock().status = status;
        self.request_cond.notify_all();
    }

    pub fn get_status(&self) -> bool {
        self.lock().status
    }

    /// Make every buffer be sent again to the producer, until it has seen all
    /// of them.
    pub fn set_producer_cache_clean_flag(&self, flag: bool) {
        self.lock().set_producer_cache_clean(flag);
    }

    /// Install `listener`, replacing the current one if any.
    pub fn register_consumer_listener(&self, listener: Arc<dyn ConsumerListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    pub fn unregister_consumer_listener(&self) {
        *self.listener.lock().unwrap() = None;
    }

    pub fn register_release_listener(&self, listener: ReleaseListener) {
        *self.release_listener.lock().unwrap() = Some(listener);
    }

    /// Install the delete listener. Only the first registration is taken into
    /// account.
    pub fn register_delete_buffer_listener(&self, listener: DeleteBufferListener) {
        let mut state = self.lock();
        if state.delete_listener.is_none() {
            state.delete_listener = Some(listener);
        }
    }

    pub fn set_default_width_and_height(&self, width: i32, height: i32) -> Result<()> {
        if width <= 0 || height <= 0 {
            warn!("Invalid default size {}x{}", width, height);
            return Err(SurfaceError::InvalidArguments);
        }

        let mut state = self.lock();
        state.default_width = width;
        state.default_height = height;

        Ok(())
    }

    pub fn get_default_width(&self) -> i32 {
        self.lock().default_width
    }

    pub fn get_default_height(&self) -> i32 {
        self.lock().default_height
    }

    pub fn set_default_usage(&self, usage: BufferUsage) {
        self.lock().default_usage = usage;
    }

    pub fn get_default_usage(&self) -> BufferUsage {
        self.lock().default_usage
    }

    pub fn set_transform(&self, transform: Transform) {
        self.lock().transform = transform;
    }

    pub fn get_transform(&self) -> Transform {
        self.lock().transform
    }

    pub fn is_supported_alloc(&self, infos: &[VerifyAllocInfo]) -> Vec<bool> {
        self.allocator.is_supported_alloc(infos)
    }

    pub fn set_scaling_mode(&self, sequence: u32, scaling_mode: ScalingMode) -> Result<()> {
        self.lock().slot_mut(sequence)?.scaling_mode = scaling_mode;
        Ok(())
    }

    pub fn get_scaling_mode(&self, sequence: u32) -> Result<ScalingMode> {
        Ok(self.lock().slot(sequence)?.scaling_mode)
    }

    pub fn set_metadata(&self, sequence: u32, metadata: Vec<HdrMetaData>) -> Result<()> {
        if metadata.is_empty() {
            return Err(SurfaceError::InvalidArguments);
        }

        let mut state = self.lock();
        let slot = state.slot_mut(sequence)?;
        slot.metadata = metadata;
        slot.hdr_type = HdrMetaDataType::MetaData;

        Ok(())
    }

    pub fn set_metadata_set(
        &self,
        sequence: u32,
        key: HdrMetadataKey,
        metadata: Vec<u8>,
    ) -> Result<()> {
        if metadata.is_empty() {
            return Err(SurfaceError::InvalidArguments);
        }

        let mut state = self.lock();
        let slot = state.slot_mut(sequence)?;
        slot.metadata_set_key = key;
        slot.metadata_set = metadata;
        slot.hdr_type = HdrMetaDataType::MetaDataSet;

        Ok(())
    }

    pub fn query_metadata_type(&self, sequence: u32) -> Result<HdrMetaDataType> {
        Ok(self.lock().slot(sequence)?.hdr_type)
    }

    pub fn get_metadata(&self, sequence: u32) -> Result<Vec<HdrMetaData>> {
        Ok(self.lock().slot(sequence)?.metadata.clone())
    }

    pub fn get_metadata_set(&self, sequence: u32) -> Result<(HdrMetadataKey, Vec<u8>)> {
        let state = self.lock();
        let slot = state.slot(sequence)?;
        Ok((slot.metadata_set_key, slot.metadata_set.clone()))
    }

    /// Set or clear the tunnel handle of the queue, and tell the consumer if
    /// it changed.
    pub fn set_tunnel_handle(&self, handle: Option<TunnelHandle>) -> Result<()> {
        {
            let mut state = self.lock();
            match (&state.tunnel_handle, &handle) {
                (None, None) => {
                    warn!("No tunnel handle to clear");
                    return Err(SurfaceError::InvalidArguments);
                }
                (Some(current), Some(new)) if **current == *new => {
                    warn!("Same tunnel handle set twice on {}", self.name);
                    return Err(SurfaceError::NoEntry);
                }
                _ => (),
            }
            state.tunnel_handle = handle.map(Arc::new);
        }

        match self.listener.lock().unwrap().as_ref() {
            Some(listener) => {
                listener.on_tunnel_handle_change();
                Ok(())
            }
            None => Err(SurfaceError::NoConsumer),
        }
    }

    pub fn get_tunnel_handle(&self) -> Option<Arc<TunnelHandle>> {
        self.lock().tunnel_handle.clone()
    }

    pub fn set_present_timestamp(&self, sequence: u32, timestamp: PresentTimestamp) -> Result<()> {
        self.lock().slot_mut(sequence)?.present_timestamp = timestamp;
        Ok(())
    }

    /// Returns the presentation time of a buffer: the delay between flush and
    /// presentation for `Delay`, or the presentation time relative to the
    /// flush timestamp for `Timestamp`.
    pub fn get_present_timestamp(
        &self,
        sequence: u32,
        type_: PresentTimestampType,
    ) -> Result<i64> {
        let state = self.lock();
        let slot = state.slot(sequence)?;
        if slot.present_timestamp.type_ != type_ {
            debug!(
                "Buffer {} has no present timestamp of type {:?}",
                sequence, type_
            );
            return Err(SurfaceError::NoEntry);
        }

        match type_ {
            PresentTimestampType::Delay => Ok(slot.present_timestamp.time),
            PresentTimestampType::Timestamp => Ok(slot.present_timestamp.time - slot.timestamp),
            PresentTimestampType::Unsupported => Err(SurfaceError::TypeError),
        }
    }

    /// Returns a human-readable description of the queue and its buffers.
    pub fn dump(&self) -> String {
        let state = self.lock();
        let total_size: u64 = state.slots.values().map(|s| s.buffer.size()).sum();

        let mut result = String::from("    BufferQueue:\n");
        result.push_str(&format!(
            "      default-size = [{}x{}], FIFO = {}, name = {}, uniqueId = {}, \
             usedBufferListLen = {}, freeBufferListLen = {}, dirtyBufferListLen = {}, \
             totalBuffersMemSize = {:.2}(KiB).\n",
            state.default_width,
            state.default_height,
            state.queue_size,
            self.name,
            self.unique_id,
            state.used_size(),
            state.free_list.len(),
            state.dirty_list.len(),
            total_size as f64 / 1024.0
        ));
        result.push_str("      bufferQueueCache:\n");
        for (sequence, slot) in &state.slots {
            result.push_str(&format!(
                "        sequence = {}, state = {}, timestamp = {}, damageRect = [{}, {}, {}, {}], \
                 config = [{}x{}, {}, {}, {}, {}], bufferWith = {}, bufferHeight = {}, \
                 bufferMemSize = {:.2}(KiB).\n",
                sequence,
                slot.state(),
                slot.timestamp,
                slot.damage.x,
                slot.damage.y,
                slot.damage.w,
                slot.damage.h,
                slot.config.width,
                slot.config.height,
                slot.config.stride_alignment,
                slot.config.format as u32,
                slot.config.usage.bits(),
                slot.config.timeout,
                slot.buffer.width(),
                slot.buffer.height(),
                slot.buffer.size() as f64 / 1024.0
            ));
        }

        result
    }
}
