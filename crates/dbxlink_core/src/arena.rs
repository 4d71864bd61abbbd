//! Per-request scratch buffers.
//!
//! A [`RequestContext`] stages one operation: its arguments are written as
//! complete wire blocks into an input buffer (after a reserved envelope
//! prefix), and the engine's reply lands in an output buffer. Arguments are
//! addressed by [`ArgSlot`] offsets, so growing the buffer never invalidates
//! an argument that was already staged.
//!
//! Each connection owns an [`Arena`] holding one idle context that callers
//! reuse when nobody else has it checked out.

use crate::engine::Reply;
use crate::error::{CoreError, CoreResult};
use dbxlink_codec::{
    encode_block, push_end_of_data, Arg, ArgView, Command, DataType, Envelope, Sort,
    ENVELOPE_LEN, HEADER_LEN,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Initial capacity of a freshly allocated context buffer.
pub const DEFAULT_ARENA_CAPACITY: usize = 8 * 1024;

/// Idle contexts larger than this are shrunk before being parked.
const MAX_IDLE_CAPACITY: usize = 1024 * 1024;

/// Location of one staged argument inside the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSlot {
    /// Offset of the payload (just past the block header).
    pub offset: usize,
    /// Payload length.
    pub len: usize,
    /// Block sort.
    pub sort: Sort,
    /// Payload type.
    pub ty: DataType,
}

/// Scratch state for one in-flight operation.
#[derive(Debug)]
pub struct RequestContext {
    input: Vec<u8>,
    output: Vec<u8>,
    reply_type: DataType,
    slots: Vec<ArgSlot>,
    command: Option<Command>,
    wide: bool,
    pooled: bool,
    growths: u32,
}

impl RequestContext {
    /// Allocates a context whose buffers start at `capacity` bytes.
    pub fn with_capacity(capacity: usize, wide: bool) -> CoreResult<Self> {
        let capacity = capacity.max(ENVELOPE_LEN);
        let mut input = Vec::new();
        input
            .try_reserve_exact(capacity)
            .map_err(|_| CoreError::OutOfMemory { requested: capacity })?;
        input.resize(ENVELOPE_LEN, 0);
        let mut output = Vec::new();
        output
            .try_reserve_exact(capacity)
            .map_err(|_| CoreError::OutOfMemory { requested: capacity })?;

        Ok(Self {
            input,
            output,
            reply_type: DataType::None,
            slots: Vec::new(),
            command: None,
            wide,
            pooled: false,
            growths: 0,
        })
    }

    /// An unallocated stand-in, used while the real context is lent out.
    pub(crate) fn placeholder() -> Self {
        Self {
            input: Vec::new(),
            output: Vec::new(),
            reply_type: DataType::None,
            slots: Vec::new(),
            command: None,
            wide: false,
            pooled: false,
            growths: 0,
        }
    }

    fn reset(&mut self, wide: bool) {
        self.input.clear();
        self.input.resize(ENVELOPE_LEN, 0);
        self.output.clear();
        self.reply_type = DataType::None;
        self.slots.clear();
        self.command = None;
        self.wide = wide;
        self.growths = 0;
    }

    /// Whether strings are staged as UTF-16.
    pub fn wide(&self) -> bool {
        self.wide
    }

    /// The command this context is staged for.
    pub fn command(&self) -> Option<Command> {
        self.command
    }

    /// Records the command this context is staged for.
    pub fn set_command(&mut self, command: Command) {
        self.command = Some(command);
    }

    /// Copies one encoded argument into the input buffer as a block.
    ///
    /// `arg_index` must be the next free slot. Returns the number of bytes
    /// written, header included.
    pub fn append(
        &mut self,
        arg_index: usize,
        sort: Sort,
        ty: DataType,
        bytes: &[u8],
    ) -> CoreResult<usize> {
        if arg_index != self.slots.len() {
            return Err(CoreError::invalid_argument(format!(
                "argument {arg_index} staged out of order, next slot is {}",
                self.slots.len()
            )));
        }
        ensure_spare(&mut self.input, HEADER_LEN + bytes.len(), &mut self.growths)?;
        let offset = self.input.len();
        let written = encode_block(&mut self.input, offset, bytes, sort, ty)?;
        self.slots.push(ArgSlot {
            offset: offset + HEADER_LEN,
            len: bytes.len(),
            sort,
            ty,
        });
        Ok(written)
    }

    /// Encodes `arg` for this context's character width and stages it.
    pub fn push_arg(&mut self, sort: Sort, arg: &Arg) -> CoreResult<usize> {
        let (ty, bytes) = arg.encode(self.wide);
        self.append(self.slots.len(), sort, ty, &bytes)
    }

    /// Number of staged arguments.
    pub fn arg_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot descriptor of argument `index`.
    pub fn slot(&self, index: usize) -> Option<ArgSlot> {
        self.slots.get(index).copied()
    }

    /// View of argument `index`.
    pub fn arg(&self, index: usize) -> Option<ArgView<'_>> {
        self.slots.get(index).map(|slot| self.view(slot))
    }

    /// Views of every staged argument, in order.
    pub fn args(&self) -> Vec<ArgView<'_>> {
        self.slots.iter().map(|slot| self.view(slot)).collect()
    }

    fn view(&self, slot: &ArgSlot) -> ArgView<'_> {
        ArgView::new(
            slot.sort,
            slot.ty,
            &self.input[slot.offset..slot.offset + slot.len],
        )
    }

    /// Current input buffer capacity.
    pub fn input_capacity(&self) -> usize {
        self.input.capacity()
    }

    /// Number of times either buffer was reallocated during this request.
    pub fn growths(&self) -> u32 {
        self.growths
    }

    /// Terminates the argument stream and fills in the envelope.
    ///
    /// Returns the complete request message.
    pub fn finish_request(&mut self, command: Command) -> CoreResult<&[u8]> {
        ensure_spare(&mut self.input, HEADER_LEN, &mut self.growths)?;
        push_end_of_data(&mut self.input);
        let body_len = self.input.len() - HEADER_LEN;
        let len = u32::try_from(body_len)
            .map_err(|_| CoreError::invalid_argument(format!("request of {body_len} bytes")))?;
        Envelope {
            len,
            command,
            wide: self.wide,
        }
        .write_to(&mut self.input[..ENVELOPE_LEN]);
        self.command = Some(command);
        Ok(&self.input)
    }

    /// Sizes the output buffer to exactly `len` bytes, growing it if the
    /// current capacity is too small, and returns it for filling.
    pub fn prepare_output(&mut self, len: usize) -> CoreResult<&mut [u8]> {
        self.output.clear();
        ensure_spare(&mut self.output, len, &mut self.growths)?;
        self.output.resize(len, 0);
        Ok(&mut self.output[..])
    }

    /// Copies an engine reply into the output buffer.
    pub fn set_reply(&mut self, reply: &Reply) -> CoreResult<()> {
        self.prepare_output(reply.data.len())?
            .copy_from_slice(&reply.data);
        self.reply_type = reply.ty;
        Ok(())
    }

    /// Records the type of the payload in the output buffer.
    pub fn set_reply_type(&mut self, ty: DataType) {
        self.reply_type = ty;
    }

    /// Type of the payload in the output buffer.
    pub fn reply_type(&self) -> DataType {
        self.reply_type
    }

    /// The reply payload.
    pub fn output(&self) -> &[u8] {
        &self.output
    }
}

fn ensure_spare(buf: &mut Vec<u8>, needed: usize, growths: &mut u32) -> CoreResult<()> {
    let spare = buf.capacity() - buf.len();
    if spare >= needed {
        return Ok(());
    }
    let target = (buf.capacity() * 2).max(buf.len() + needed);
    buf.try_reserve_exact(target - buf.len())
        .map_err(|_| CoreError::OutOfMemory { requested: target })?;
    *growths += 1;
    trace!(from = spare, to = buf.capacity(), "grew request buffer");
    Ok(())
}

/// Counters describing arena usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Acquisitions served by the idle context.
    pub reused: u64,
    /// Acquisitions that allocated a fresh context.
    pub allocated: u64,
    /// Buffer growth events over all released contexts.
    pub grown: u64,
}

/// Per-connection source of request contexts.
#[derive(Debug)]
pub struct Arena {
    idle: Mutex<Option<RequestContext>>,
    capacity: usize,
    reused: AtomicU64,
    allocated: AtomicU64,
    grown: AtomicU64,
}

impl Arena {
    /// Creates an arena whose contexts start at `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(None),
            capacity,
            reused: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            grown: AtomicU64::new(0),
        }
    }

    /// Hands out a context ready for a new request.
    ///
    /// With `reuse_singleton`, the idle context is returned if no other
    /// caller holds it; otherwise a fresh zeroed context is allocated.
    pub fn acquire(&self, wide: bool, reuse_singleton: bool) -> CoreResult<RequestContext> {
        if reuse_singleton {
            if let Some(mut ctx) = self.idle.lock().take() {
                ctx.reset(wide);
                self.reused.fetch_add(1, Ordering::Relaxed);
                return Ok(ctx);
            }
        }
        let mut ctx = RequestContext::with_capacity(self.capacity, wide)?;
        ctx.pooled = reuse_singleton;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(ctx)
    }

    /// Returns a context. Pooled contexts are parked as the idle singleton
    /// if the slot is free; everything else is dropped.
    pub fn release(&self, mut ctx: RequestContext) {
        self.grown
            .fetch_add(u64::from(ctx.growths), Ordering::Relaxed);
        if !ctx.pooled {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.is_none() {
            if ctx.input.capacity() > MAX_IDLE_CAPACITY || ctx.output.capacity() > MAX_IDLE_CAPACITY
            {
                ctx.input = Vec::with_capacity(self.capacity);
                ctx.output = Vec::with_capacity(self.capacity);
            }
            ctx.reset(false);
            *idle = Some(ctx);
        }
    }

    /// Snapshot of usage counters.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            reused: self.reused.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            grown: self.grown.load(Ordering::Relaxed),
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_CAPACITY)
    }
}
