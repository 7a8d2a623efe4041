//! The Binary Field Class Reader.
//!
//! BFCR decodes one root field class from a sequence of buffers, invoking
//! caller-supplied callbacks for each scalar and compound boundary. It is
//! restartable: when the current buffer runs out mid-field, `start`/
//! `continue_` return `Status::Eof` and the caller supplies a new buffer
//! via `continue_`, resuming exactly where decoding stopped. The suspend
//! points are modeled as an explicit `State` enum and a frame stack, the
//! idiomatic Rust shape for a restartable walk over a tree.

use crate::bitbuffer::BitBuffer;
use crate::error::{DecodeError, Error};
use crate::fieldclass::{ByteOrder, Field, FieldClass, FloatSize};
use crate::stitch::StitchBuffer;
use bytes::Bytes;
use std::ops::ControlFlow;
use tracing::trace;

/// Caller-supplied reactions to BFCR's decode events. All scalar/compound
/// callbacks receive the [`Field`] being
/// decoded so implementors can consult `in_ir` and the field's meaning/
/// mapped-clock-class without BFCR having to know what to do with them.
pub trait Callbacks {
    fn unsigned_int(&mut self, value: u64, field: &Field) -> Result<(), Error>;
    fn signed_int(&mut self, value: i64, field: &Field) -> Result<(), Error>;
    fn float(&mut self, value: f64, field: &Field) -> Result<(), Error>;

    fn string_begin(&mut self, field: &Field) -> Result<(), Error>;
    fn string(&mut self, bytes: &[u8], field: &Field) -> Result<(), Error>;
    fn string_end(&mut self, field: &Field) -> Result<(), Error>;

    fn compound_begin(&mut self, field: &Field) -> Result<(), Error>;
    fn compound_end(&mut self, field: &Field) -> Result<(), Error>;

    /// Asks for a Dynamic Array's element count, as already decoded into
    /// the stored-values table by an earlier producer field.
    fn get_sequence_length(&mut self, field: &Field) -> Result<i64, Error>;

    /// Asks which of a Variant's options is selected, by index, based on
    /// the tag value already decoded into the stored-values table.
    fn borrow_variant_selected_index(&mut self, field: &Field) -> Result<Option<usize>, Error>;
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Status {
    /// Decoding is suspended for lack of input; call `continue_` with more.
    Eof,
    /// The root field class has been fully decoded.
    Done,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum State {
    NextField,
    AlignBasic,
    AlignCompound,
    ReadBasicBegin,
    ReadBasicContinue,
    Done,
}

enum FrameKind<'cls> {
    Root(&'cls Field),
    Struct(&'cls crate::fieldclass::StructFieldClass),
    StaticArray(&'cls crate::fieldclass::StaticArrayFieldClass),
    DynamicArray { class: &'cls crate::fieldclass::DynamicArrayFieldClass, length: u64 },
    Variant { class: &'cls crate::fieldclass::VariantFieldClass, selected: usize },
}

struct Frame<'cls> {
    kind: FrameKind<'cls>,
    child_index: usize,
    /// The `Field` whose `compound_begin` was fired when this frame was
    /// pushed; re-used to fire the matching `compound_end` on pop.
    field: &'cls Field,
}

impl<'cls> Frame<'cls> {
    fn child(&self) -> Option<&'cls Field> {
        match &self.kind {
            FrameKind::Root(f) => (self.child_index == 0).then_some(*f),
            FrameKind::Struct(s) => s.members.get(self.child_index).map(|m| &m.field),
            FrameKind::StaticArray(a) => {
                (self.child_index < a.length as usize).then(|| &*a.element)
            }
            FrameKind::DynamicArray { class, length } => {
                (self.child_index < *length as usize).then(|| &*class.element)
            }
            FrameKind::Variant { class, selected } => {
                (self.child_index == 0).then(|| &class.options[*selected].field)
            }
        }
    }

    fn alignment(&self) -> u64 {
        match &self.kind {
            FrameKind::Root(f) => f.class.alignment(),
            FrameKind::Struct(s) => s.alignment,
            FrameKind::StaticArray(a) => a.element.class.alignment(),
            FrameKind::DynamicArray { class, .. } => class.element.class.alignment(),
            FrameKind::Variant { class, selected } => class.options[*selected].field.class.alignment(),
        }
    }
}

/// Whether a field is "text": a String field class, or a Static/Dynamic
/// Array whose `is_text` flag is set. A text array/sequence temporarily
/// rebinds the unsigned int callback to an in-place string-appending
/// callback.
fn is_text_field(class: &FieldClass) -> bool {
    matches!(class, FieldClass::String(_))
        || matches!(class, FieldClass::StaticArray(a) if a.is_text)
        || matches!(class, FieldClass::DynamicArray(a) if a.is_text)
}

/// Decoder state for a basic (non-text) scalar field mid-read.
struct BasicRead<'cls> {
    field: &'cls Field,
    byte_order: ByteOrder,
    width_bits: u8,
}

/// Decoder state for a text run (String, or a text array/sequence) mid-read.
struct TextRead<'cls> {
    field: &'cls Field,
    /// Remaining element budget for a fixed-length text array/sequence;
    /// `None` for a null-terminated String, which has no length cap.
    remaining: Option<u64>,
    begun: bool,
    /// Set once a `0x00` byte has been seen. For a fixed-length text
    /// array/sequence, bytes after this point are still consumed (to keep
    /// the bit cursor aligned with the declared length) but never appended
    /// to the exposed string.
    null_found: bool,
}

pub struct Bfcr<'cls> {
    state: State,
    stack: Vec<Frame<'cls>>,
    bit_buffer: BitBuffer,
    stitch: StitchBuffer,
    pending_basic: Option<BasicRead<'cls>>,
    pending_text: Option<TextRead<'cls>>,
    pending_alignment: u64,
    last_byte_order: Option<ByteOrder>,
    start_bit_mark: u64,
}

impl<'cls> Bfcr<'cls> {
    pub fn new() -> Self {
        Self {
            state: State::Done,
            stack: Vec::new(),
            bit_buffer: BitBuffer::default(),
            stitch: StitchBuffer::default(),
            pending_basic: None,
            pending_text: None,
            pending_alignment: 0,
            last_byte_order: None,
            start_bit_mark: 0,
        }
    }

    /// Resets decode state and begins walking `root` from `buf`.
    pub fn start<C: Callbacks>(
        &mut self,
        root: &'cls Field,
        buf: Bytes,
        offset_bits: u64,
        packet_offset_bits: u64,
        callbacks: &mut C,
    ) -> Result<(u64, Status), Error> {
        self.bit_buffer = BitBuffer::new(buf, offset_bits, packet_offset_bits);
        self.stack.clear();
        self.stack.push(Frame { kind: FrameKind::Root(root), child_index: 0, field: root });
        self.state = State::NextField;
        self.pending_basic = None;
        self.pending_text = None;
        self.last_byte_order = None;
        self.start_bit_mark = self.global_bit_pos();
        self.run(callbacks)
    }

    /// Resumes a suspended decode with more bytes.
    pub fn continue_<C: Callbacks>(&mut self, buf: Bytes, callbacks: &mut C) -> Result<(u64, Status), Error> {
        self.bit_buffer.refill(buf);
        self.start_bit_mark = self.global_bit_pos();
        self.run(callbacks)
    }

    /// Advances the child cursor of the frame that owns the leaf field
    /// (basic scalar or text run) just finished. Compound children instead
    /// advance their parent's cursor when the compound's own frame is
    /// popped in [`advance_to_next_field`].
    fn advance_parent_child_index(&mut self) {
        if let Some(top) = self.stack.last_mut() {
            top.child_index += 1;
        }
    }

    fn global_bit_pos(&self) -> u64 {
        self.bit_buffer.packet_offset_bits() + self.bit_buffer.cursor_bits()
    }

    fn run<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<(u64, Status), Error> {
        let consumed_base = self.start_bit_mark;
        loop {
            match self.state {
                State::Done => return Ok((self.global_bit_pos() - consumed_base, Status::Done)),
                State::NextField => match self.advance_to_next_field(callbacks)? {
                    ControlFlow::Continue(()) => {}
                    ControlFlow::Break(()) => {
                        return Ok((self.global_bit_pos() - consumed_base, Status::Eof))
                    }
                },
                State::AlignBasic | State::AlignCompound => {
                    if !self.skip_to_alignment() {
                        return Ok((self.global_bit_pos() - consumed_base, Status::Eof));
                    }
                    if self.state == State::AlignBasic {
                        self.state = State::ReadBasicBegin;
                    } else if self.pending_text.is_some() {
                        // This alignment preceded a text run (String, or a
                        // text array/sequence), not a pushed compound frame
                        // — drive the text read now instead of treating the
                        // alignment as having unblocked `NextField`.
                        match self.drive_text_read(callbacks)? {
                            ControlFlow::Continue(()) => {}
                            ControlFlow::Break(()) => {
                                return Ok((self.global_bit_pos() - consumed_base, Status::Eof))
                            }
                        }
                    } else {
                        self.state = State::NextField;
                    }
                }
                State::ReadBasicBegin => match self.read_basic_begin(callbacks)? {
                    ControlFlow::Continue(()) => {}
                    ControlFlow::Break(()) => {
                        return Ok((self.global_bit_pos() - consumed_base, Status::Eof))
                    }
                },
                State::ReadBasicContinue => {
                    let outcome = if self.pending_text.is_some() {
                        self.drive_text_read(callbacks)?
                    } else {
                        self.read_basic_continue(callbacks)?
                    };
                    match outcome {
                        ControlFlow::Continue(()) => {}
                        ControlFlow::Break(()) => {
                            return Ok((self.global_bit_pos() - consumed_base, Status::Eof))
                        }
                    }
                }
            }
        }
    }

    /// Pops finished frames, selects the next child of the (new) top
    /// frame, and dispatches to text, basic, or compound handling.
    fn advance_to_next_field<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<ControlFlow<()>, Error> {
        loop {
            let Some(top) = self.stack.last() else {
                self.state = State::Done;
                return Ok(ControlFlow::Continue(()));
            };
            let Some(child) = top.child() else {
                let finished = self.stack.pop().unwrap();
                // The synthetic root frame was never paired with a
                // `compound_begin` (it exists only to give the walk a
                // single starting child), so it gets no `compound_end`.
                if !matches!(finished.kind, FrameKind::Root(_)) {
                    callbacks.compound_end(finished.field)?;
                }
                if let Some(parent) = self.stack.last_mut() {
                    parent.child_index += 1;
                }
                continue;
            };

            if is_text_field(&child.class) {
                trace!(?child.class, "bfcr: begin text field");
                let remaining = match &child.class {
                    FieldClass::StaticArray(a) => Some(a.length),
                    FieldClass::DynamicArray(a) => {
                        let len = callbacks.get_sequence_length(child)?;
                        if len < 0 {
                            return Err(DecodeError::NegativeSequenceLength.into());
                        }
                        Some(len as u64)
                    }
                    _ => None,
                };
                self.pending_text = Some(TextRead { field: child, remaining, begun: false, null_found: false });
                self.pending_alignment = 8;
                self.state = State::AlignCompound;
                return Ok(ControlFlow::Continue(()));
            }

            if child.class.is_compound() {
                trace!(?child.class, "bfcr: enter compound field");
                callbacks.compound_begin(child)?;
                let frame = match &child.class {
                    FieldClass::Struct(s) => Frame { kind: FrameKind::Struct(s), child_index: 0, field: child },
                    FieldClass::StaticArray(a) => {
                        Frame { kind: FrameKind::StaticArray(a), child_index: 0, field: child }
                    }
                    FieldClass::DynamicArray(a) => {
                        let len = callbacks.get_sequence_length(child)?;
                        if len < 0 {
                            return Err(DecodeError::NegativeSequenceLength.into());
                        }
                        Frame {
                            kind: FrameKind::DynamicArray { class: a, length: len as u64 },
                            child_index: 0,
                            field: child,
                        }
                    }
                    FieldClass::Variant(v) => {
                        let selected = callbacks
                            .borrow_variant_selected_index(child)?
                            .ok_or(DecodeError::VariantTagNoMatch)?;
                        Frame { kind: FrameKind::Variant { class: v, selected }, child_index: 0, field: child }
                    }
                    _ => unreachable!("is_compound() only true for the variants matched above"),
                };
                self.pending_alignment = frame.alignment();
                self.stack.push(frame);
                self.state = State::AlignCompound;
                return Ok(ControlFlow::Continue(()));
            }

            // Basic scalar field (Int, Enum, Float).
            let (byte_order, width_bits) = basic_wire_shape(&child.class)?;
            self.pending_basic = Some(BasicRead { field: child, byte_order, width_bits });
            self.pending_alignment = child.class.alignment();
            self.state = State::AlignBasic;
            return Ok(ControlFlow::Continue(()));
        }
    }

    /// Skips ahead to `self.pending_alignment`. Re-entrant: if the current
    /// buffer runs dry mid-pad, the unconsumed alignment is implicit in
    /// `global_bit_pos()` itself, so the next call just recomputes the same
    /// `pad` from the (now further along) position and keeps skipping.
    fn skip_to_alignment(&mut self) -> bool {
        let pos = self.global_bit_pos();
        let align = self.pending_alignment.max(1);
        let pad = (align - (pos % align)) % align;
        let avail = self.bit_buffer.remaining_bits();
        if pad <= avail {
            self.bit_buffer.advance(pad);
            true
        } else {
            self.bit_buffer.advance(avail);
            false
        }
    }

    fn read_basic_begin<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<ControlFlow<()>, Error> {
        let basic = self.pending_basic.as_ref().expect("ReadBasicBegin without a pending basic field");
        let pos = self.global_bit_pos();
        if pos % 8 != 0 {
            if let Some(prev) = self.last_byte_order {
                if prev != basic.byte_order {
                    return Err(DecodeError::ByteOrderContinuity {
                        bit_offset: pos,
                        previous: prev,
                        new: basic.byte_order,
                    }
                    .into());
                }
            }
        }

        if (basic.width_bits as u64) <= self.bit_buffer.remaining_bits() {
            let value = self.bit_buffer.read_bits(basic.width_bits, basic.byte_order);
            self.last_byte_order = Some(basic.byte_order);
            self.fire_scalar(value, callbacks)?;
            self.advance_parent_child_index();
            self.state = State::NextField;
            Ok(ControlFlow::Continue(()))
        } else {
            let offset_bits = pos % 8;
            self.stitch.begin(offset_bits, basic.width_bits as u64);
            let avail = self.bit_buffer.remaining_bits();
            let mut tmp = [0u8; 16];
            let copied = self.bit_buffer.copy_bits_into(&mut tmp, offset_bits, avail);
            self.stitch.append_from(&tmp, offset_bits, copied);
            self.state = State::ReadBasicContinue;
            Ok(ControlFlow::Break(()))
        }
    }

    fn read_basic_continue<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<ControlFlow<()>, Error> {
        let basic = self.pending_basic.as_ref().expect("ReadBasicContinue without a pending basic field");
        let want = self.stitch.bits_remaining();
        let avail = self.bit_buffer.remaining_bits().min(want);
        if avail > 0 {
            let mut tmp = [0u8; 16];
            let copied = self.bit_buffer.copy_bits_into(&mut tmp, 0, avail);
            self.stitch.append_from(&tmp, 0, copied);
        }
        if self.stitch.is_complete() {
            let value = self.stitch.decode(basic.byte_order);
            self.last_byte_order = Some(basic.byte_order);
            self.fire_scalar(value, callbacks)?;
            self.advance_parent_child_index();
            self.state = State::NextField;
            Ok(ControlFlow::Continue(()))
        } else {
            Ok(ControlFlow::Break(()))
        }
    }

    fn fire_scalar<C: Callbacks>(&mut self, raw: u64, callbacks: &mut C) -> Result<(), Error> {
        let field = self.pending_basic.take().unwrap().field;
        match &field.class {
            FieldClass::Int(c) if c.signed => {
                callbacks.signed_int(sign_extend(raw, c.size), field)
            }
            FieldClass::Int(_) => callbacks.unsigned_int(raw, field),
            FieldClass::Enum(c) if c.underlying.signed => {
                callbacks.signed_int(sign_extend(raw, c.underlying.size), field)
            }
            FieldClass::Enum(_) => callbacks.unsigned_int(raw, field),
            FieldClass::Float(c) => {
                let value = match c.size {
                    FloatSize::Bits32 => f32::from_bits(raw as u32) as f64,
                    FloatSize::Bits64 => f64::from_bits(raw),
                };
                callbacks.float(value, field)
            }
            _ => unreachable!("fire_scalar only called for basic Int/Enum/Float fields"),
        }
    }

    fn drive_text_read<C: Callbacks>(&mut self, callbacks: &mut C) -> Result<ControlFlow<()>, Error> {
        let text = self.pending_text.as_mut().expect("text read driven without pending state");
        if !text.begun {
            text.begun = true;
            let field = text.field;
            callbacks.string_begin(field)?;
        }

        debug_assert_eq!(self.bit_buffer.cursor_bits() % 8, 0);
        let mut chunk = Vec::new();
        let mut terminated = false;
        loop {
            let text = self.pending_text.as_mut().unwrap();
            if text.remaining == Some(0) {
                terminated = true;
                break;
            }
            // An unbounded string is done as soon as its null is seen; a
            // declared-length array/sequence still has bytes left to
            // consume (caught by the `remaining == Some(0)` check above on
            // the next iteration) even after its null has been found.
            if text.remaining.is_none() && text.null_found {
                terminated = true;
                break;
            }
            if self.bit_buffer.is_exhausted() {
                break;
            }
            let byte = self.bit_buffer.read_bits(8, ByteOrder::LittleEndian) as u8;
            if let Some(r) = text.remaining.as_mut() {
                *r -= 1;
            }
            if byte == 0 {
                text.null_found = true;
            } else if !text.null_found {
                chunk.push(byte);
            }
        }

        let text = self.pending_text.as_ref().unwrap();
        if !chunk.is_empty() {
            callbacks.string(&chunk, text.field)?;
        }

        if terminated {
            let text = self.pending_text.take().unwrap();
            callbacks.string_end(text.field)?;
            self.last_byte_order = None;
            self.advance_parent_child_index();
            self.state = State::NextField;
            return Ok(ControlFlow::Continue(()));
        }

        // Ran out of buffer mid-string; suspend and resume the same read
        // once `continue_` supplies more bytes.
        self.state = State::ReadBasicContinue;
        Ok(ControlFlow::Break(()))
    }
}

impl<'cls> Default for Bfcr<'cls> {
    fn default() -> Self {
        Self::new()
    }
}

fn sign_extend(raw: u64, width: u8) -> i64 {
    if width >= 64 {
        return raw as i64;
    }
    let shift = 64 - width as u32;
    ((raw << shift) as i64) >> shift
}

fn basic_wire_shape(class: &FieldClass) -> Result<(ByteOrder, u8), Error> {
    match class {
        FieldClass::Int(c) => Ok((c.byte_order, c.size)),
        FieldClass::Enum(c) => Ok((c.underlying.byte_order, c.underlying.size)),
        FieldClass::Float(c) => {
            let width = match c.size {
                FloatSize::Bits32 => 32,
                FloatSize::Bits64 => 64,
            };
            Ok((c.byte_order, width))
        }
        _ => Err(DecodeError::InvariantViolated("basic_wire_shape called on a non-basic field").into()),
    }
}
