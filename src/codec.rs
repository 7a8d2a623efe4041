//! An async adapter over [`MessageIterator`]: a `tokio_util::codec::Decoder`
//! that hands `Message`s out of whatever bytes a `FramedRead` accumulates,
//! layered outside the synchronous iterator the way a codec wraps a parser.
//!
//! [`Medium::request_bytes`]'s `Eof` means "no more bytes, now or ever"
//! (`medium.rs`) — there's no third "not yet, try again later" outcome, and
//! [`MessageIterator::next`] latches `errored` on any `Err`, including one
//! caused by a medium simply running dry mid-field. A decoder fed only a
//! partial prefix of the trace can't safely drive a live `MessageIterator`
//! piecemeal: a chunk boundary landing mid-field would poison it for good.
//!
//! So [`MessageDecoder`] buffers every byte the stream hands over and only
//! drives the iterator once, at `decode_eof`, once the whole trace is known
//! to have arrived — the same "whole buffer known up front" assumption
//! [`SliceMedium`] already makes, just deferred to the end of the stream
//! instead of the start.

use crate::error::Error;
use crate::iterator::{IteratorStatus, MessageIterator, TracerQuirks};
use crate::medium::SliceMedium;
use crate::message::Message;
use crate::traceclass::TraceClass;
use bytes::BytesMut;
use std::collections::VecDeque;
use tokio_util::codec::Decoder;

/// Messages held back between `decode_eof` calls, since a `Decoder` hands
/// out one item per call but a trace unpacks into many.
const BATCH_SIZE: usize = 64;

/// Decodes a fully-received CTF byte stream into its [`Message`]s.
pub struct MessageDecoder<'cls> {
    trace: &'cls TraceClass,
    quirks: TracerQuirks,
    pending: VecDeque<Message>,
    drained: bool,
}

impl<'cls> MessageDecoder<'cls> {
    pub fn new(trace: &'cls TraceClass) -> Self {
        Self::with_quirks(trace, TracerQuirks::default())
    }

    pub fn with_quirks(trace: &'cls TraceClass, quirks: TracerQuirks) -> Self {
        Self { trace, quirks, pending: VecDeque::new(), drained: false }
    }

    fn drain(&mut self, src: &mut BytesMut) -> Result<(), Error> {
        let bytes = src.split().freeze();
        let mut it = MessageIterator::with_quirks(self.trace, SliceMedium::new(bytes), self.quirks);
        loop {
            let (msgs, status) = it.next(BATCH_SIZE)?;
            self.pending.extend(msgs);
            if status == IteratorStatus::End {
                return Ok(());
            }
        }
    }
}

impl<'cls> Decoder for MessageDecoder<'cls> {
    type Item = Message;
    type Error = Error;

    /// Never yields anything until the stream closes: see the module doc
    /// for why a partial prefix can't be driven through `MessageIterator`
    /// without risking poisoning it.
    fn decode(&mut self, _src: &mut BytesMut) -> Result<Option<Message>, Error> {
        Ok(self.pending.pop_front())
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        if let Some(m) = self.pending.pop_front() {
            return Ok(Some(m));
        }
        if self.drained {
            return Ok(None);
        }
        self.drain(src)?;
        self.drained = true;
        Ok(self.pending.pop_front())
    }
}
