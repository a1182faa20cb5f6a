//! Timestamp continuity at the topology boundary.
//!
//! Only external ports carry timestamps. On the input side the manager
//! compares each inbound buffer's timestamp against the value implied by the
//! bytes already consumed; a mismatch marks a discontinuity and blocks
//! further accumulation until the pre-gap data drains — two buffers that are
//! not contiguous in time must never be silently concatenated. On the output
//! side the extrapolated position-zero timestamp recorded before a frame is
//! compared against what the graph produced; a mismatch splits the produced
//! buffer so that no sample is ever delivered under a wrong timestamp and no
//! sample is lost or duplicated across the split.

use caudal_graph::{MediaFormat, TimestampRecord};
use tracing::debug;

/// A timestamp break inside a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Discontinuity {
    /// Byte offset where the break begins.
    pub pos_bytes: usize,
    /// Timestamp of the first sample after the break.
    pub resume_timestamp_us: i64,
}

/// One buffer of interleaved PCM with its position-zero timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Interleaved sample bytes.
    pub data: Vec<u8>,
    /// Timestamp (µs) of the first sample.
    pub timestamp_us: i64,
    /// Marks the end of a delivery unit toward the consumer.
    pub end_of_frame: bool,
    /// A known timestamp break inside this buffer, if any.
    pub discontinuity: Option<Discontinuity>,
}

impl FrameBuffer {
    /// Creates a contiguous buffer.
    pub fn new(data: Vec<u8>, timestamp_us: i64) -> Self {
        Self {
            data,
            timestamp_us,
            end_of_frame: false,
            discontinuity: None,
        }
    }
}

/// Result of registering one inbound buffer against a port's record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputVerdict {
    /// First buffer seen; the timestamp base is now established.
    Started,
    /// The buffer continues exactly where the previous data ended.
    Contiguous,
    /// The buffer does not line up; accumulation is blocked until drain.
    Discontinuous {
        /// Signed gap (µs): positive means missing time, negative overlap.
        gap_us: i64,
    },
}

// --- Input side ---

/// Checks an inbound buffer's timestamp against the record's expectation.
///
/// `buffered_bytes` is the amount of pre-gap data still held locally; it
/// becomes the recorded discontinuity position.
pub fn register_input(
    rec: &mut TimestampRecord,
    buf_timestamp_us: i64,
    buffered_bytes: usize,
) -> InputVerdict {
    if !rec.valid {
        rec.valid = true;
        rec.timestamp_us = buf_timestamp_us;
        return InputVerdict::Started;
    }
    if buf_timestamp_us == rec.timestamp_us {
        return InputVerdict::Contiguous;
    }
    let gap_us = buf_timestamp_us - rec.timestamp_us;
    if buffered_bytes == 0 {
        // Nothing local precedes the gap; the expectation jumps right away
        // and accumulation continues from the new position.
        rec.timestamp_us = buf_timestamp_us;
        debug!("timestamp: input discontinuity of {gap_us} µs with empty accumulator");
        return InputVerdict::Discontinuous { gap_us };
    }
    rec.discontinuity = true;
    rec.disc_pos_bytes = buffered_bytes;
    rec.resume_timestamp_us = buf_timestamp_us;
    debug!("timestamp: input discontinuity of {gap_us} µs at byte {buffered_bytes}");
    InputVerdict::Discontinuous { gap_us }
}

/// Advances the input expectation over accepted bytes.
pub fn advance_input(rec: &mut TimestampRecord, fmt: &MediaFormat, accepted_bytes: usize) {
    rec.timestamp_us += fmt.duration_us_for_bytes(accepted_bytes);
}

/// Whether the local accumulator may take more data.
///
/// While a discontinuity is held and pre-gap data remains buffered, no
/// further buffering is permitted.
pub fn can_accumulate(rec: &TimestampRecord, buffered_bytes: usize) -> bool {
    !(rec.discontinuity && buffered_bytes > 0)
}

/// Completes a held discontinuity once the pre-gap data fully drained: the
/// expectation jumps to the post-gap timestamp.
pub fn resume_after_drain(rec: &mut TimestampRecord) {
    if rec.discontinuity {
        rec.timestamp_us = rec.resume_timestamp_us;
        rec.discontinuity = false;
        rec.disc_pos_bytes = 0;
    }
}

/// Synthesizes silence to bridge a small upstream gap.
///
/// Returns `None` for non-positive gaps and for gaps at or above the drop
/// threshold. The inserted silence is rounded up to a whole-millisecond
/// boundary, trading a bounded amount of silence for strict downstream
/// timing.
pub fn bridge_gap(fmt: &MediaFormat, gap_us: i64, drop_threshold_us: i64) -> Option<Vec<u8>> {
    if gap_us <= 0 || gap_us >= drop_threshold_us {
        return None;
    }
    let whole_ms = (gap_us + 999) / 1000;
    let bytes = fmt.bytes_for_duration_us(whole_ms * 1000);
    debug!("timestamp: bridging {gap_us} µs gap with {bytes} bytes of silence");
    Some(vec![0; bytes])
}

// --- Output side ---

/// Splits a buffer at its recorded discontinuity.
///
/// The head keeps the original timestamp and has `end_of_frame` forced true;
/// the tail starts at the post-break timestamp. A buffer without a
/// discontinuity comes back unchanged, in one piece.
pub fn split_at_discontinuity(mut buf: FrameBuffer) -> (FrameBuffer, Option<FrameBuffer>) {
    let Some(disc) = buf.discontinuity.take() else {
        return (buf, None);
    };
    let pos = disc.pos_bytes.min(buf.data.len());
    let tail_data = buf.data.split_off(pos);
    let tail = FrameBuffer {
        data: tail_data,
        timestamp_us: disc.resume_timestamp_us,
        end_of_frame: buf.end_of_frame,
        discontinuity: None,
    };
    buf.end_of_frame = true;
    (buf, Some(tail))
}

/// Output-side continuity state for one external port: the held post-break
/// tail waiting to be prepended to the next delivery.
#[derive(Debug, Default)]
pub struct OutputSplitter {
    held: Option<FrameBuffer>,
}

impl OutputSplitter {
    /// Creates a splitter with nothing held.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a post-break tail is currently held back.
    pub fn has_held(&self) -> bool {
        self.held.is_some()
    }

    /// The extrapolated position-zero timestamp for the next frame.
    pub fn begin_frame(rec: &TimestampRecord) -> i64 {
        rec.timestamp_us
    }

    /// Reconciles one produced buffer against the extrapolation recorded at
    /// frame start and returns what may be delivered now.
    ///
    /// A timestamp mismatch (annotated inside the buffer, or detected at
    /// position zero against the record) splits the buffer: the pre-break
    /// head is delivered immediately with `end_of_frame` forced true, the
    /// post-break tail is held and prepended to the next delivery. `None`
    /// means everything is being held.
    pub fn commit(
        &mut self,
        rec: &mut TimestampRecord,
        fmt: &MediaFormat,
        mut buf: FrameBuffer,
    ) -> Option<FrameBuffer> {
        if !rec.valid {
            rec.valid = true;
            rec.timestamp_us = buf.timestamp_us;
        }

        let mut disc = buf.discontinuity.take();
        if disc.is_none() && buf.timestamp_us != rec.timestamp_us {
            // The whole buffer starts somewhere other than expected.
            disc = Some(Discontinuity {
                pos_bytes: 0,
                resume_timestamp_us: buf.timestamp_us,
            });
        }

        // Advance the extrapolation over what the graph produced, before any
        // held data is merged in.
        match &disc {
            None => rec.timestamp_us += fmt.duration_us_for_bytes(buf.data.len()),
            Some(d) => {
                let tail_len = buf.data.len().saturating_sub(d.pos_bytes);
                rec.discontinuity = true;
                rec.disc_pos_bytes = d.pos_bytes;
                rec.resume_timestamp_us = d.resume_timestamp_us;
                rec.timestamp_us = d.resume_timestamp_us + fmt.duration_us_for_bytes(tail_len);
                debug!(
                    "timestamp: output discontinuity at byte {} (resume {} µs)",
                    d.pos_bytes, d.resume_timestamp_us
                );
            }
        }

        // Prepend the tail held back from the previous split. Once the tail
        // goes out, the recorded break is resolved unless this commit opened
        // a new one.
        if let Some(mut held) = self.held.take() {
            if disc.is_none() {
                rec.discontinuity = false;
                rec.disc_pos_bytes = 0;
            }
            let shift = held.data.len();
            if let Some(d) = &mut disc {
                d.pos_bytes += shift;
            }
            held.data.append(&mut buf.data);
            held.end_of_frame = buf.end_of_frame;
            buf = FrameBuffer {
                data: held.data,
                timestamp_us: held.timestamp_us,
                end_of_frame: held.end_of_frame,
                discontinuity: None,
            };
        }

        match disc {
            None => Some(buf),
            Some(d) => {
                buf.discontinuity = Some(d);
                let (head, tail) = split_at_discontinuity(buf);
                if let Some(tail) = tail
                    && !tail.data.is_empty()
                {
                    self.held = Some(tail);
                }
                (!head.data.is_empty()).then_some(head)
            }
        }
    }
}
