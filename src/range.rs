//! HTTP `Range` negotiation and remote offset alignment.

use bytes::Bytes;

const MIB: u64 = 1024 * 1024;

/// The byte window served to the client. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServingWindow {
    pub start: u64,
    pub end: u64,
    pub total: u64,
    /// True when a valid range was requested and the response is a 206.
    pub partial: bool,
}

impl ServingWindow {
    pub fn full(total: u64) -> Self {
        Self {
            start: 0,
            end: total.saturating_sub(1),
            total,
            partial: false,
        }
    }

    /// Number of bytes in the window. Zero only for an empty object.
    pub fn len(&self) -> u64 {
        if self.total == 0 {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Content-Range` value for a partial response.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parse a `Range` header against an object of `size` bytes.
///
/// Only a single `bytes=S-E` or `bytes=S-` range is honoured. Anything else,
/// including suffix ranges and unsatisfiable starts, serves the full object.
pub fn parse_range(header: Option<&str>, size: u64) -> ServingWindow {
    if size == 0 {
        return ServingWindow::full(0);
    }

    let Some((start, end)) = header.and_then(parse_bounds) else {
        return ServingWindow::full(size);
    };

    let end = end.unwrap_or(size - 1).min(size - 1);
    if start >= size || start > end {
        return ServingWindow::full(size);
    }

    ServingWindow {
        start,
        end,
        total: size,
        partial: true,
    }
}

fn parse_bounds(header: &str) -> Option<(u64, Option<u64>)> {
    let spec = header.trim().strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, end) = spec.split_once('-')?;
    let start = start.trim();
    let end = end.trim();
    if start.is_empty() {
        return None;
    }
    let start = start.parse::<u64>().ok()?;
    let end = match end {
        "" => None,
        end => Some(end.parse::<u64>().ok()?),
    };
    Some((start, end))
}

/// Offset granularity the remote source accepts, chosen by object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentPolicy {
    pub large_threshold: u64,
    pub large_align: u64,
    pub small_align: u64,
}

impl Default for AlignmentPolicy {
    fn default() -> Self {
        Self {
            large_threshold: 10 * MIB,
            large_align: MIB,
            small_align: 4 * 1024,
        }
    }
}

impl AlignmentPolicy {
    pub fn alignment_for(&self, size: u64) -> u64 {
        let align = if size > self.large_threshold {
            self.large_align
        } else {
            self.small_align
        };
        align.max(1)
    }

    pub fn plan(&self, window: &ServingWindow) -> FetchPlan {
        let alignment = self.alignment_for(window.total);
        let remote_offset = window.start / alignment * alignment;
        FetchPlan {
            alignment,
            remote_offset,
            skip_bytes: window.start - remote_offset,
            chunk_size: window.len(),
        }
    }
}

/// How the serving window maps onto aligned remote reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    /// Both the offset granularity and the remote part size.
    pub alignment: u64,
    pub remote_offset: u64,
    /// Leading bytes of the remote stream that precede the window.
    pub skip_bytes: u64,
    /// Bytes to forward to the client.
    pub chunk_size: u64,
}

impl FetchPlan {
    pub fn slice_state(&self) -> SliceState {
        SliceState {
            skip_remaining: self.skip_bytes,
            remaining: self.chunk_size,
        }
    }

    /// Exclusive end of the remote bytes the window needs.
    pub fn remote_end(&self) -> u64 {
        self.remote_offset + self.skip_bytes + self.chunk_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceState {
    pub skip_remaining: u64,
    pub remaining: u64,
}

impl SliceState {
    pub fn is_done(&self) -> bool {
        self.remaining == 0
    }
}

/// Cut the part of `chunk` that falls inside the window.
///
/// Leading bytes are dropped until the skip is consumed, and the output is
/// clamped so the total emitted never exceeds the window length.
pub fn slice_window(chunk: Bytes, state: SliceState) -> (Bytes, SliceState) {
    let len = chunk.len() as u64;
    if len <= state.skip_remaining {
        let state = SliceState {
            skip_remaining: state.skip_remaining - len,
            ..state
        };
        return (Bytes::new(), state);
    }

    let from = state.skip_remaining;
    let take = (len - from).min(state.remaining);
    let emitted = chunk.slice(from as usize..(from + take) as usize);
    (
        emitted,
        SliceState {
            skip_remaining: 0,
            remaining: state.remaining - take,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_range() {
        let window = parse_range(Some("bytes=100-199"), 1000);
        assert!(window.partial);
        assert_eq!((window.start, window.end), (100, 199));
        assert_eq!(window.len(), 100);
        assert_eq!(window.content_range(), "bytes 100-199/1000");
    }

    #[test]
    fn test_open_range_is_partial() {
        let window = parse_range(Some("bytes=0-"), 1000);
        assert!(window.partial);
        assert_eq!((window.start, window.end), (0, 999));

        let window = parse_range(Some("bytes=900-"), 1000);
        assert_eq!(window.len(), 100);
    }

    #[test]
    fn test_end_is_clamped() {
        let window = parse_range(Some("bytes=500-5000"), 1000);
        assert!(window.partial);
        assert_eq!(window.end, 999);
    }

    #[test]
    fn test_no_header_serves_everything() {
        let window = parse_range(None, 1000);
        assert!(!window.partial);
        assert_eq!(window.len(), 1000);
    }

    #[test]
    fn test_invalid_ranges_serve_everything() {
        for header in [
            "bytes=-50",
            "garbage",
            "items=0-10",
            "bytes=0-10,20-30",
            "bytes=abc-def",
            "bytes=10-x",
            "bytes=1000-",
            "bytes=1500-1600",
            "bytes=200-100",
            "bytes=",
        ] {
            let window = parse_range(Some(header), 1000);
            assert_eq!(window, ServingWindow::full(1000), "{header}");
        }
    }

    #[test]
    fn test_empty_object() {
        let window = parse_range(Some("bytes=0-10"), 0);
        assert!(!window.partial);
        assert!(window.is_empty());
    }

    #[test]
    fn test_alignment_for_large_object() {
        let size = 20 * MIB;
        let window = parse_range(Some("bytes=1500000-"), size);
        let plan = AlignmentPolicy::default().plan(&window);
        assert_eq!(plan.alignment, MIB);
        assert_eq!(plan.remote_offset, 1_048_576);
        assert_eq!(plan.skip_bytes, 451_424);
        assert_eq!(plan.chunk_size, size - 1_500_000);
        assert_eq!(plan.remote_end(), size);
    }

    #[test]
    fn test_alignment_for_small_object() {
        let window = parse_range(Some("bytes=5000-5999"), 8 * MIB);
        let plan = AlignmentPolicy::default().plan(&window);
        assert_eq!(plan.alignment, 4096);
        assert_eq!(plan.remote_offset, 4096);
        assert_eq!(plan.skip_bytes, 904);
        assert_eq!(plan.chunk_size, 1000);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let policy = AlignmentPolicy::default();
        assert_eq!(policy.alignment_for(10 * MIB), 4096);
        assert_eq!(policy.alignment_for(10 * MIB + 1), MIB);
    }

    #[test]
    fn test_slice_window_across_chunks() {
        let data: Vec<u8> = (0..=255).collect();
        let chunks: Vec<Bytes> = data.chunks(10).map(Bytes::copy_from_slice).collect();

        // Window covers bytes 25..=74 of the stream.
        let mut state = SliceState {
            skip_remaining: 25,
            remaining: 50,
        };
        let mut out = Vec::new();
        for chunk in chunks {
            if state.is_done() {
                break;
            }
            let (emitted, next) = slice_window(chunk, state);
            out.extend_from_slice(&emitted);
            state = next;
        }
        assert_eq!(out, data[25..75]);
        assert!(state.is_done());
    }

    #[test]
    fn test_slice_window_skip_consumes_whole_chunk() {
        let state = SliceState {
            skip_remaining: 10,
            remaining: 5,
        };
        let (emitted, state) = slice_window(Bytes::from_static(b"0123456789"), state);
        assert!(emitted.is_empty());
        assert_eq!(state.skip_remaining, 0);
        assert_eq!(state.remaining, 5);
    }

    #[test]
    fn test_slice_window_never_exceeds_remaining() {
        let state = SliceState {
            skip_remaining: 0,
            remaining: 3,
        };
        let (emitted, state) = slice_window(Bytes::from_static(b"abcdef"), state);
        assert_eq!(&emitted[..], b"abc");
        assert!(state.is_done());

        let (emitted, _) = slice_window(Bytes::from_static(b"ghi"), state);
        assert!(emitted.is_empty());
    }
}
