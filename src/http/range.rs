/// Boundary used for `multipart/byteranges` bodies.
pub const MULTIPART_BOUNDARY: &str = "THIS_STRING_SEPARATES";

/// A resolved byte range: absolute start offset and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub len: u64,
}

impl ByteRange {
    pub fn end(&self) -> u64 {
        self.start + self.len - 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end(), total)
    }
}

pub fn unsatisfiable_content_range(total: u64) -> String {
    format!("bytes */{total}")
}

/// Parse a `Range` header against a representation of `total` bytes.
///
/// Returns `None` when no range is to be honored: the header is absent,
/// malformed, uses a unit other than `bytes`, or reduces to the whole body
/// (a single `0-` range covering everything is served as a plain 200).
/// Returns `Some(vec![])` when every requested range is unsatisfiable, which
/// callers turn into a 416.
pub fn parse_ranges(value: &str, total: u64) -> Option<Vec<ByteRange>> {
    let spec = value.trim().strip_prefix("bytes=")?;
    if spec.is_empty() {
        return None;
    }

    let mut ranges = Vec::new();
    let mut specs = 0usize;
    for part in spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        specs += 1;
        if let Some(suffix) = part.strip_prefix('-') {
            // bytes=-n : final n bytes
            let n: u64 = suffix.parse().ok()?;
            if n == 0 || n >= total {
                // Zero-length suffix or one spanning the whole body is not a
                // real range request.
                if specs == 1 && !spec.contains(',') {
                    return None;
                }
                if n == 0 {
                    continue;
                }
                ranges.push(ByteRange {
                    start: 0,
                    len: total,
                });
                continue;
            }
            ranges.push(ByteRange {
                start: total - n,
                len: n,
            });
        } else if let Some((first, last)) = part.split_once('-') {
            let start: u64 = first.trim().parse().ok()?;
            if last.trim().is_empty() {
                // bytes=a- : from a to the end
                if start == 0 {
                    return None;
                }
                if start >= total {
                    continue;
                }
                ranges.push(ByteRange {
                    start,
                    len: total - start,
                });
            } else {
                let end: u64 = last.trim().parse().ok()?;
                if end < start {
                    return None;
                }
                if start == 0 && end + 1 >= total {
                    // Trivial range covering the whole body.
                    if specs == 1 && !spec.contains(',') {
                        return None;
                    }
                    ranges.push(ByteRange {
                        start: 0,
                        len: total,
                    });
                    continue;
                }
                if start >= total {
                    continue;
                }
                let end = end.min(total.saturating_sub(1));
                ranges.push(ByteRange {
                    start,
                    len: end - start + 1,
                });
            }
        } else {
            return None;
        }
    }

    if specs == 0 {
        return None;
    }
    Some(ranges)
}
