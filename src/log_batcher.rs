//! Console log batching.
//!
//! [`LogBatcher`] turns a stream of possibly multi-line messages into
//! bounded, ordered batches. It performs no I/O: the run store owns one
//! batcher inside its per-run lock and persists each batch it hands back
//! as a log-shard document, so order numbers are assigned under the same
//! lock that guards the buffer.

/// A batch ready to be written as one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogBatch {
    /// Per-run sequence number, gap-free from 1.
    pub order: u64,
    pub lines: Vec<String>,
}

#[derive(Debug)]
pub struct LogBatcher {
    buffer: Vec<String>,
    threshold: usize,
    next_order: u64,
}

impl LogBatcher {
    pub fn new(threshold: usize) -> Self {
        Self {
            buffer: Vec::new(),
            threshold: threshold.max(1),
            next_order: 1,
        }
    }

    /// Append a message, returning every batch that filled up.
    ///
    /// Lines are split on `\r\n`, `\n` and `\r`.
    pub fn append(&mut self, message: &str) -> Vec<LogBatch> {
        self.append_lines(split_lines(message))
    }

    pub fn append_lines<I, S>(&mut self, lines: I) -> Vec<LogBatch>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut full = Vec::new();
        for line in lines {
            self.buffer.push(line.into());
            if self.buffer.len() >= self.threshold {
                full.extend(self.take_batch());
            }
        }
        full
    }

    /// Snapshot and clear the buffer. `None` when nothing is buffered.
    pub fn take_batch(&mut self) -> Option<LogBatch> {
        if self.buffer.is_empty() {
            return None;
        }
        let order = self.next_order;
        self.next_order += 1;
        Some(LogBatch {
            order,
            lines: std::mem::take(&mut self.buffer),
        })
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Order number the next batch will get.
    pub fn next_order(&self) -> u64 {
        self.next_order
    }
}

/// Split a message into lines on any line-ending convention.
///
/// A trailing line terminator does not produce an empty final line; an
/// empty message is one empty line.
pub fn split_lines(message: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = message.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                lines.push(std::mem::take(&mut current));
            }
            '\n' => lines.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_any_line_ending() {
        assert_eq!(split_lines("a\nb\r\nc\rd"), vec!["a", "b", "c", "d"]);
        assert_eq!(split_lines("a\n"), vec!["a"]);
        assert_eq!(split_lines("a\n\nb"), vec!["a", "", "b"]);
        assert_eq!(split_lines(""), vec![""]);
        assert_eq!(split_lines("\r\n"), vec![""]);
    }

    #[test]
    fn test_250_lines_make_three_ordered_batches() {
        let input: Vec<String> = (0..250).map(|i| format!("line {}", i)).collect();
        let mut batcher = LogBatcher::new(100);

        let mut batches = batcher.append(&input.join("\n"));
        assert_eq!(batches.len(), 2);
        batches.extend(batcher.take_batch());

        let orders: Vec<u64> = batches.iter().map(|b| b.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
        let sizes: Vec<usize> = batches.iter().map(|b| b.lines.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);

        let rejoined: Vec<String> = batches.into_iter().flat_map(|b| b.lines).collect();
        assert_eq!(rejoined, input);
    }

    #[test]
    fn test_take_batch_on_empty_is_noop() {
        let mut batcher = LogBatcher::new(10);
        assert!(batcher.take_batch().is_none());
        assert_eq!(batcher.next_order(), 1);

        assert!(batcher.append("one").is_empty());
        assert_eq!(batcher.buffered(), 1);
        let batch = batcher.take_batch().unwrap();
        assert_eq!(batch.order, 1);
        assert!(batcher.take_batch().is_none());
        assert_eq!(batcher.next_order(), 2);
    }

    #[test]
    fn test_threshold_reached_exactly() {
        let mut batcher = LogBatcher::new(2);
        let batches = batcher.append_lines(["a", "b"]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batcher.buffered(), 0);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let batcher = LogBatcher::new(0);
        assert_eq!(batcher.threshold(), 1);
    }
}
