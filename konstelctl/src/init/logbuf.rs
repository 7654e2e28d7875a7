use std::collections::VecDeque;

/* Soft cap on bootstrapper logs kept in memory. */
pub const LOG_BUFFER_CAP: usize = 4 << 20;

pub const TRUNCATED_MARKER: &str = "[earlier bootstrapper logs were truncated]";

/*
 * Bounded buffer of log lines streamed by the bootstrapper. When full, the
 * oldest lines are dropped and a single truncation marker is emitted in
 * front of what remains.
 */
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    size: usize,
    cap: usize,
    truncated: bool,
}

impl Default for LogBuffer {
    fn default() -> Self {
	Self::with_capacity(LOG_BUFFER_CAP)
    }
}

impl LogBuffer {

    pub fn with_capacity(cap: usize) -> Self {
	Self{
	    lines: VecDeque::new(),
	    size: 0,
	    cap: cap,
	    truncated: false,
	}
    }

    pub fn push(&mut self, line: &str) {
	let line = line.trim_end_matches('\n').to_string();
	while !self.lines.is_empty() && self.size + line.len() + 1 > self.cap {
	    if let Some(dropped) = self.lines.pop_front() {
		self.size -= dropped.len() + 1;
		self.truncated = true;
	    }
	}
	self.size += line.len() + 1;
	self.lines.push_back(line);
    }

    pub fn is_empty(&self) -> bool {
	self.lines.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
	self.truncated
    }

    /* Newline terminated text, ready to be written to a log file. */
    pub fn contents(&self) -> String {
	let mut out = String::with_capacity(self.size + TRUNCATED_MARKER.len() + 1);
	if self.truncated {
	    out.push_str(TRUNCATED_MARKER);
	    out.push('\n');
	}
	for line in &self.lines {
	    out.push_str(line);
	    out.push('\n');
	}
	out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_lines_in_order() {
	let mut buf = LogBuffer::default();
	buf.push("one");
	buf.push("two\n");
	assert_eq!(buf.contents(), "one\ntwo\n");
	assert!(!buf.is_truncated());
    }

    #[test]
    fn drops_oldest_with_single_marker() {
	let mut buf = LogBuffer::with_capacity(12);
	buf.push("aaaa");
	buf.push("bbbb");
	buf.push("cccc");
	buf.push("dddd");

	assert!(buf.is_truncated());
	assert_eq!(buf.contents(), format!("{}\ncccc\ndddd\n", TRUNCATED_MARKER));
    }
}
