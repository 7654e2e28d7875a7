use crate::errors::Error;

use async_trait::async_trait;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncBufReadExt;

/*
 * Operator facing output. Diagnostics go through the log facade; what the
 * operator is meant to read goes here so tests can capture it.
 */
pub struct Terminal {
    out: Mutex<Box<dyn Write + Send>>,
    err: Mutex<Box<dyn Write + Send>>,
}

impl Terminal {

    pub fn new(out: Box<dyn Write + Send>, err: Box<dyn Write + Send>) -> Self {
	Self{
	    out: Mutex::new(out),
	    err: Mutex::new(err),
	}
    }

    pub fn stdio() -> Self {
	Self::new(Box::new(std::io::stdout()), Box::new(std::io::stderr()))
    }

    /* A terminal writing into in-memory buffers, returned alongside it. */
    pub fn captured() -> (Self, SharedBuffer, SharedBuffer) {
	let out = SharedBuffer::default();
	let err = SharedBuffer::default();
	let term = Self::new(Box::new(out.clone()), Box::new(err.clone()));
	(term, out, err)
    }

    fn write(target: &Mutex<Box<dyn Write + Send>>, text: &str) {
	if let Ok(mut w) = target.lock() {
	    // nothing sensible to do if the terminal is gone
	    let _ = w.write_all(text.as_bytes());
	    let _ = w.flush();
	}
    }

    pub fn print(&self, text: &str) {
	Self::write(&self.out, text);
    }

    pub fn println(&self, text: &str) {
	Self::write(&self.out, &format!("{}\n", text));
    }

    pub fn eprintln(&self, text: &str) {
	Self::write(&self.err, &format!("{}\n", text));
    }

    pub fn warn(&self, text: &str) {
	self.eprintln(&format!("Warning: {}", text));
    }
}

#[derive(Clone, Default)]
pub struct SharedBuffer {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {

    pub fn contents(&self) -> String {
	match self.inner.lock() {
	    Ok(buf) => String::from_utf8_lossy(&buf).to_string(),
	    Err(_) => String::new(),
	}
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
	match self.inner.lock() {
	    Ok(mut inner) => inner.extend_from_slice(buf),
	    Err(_) => return Err(std::io::Error::new(std::io::ErrorKind::Other, "buffer poisoned")),
	}
	Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
	Ok(())
    }
}

/*
 * Yes/no questions to the operator.
 */
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn confirm(&self, question: &str) -> Result<bool, Error>;
}

/* Asks on stdout, reads the answer from stdin. */
pub struct StdinPrompter;

const MAX_ATTEMPTS: usize = 3;

pub fn parse_answer(input: &str) -> Option<bool> {
    match input.trim().to_lowercase().as_str() {
	"y" | "yes" => Some(true),
	"n" | "no" | "" => Some(false),
	_ => None,
    }
}

#[async_trait]
impl Prompter for StdinPrompter {
    async fn confirm(&self, question: &str) -> Result<bool, Error> {
	let mut reader = tokio::io::BufReader::new(tokio::io::stdin());

	for _ in 0..MAX_ATTEMPTS {
	    print!("{} [y/n]: ", question);
	    std::io::stdout().flush()?;

	    let mut input = String::new();
	    if reader.read_line(&mut input).await? == 0 {
		// stdin closed
		return Ok(false);
	    }
	    if let Some(answer) = parse_answer(&input) {
		return Ok(answer);
	    }
	}

	Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn answers() {
	assert_eq!(parse_answer("y\n"), Some(true));
	assert_eq!(parse_answer(" YES "), Some(true));
	assert_eq!(parse_answer("no"), Some(false));
	assert_eq!(parse_answer("\n"), Some(false));
	assert_eq!(parse_answer("maybe"), None);
    }

    #[test]
    fn captured_output() {
	let (term, out, err) = Terminal::captured();
	term.println("hello");
	term.warn("careful");
	assert_eq!(out.contents(), "hello\n");
	assert_eq!(err.contents(), "Warning: careful\n");
    }
}
