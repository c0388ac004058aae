use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(2500);

const BACKSPACE: char = '\u{8}';

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
	#[error("could not open the log file {}: {source}", path.display())]
	Open { path: PathBuf, source: io::Error },
	#[error("log file i/o failed: {0}")]
	Io(#[from] io::Error),
}

/// Where written text is shown live, besides the file.
pub trait Mirror: Send + Sync {
	fn mirror(&self, text: &str);
}

pub struct StdoutMirror;

impl Mirror for StdoutMirror {
	fn mirror(&self, text: &str) {
		let mut out = io::stdout().lock();
		let _ = out.write_all(text.as_bytes());
		let _ = out.flush();
	}
}

pub struct NullMirror;

impl Mirror for NullMirror {
	fn mirror(&self, _text: &str) {}
}

/// Backspace-aware log writer over a single file handle.
///
/// The file is opened read+write rather than append-only: a run of
/// backspaces in the output retracts characters that were already written,
/// which needs a seek backwards and a truncate. Writes are buffered; a
/// background task flushes at most once per [`FLUSH_INTERVAL`].
pub struct LogSink {
	inner: Arc<Inner>,
	flusher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
	log: Mutex<Option<LogFile>>,
	flush_needed: Notify,
	mirror: Box<dyn Mirror>,
	last_line: Mutex<String>,
}

struct LogFile {
	writer: BufWriter<File>,
	path: PathBuf,
	pos: u64,
	start_offset: u64,
	dirty: bool,
	last_flush: Instant,
	failed: bool,
}

impl LogSink {
	pub fn open(path: &Path, mirror: Box<dyn Mirror>) -> Result<Self, SinkError> {
		let open_err = |source| SinkError::Open { path: path.to_path_buf(), source };

		if let Some(parent) = path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent).map_err(open_err)?;
			}
		}

		let mut file = OpenOptions::new()
			.read(true)
			.write(true)
			.create(true)
			.truncate(false)
			.open(path)
			.map_err(open_err)?;
		let pos = file.seek(SeekFrom::End(0)).map_err(open_err)?;

		let inner = Arc::new(Inner {
			log: Mutex::new(Some(LogFile {
				writer: BufWriter::new(file),
				path: path.to_path_buf(),
				pos,
				start_offset: pos,
				dirty: false,
				last_flush: Instant::now(),
				failed: false,
			})),
			flush_needed: Notify::new(),
			mirror,
			last_line: Mutex::new(String::new()),
		});

		let flusher = tokio::runtime::Handle::try_current()
			.ok()
			.map(|rt| rt.spawn(flush_loop(Arc::clone(&inner))));

		Ok(Self { inner, flusher: Mutex::new(flusher) })
	}

	/// A sink that only mirrors, for runs with file logging disabled.
	pub fn disabled(mirror: Box<dyn Mirror>) -> Self {
		Self {
			inner: Arc::new(Inner {
				log: Mutex::new(None),
				flush_needed: Notify::new(),
				mirror,
				last_line: Mutex::new(String::new()),
			}),
			flusher: Mutex::new(None),
		}
	}

	pub fn path(&self) -> Option<PathBuf> {
		self.inner.log().as_ref().map(|log| log.path.clone())
	}

	/// Byte offset in the file where this run's output begins.
	pub fn start_offset(&self) -> u64 {
		self.inner.log().as_ref().map(|log| log.start_offset).unwrap_or(0)
	}

	/// Separate this run from earlier runs sharing the same file.
	pub fn begin_run(&self) {
		let mut guard = self.inner.log();
		if let Some(log) = guard.as_mut() {
			if log.pos > 0 {
				log.append("\n\n\n");
				log.start_offset = log.pos;
				self.inner.flush_needed.notify_one();
			}
		}
	}

	pub fn write(&self, text: &str) {
		if text.is_empty() {
			return;
		}
		self.inner.mirror.mirror(text);
		self.inner.track_last_line(text);

		let mut guard = self.inner.log();
		if let Some(log) = guard.as_mut() {
			log.write_text(text);
			self.inner.flush_needed.notify_one();
		}
	}

	pub fn write_line(&self, text: &str) {
		self.write(text);
		self.write("\n");
	}

	pub fn flush(&self) -> Result<(), SinkError> {
		self.inner.flush()
	}

	/// Everything this run has written so far, for failure notifications.
	pub fn excerpt(&self) -> Result<Option<String>, SinkError> {
		let mut guard = self.inner.log();
		let Some(log) = guard.as_mut() else {
			return Ok(None);
		};
		log.flush()?;
		let len = log.pos - log.start_offset;
		let file = log.writer.get_mut();
		file.seek(SeekFrom::Start(log.start_offset))?;
		let mut bytes = Vec::with_capacity(len as usize);
		file.take(len).read_to_end(&mut bytes)?;
		file.seek(SeekFrom::Start(log.pos))?;
		Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
	}

	/// The line currently being written, with backspaces applied.
	pub fn last_line(&self) -> String {
		self.inner.last_line.lock().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Stop the background flusher and flush what is left. Idempotent.
	pub fn close(&self) -> Result<(), SinkError> {
		if let Some(handle) = self.flusher.lock().unwrap_or_else(PoisonError::into_inner).take() {
			handle.abort();
		}
		self.inner.flush()
	}
}

impl Drop for LogSink {
	fn drop(&mut self) {
		if let Err(e) = self.close() {
			tracing::warn!("final log flush failed: {}", e);
		}
	}
}

impl Inner {
	fn log(&self) -> MutexGuard<'_, Option<LogFile>> {
		self.log.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn flush(&self) -> Result<(), SinkError> {
		match self.log().as_mut() {
			Some(log) => log.flush().map_err(SinkError::from),
			None => Ok(()),
		}
	}

	fn track_last_line(&self, text: &str) {
		let mut line = self.last_line.lock().unwrap_or_else(PoisonError::into_inner);
		for ch in text.chars() {
			match ch {
				BACKSPACE => {
					line.pop();
				}
				'\r' | '\n' => line.clear(),
				_ => line.push(ch),
			}
		}
	}
}

async fn flush_loop(inner: Arc<Inner>) {
	loop {
		inner.flush_needed.notified().await;

		let due = inner.log().as_ref().map(|log| log.last_flush + FLUSH_INTERVAL);
		if let Some(due) = due {
			tokio::time::sleep_until(due).await;
		}

		if let Err(e) = inner.flush() {
			tracing::warn!("log flush failed: {}", e);
		}
	}
}

impl LogFile {
	fn write_text(&mut self, mut text: &str) {
		while let Some(index) = text.find(BACKSPACE) {
			self.append(&text[..index]);
			let rest = &text[index..];
			let trimmed = rest.trim_start_matches(BACKSPACE);
			// backspace is one byte wide
			let count = rest.len() - trimmed.len();
			if let Err(e) = self.erase_chars(count) {
				self.report(e);
			}
			text = trimmed;
		}
		self.append(text);
	}

	fn append(&mut self, text: &str) {
		if text.is_empty() {
			return;
		}
		match self.writer.write_all(text.as_bytes()) {
			Ok(()) => {
				self.pos += text.len() as u64;
				self.dirty = true;
			}
			Err(e) => self.report(e),
		}
	}

	/// Retract up to `count` characters, never crossing the last newline.
	///
	/// UTF-8 is variable width, so the number of bytes to drop is found by
	/// re-reading the tail of the file and growing the window until it holds
	/// `count` characters or a newline. The window is capped at four bytes
	/// per character; a file whose tail is not valid UTF-8 is cut at the
	/// first character boundary inside the capped window, or at the window's
	/// start when it holds no character start at all.
	fn erase_chars(&mut self, count: usize) -> io::Result<()> {
		if count == 0 || self.pos == 0 {
			return Ok(());
		}
		self.writer.flush()?;

		let end = self.pos;
		let max_window = end.min(4 * count as u64);
		let mut window = end.min(count as u64);
		let mut buf = Vec::new();
		loop {
			buf.resize(window as usize, 0);
			let file = self.writer.get_mut();
			file.seek(SeekFrom::Start(end - window))?;
			file.read_exact(&mut buf)?;

			if !is_continuation(buf[0]) {
				let text = String::from_utf8_lossy(&buf);
				if text.chars().count() >= count || text.contains('\n') {
					break;
				}
			}
			if window == max_window {
				break;
			}
			window += 1;
		}

		let cut = match buf.iter().rposition(|&b| b == b'\n') {
			Some(newline) => newline + 1,
			None => buf.iter().position(|&b| !is_continuation(b)).unwrap_or(0),
		};
		let new_pos = end - window + cut as u64;

		let file = self.writer.get_mut();
		file.set_len(new_pos)?;
		file.seek(SeekFrom::Start(new_pos))?;
		self.pos = new_pos;
		self.dirty = true;
		Ok(())
	}

	fn flush(&mut self) -> io::Result<()> {
		if self.dirty {
			self.writer.flush()?;
			self.dirty = false;
		}
		self.last_flush = Instant::now();
		Ok(())
	}

	fn report(&mut self, e: io::Error) {
		if !self.failed {
			tracing::warn!("writing to log file {} failed: {}", self.path.display(), e);
			self.failed = true;
		}
	}
}

fn is_continuation(b: u8) -> bool {
	b & 0xC0 == 0x80
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn sink(dir: &tempfile::TempDir) -> (LogSink, PathBuf) {
		let path = dir.path().join("out.log");
		(LogSink::open(&path, Box::new(NullMirror)).unwrap(), path)
	}

	fn contents(sink: &LogSink, path: &Path) -> String {
		sink.flush().unwrap();
		fs::read_to_string(path).unwrap()
	}

	#[test]
	fn backspaces_erase_characters() {
		let dir = tempfile::tempdir().unwrap();
		let (sink, path) = sink(&dir);
		sink.write("hello");
		sink.write("\u{8}\u{8}\u{8}bye!");
		assert_eq!(contents(&sink, &path), "hebye!");
	}

	#[test]
	fn backspaces_stop_at_newline() {
		let dir = tempfile::tempdir().unwrap();
		let (sink, path) = sink(&dir);
		sink.write("line1\nab");
		sink.write("\u{8}\u{8}\u{8}\u{8}");
		assert_eq!(contents(&sink, &path), "line1\n");
		sink.write("c");
		assert_eq!(contents(&sink, &path), "line1\nc");
	}

	#[test]
	fn backspaces_erase_multibyte_characters() {
		let dir = tempfile::tempdir().unwrap();
		let (sink, path) = sink(&dir);
		sink.write("progress: 50€\u{1D11E}");
		sink.write("\u{8}\u{8}\u{8}75%");
		assert_eq!(contents(&sink, &path), "progress: 575%");
	}

	#[test]
	fn backspaces_at_start_of_file_are_absorbed() {
		let dir = tempfile::tempdir().unwrap();
		let (sink, path) = sink(&dir);
		sink.write("ab\u{8}\u{8}\u{8}\u{8}\u{8}x");
		assert_eq!(contents(&sink, &path), "x");
	}

	#[test]
	fn erase_window_is_bounded_on_invalid_tail() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.log");
		let mut garbage = b"ab".to_vec();
		garbage.extend([0x80; 10]);
		fs::write(&path, &garbage).unwrap();

		let sink = LogSink::open(&path, Box::new(NullMirror)).unwrap();
		sink.write("\u{8}x");
		sink.flush().unwrap();

		// one backspace may reach back at most four bytes
		let mut expected = b"ab".to_vec();
		expected.extend([0x80; 6]);
		expected.push(b'x');
		assert_eq!(fs::read(&path).unwrap(), expected);
	}

	#[test]
	fn erase_on_invalid_tail_cuts_at_a_character_start() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.log");
		fs::write(&path, b"ab\xC3\xA9\x80").unwrap();

		let sink = LogSink::open(&path, Box::new(NullMirror)).unwrap();
		sink.write("\u{8}x");
		sink.flush().unwrap();

		assert_eq!(fs::read(&path).unwrap(), b"abx");
	}

	#[test]
	fn retracted_bytes_do_not_survive() {
		let dir = tempfile::tempdir().unwrap();
		let (sink, path) = sink(&dir);
		sink.write("12345");
		sink.write("\u{8}\u{8}\u{8}");
		assert_eq!(contents(&sink, &path), "12");
	}

	#[test]
	fn appends_to_existing_file_and_tracks_excerpt() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("nested").join("out.log");
		fs::create_dir_all(path.parent().unwrap()).unwrap();
		fs::write(&path, "previous run\n").unwrap();

		let sink = LogSink::open(&path, Box::new(NullMirror)).unwrap();
		sink.begin_run();
		assert_eq!(sink.start_offset(), "previous run\n\n\n\n".len() as u64);
		sink.write_line("this run");
		assert_eq!(sink.excerpt().unwrap().as_deref(), Some("this run\n"));
		sink.write("more");
		assert_eq!(sink.excerpt().unwrap().as_deref(), Some("this run\nmore"));
		assert_eq!(contents(&sink, &path), "previous run\n\n\n\nthis run\nmore");
	}

	#[test]
	fn begin_run_on_empty_file_writes_nothing() {
		let dir = tempfile::tempdir().unwrap();
		let (sink, path) = sink(&dir);
		sink.begin_run();
		assert_eq!(sink.start_offset(), 0);
		assert_eq!(contents(&sink, &path), "");
	}

	#[test]
	fn last_line_applies_backspaces() {
		let sink = LogSink::disabled(Box::new(NullMirror));
		sink.write("first\nsecond 10%");
		sink.write("\u{8}\u{8}\u{8}20%");
		assert_eq!(sink.last_line(), "second 20%");
		assert_eq!(sink.excerpt().unwrap(), None);
	}

	#[tokio::test(start_paused = true)]
	async fn background_flusher_writes_out_buffer() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("out.log");
		let sink = LogSink::open(&path, Box::new(NullMirror)).unwrap();
		sink.write("buffered");
		assert_eq!(fs::read_to_string(&path).unwrap(), "");

		tokio::time::sleep(FLUSH_INTERVAL + Duration::from_millis(100)).await;
		assert_eq!(fs::read_to_string(&path).unwrap(), "buffered");
		sink.close().unwrap();
	}
}
