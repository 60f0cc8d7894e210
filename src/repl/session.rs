use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::serial::{Result, SerialError};

const ESC: u8 = 0x1B;
const ESC_JOYSTICK_START: u8 = b'e';
const ESC_JOYSTICK_STOP: u8 = b'f';
// an unterminated escape longer than this is passed through as-is
const MAX_ESCAPE_LEN: usize = 32;
const POLL_INTERVAL: Duration = Duration::from_millis(85);
const OMIT_WAIT_LIMIT: u32 = 5;
const OK_WAIT_ATTEMPTS: u32 = 20;
const OK_WAIT_INTERVAL: Duration = Duration::from_millis(5);
const LINE_END: &str = "\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplOutput {
    /// Text for the terminal.
    Terminal(String),
    /// The running program asked for joystick packets to start or stop.
    JoystickMode(bool),
}

pub type OutputSink = Arc<dyn Fn(ReplOutput) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ReplSettings {
    /// Upper bound for any wait on device output.
    pub timeout: Duration,
    /// Largest write issued while streaming a command in raw mode.
    pub send_block_size: usize,
}

impl Default for ReplSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            send_block_size: 250,
        }
    }
}

#[derive(Default)]
struct Buffers {
    esc_pending: Vec<u8>,
    utf8_tail: Vec<u8>,
    read_until: Option<String>,
    collected: String,
    force_output: bool,
    catch_ok: bool,
}

impl Buffers {
    /// Hold data back while the last ESC in it has not reached its final letter.
    fn release_complete(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.esc_pending.extend_from_slice(chunk);

        let complete = match self.esc_pending.iter().rposition(|&b| b == ESC) {
            None => true,
            Some(pos) => {
                let rest = &self.esc_pending[pos + 1..];
                rest.iter().any(u8::is_ascii_alphabetic) || rest.len() > MAX_ESCAPE_LEN
            }
        };

        if complete {
            std::mem::take(&mut self.esc_pending)
        } else {
            Vec::new()
        }
    }

    /// Decode UTF-8, carrying a split multi-byte sequence over to the next chunk.
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut data = std::mem::take(&mut self.utf8_tail);
        data.extend_from_slice(bytes);

        match std::str::from_utf8(&data) {
            Ok(text) => text.to_string(),
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                self.utf8_tail = data[valid..].to_vec();
                String::from_utf8_lossy(&data[..valid]).into_owned()
            }
            Err(_) => String::from_utf8_lossy(&data).into_owned(),
        }
    }
}

/// Drop the raw REPL's end-of-output markers (`\x04`, `\x04>`).
fn strip_raw_markers(text: &str) -> String {
    text.replace("\x04>", "").replace('\x04', "")
}

/// Remove `ESC e` / `ESC f` and report them as joystick mode changes.
fn take_joystick_escapes(bytes: Vec<u8>, outputs: &mut Vec<ReplOutput>) -> Vec<u8> {
    if !bytes.contains(&ESC) {
        return bytes;
    }

    let mut kept = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == ESC {
            match bytes.get(i + 1) {
                Some(&ESC_JOYSTICK_START) => {
                    outputs.push(ReplOutput::JoystickMode(true));
                    i += 2;
                    continue;
                }
                Some(&ESC_JOYSTICK_STOP) => {
                    outputs.push(ReplOutput::JoystickMode(false));
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        kept.push(bytes[i]);
        i += 1;
    }
    kept
}

/// Incoming-data side of the REPL.
///
/// Chunks arrive in whatever sizes the transport delivers. Normally they go
/// straight to the output sink; while a read-until pattern is armed they are
/// collected instead so a control routine can wait for a banner or prompt.
pub struct ReplSession {
    settings: ReplSettings,
    buffers: Mutex<Buffers>,
    sink: RwLock<Option<OutputSink>>,
    notify: Notify,
    program_running: AtomicBool,
    epoch: AtomicU64,
}

impl ReplSession {
    pub fn new(settings: ReplSettings) -> Self {
        Self {
            settings,
            buffers: Mutex::new(Buffers::default()),
            sink: RwLock::new(None),
            notify: Notify::new(),
            program_running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn settings(&self) -> &ReplSettings {
        &self.settings
    }

    pub fn set_output_sink(&self, sink: OutputSink) {
        *self.sink.write().unwrap_or_else(PoisonError::into_inner) = Some(sink);
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, outputs: Vec<ReplOutput>) {
        if outputs.is_empty() {
            return;
        }
        let sink = self.sink.read().unwrap_or_else(PoisonError::into_inner).clone();
        match sink {
            Some(sink) => outputs.into_iter().for_each(|output| sink(output)),
            None => log::trace!("No output sink, dropped {} item(s)", outputs.len()),
        }
    }

    pub fn ingest(&self, chunk: &[u8]) {
        let mut outputs = Vec::new();
        {
            let mut buffers = self.buffers();
            let mut released = buffers.release_complete(chunk);
            if released.is_empty() {
                return;
            }
            if self.is_program_running() {
                released = take_joystick_escapes(released, &mut outputs);
            }
            let text = buffers.decode(&released);

            if buffers.read_until.is_none() {
                if !text.is_empty() {
                    outputs.push(ReplOutput::Terminal(text));
                }
            } else {
                if buffers.force_output && !text.is_empty() {
                    let mut shown = strip_raw_markers(&text);
                    // swallow the OK that acknowledges the program upload
                    if buffers.catch_ok && shown.starts_with("OK") {
                        buffers.catch_ok = false;
                        shown.drain(..2);
                    }
                    if !shown.is_empty() {
                        outputs.push(ReplOutput::Terminal(shown));
                    }
                }
                buffers.collected.push_str(&text);
            }
        }

        self.notify.notify_waiters();
        self.emit(outputs);
    }

    /// Collect output until a line containing `pattern` shows up.
    pub fn start_read_until(&self, pattern: &str) {
        let mut buffers = self.buffers();
        buffers.read_until = Some(pattern.to_string());
        buffers.collected.clear();
    }

    pub fn is_reading_until(&self) -> bool {
        self.buffers().read_until.is_some()
    }

    pub fn collected(&self) -> String {
        self.buffers().collected.clone()
    }

    /// Wait for the armed pattern.
    ///
    /// Returns the lines before the match plus `omit_offset` following lines;
    /// anything after that goes back to the terminal. Returns an empty list if
    /// the connection is torn down while waiting.
    ///
    /// A `timeout` too large to represent (such as `Duration::MAX`) waits
    /// without limit.
    pub async fn halt_until_read(&self, omit_offset: usize, timeout: Duration) -> Result<Vec<String>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let deadline = Instant::now().checked_add(timeout);
        let mut omit_waits = 0;

        loop {
            let notified = self.notify.notified();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return Ok(Vec::new());
            }
            if let Some((lines, rest)) = self.match_collected(omit_offset, &mut omit_waits) {
                self.emit(rest);
                return Ok(lines);
            }

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        let pattern = self.buffers().read_until.take();
                        log::debug!("Gave up waiting for {:?} after {:?}", pattern, timeout);
                        return Err(SerialError::Timeout);
                    }
                    (deadline - now).min(POLL_INTERVAL)
                }
                None => POLL_INTERVAL,
            };
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    fn match_collected(
        &self,
        omit_offset: usize,
        omit_waits: &mut u32,
    ) -> Option<(Vec<String>, Vec<ReplOutput>)> {
        let mut buffers = self.buffers();
        let pattern = buffers.read_until.clone().unwrap_or_default();
        // forced output already reached the terminal
        let replay = !buffers.force_output;

        let (lines, rest) = {
            let lines: Vec<&str> = buffers.collected.split(LINE_END).collect();
            let found = lines
                .iter()
                .position(|line| pattern.is_empty() || line.contains(pattern.as_str()) || *line == ">")?;

            if found + omit_offset > lines.len() && *omit_waits < OMIT_WAIT_LIMIT {
                *omit_waits += 1;
                return None;
            }

            let split = (found + omit_offset).min(lines.len());
            let rest: Vec<ReplOutput> = lines[split..]
                .iter()
                .filter(|_| replay)
                .enumerate()
                .map(|(j, line)| {
                    if split + j + 1 < lines.len() {
                        format!("{}{}", line, LINE_END)
                    } else {
                        line.to_string()
                    }
                })
                .filter(|text| !text.is_empty())
                .map(ReplOutput::Terminal)
                .collect();
            let kept: Vec<String> = lines[..split].iter().map(|line| line.to_string()).collect();
            (kept, rest)
        };

        buffers.read_until = None;
        Some((lines, rest))
    }

    /// Give the device a short window to acknowledge with `OK` or `>`.
    pub async fn wait_until_ok(&self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        for _ in 0..OK_WAIT_ATTEMPTS {
            let notified = self.notify.notified();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let acknowledged = self
                .buffers()
                .collected
                .split(LINE_END)
                .any(|line| line == "OK" || line == ">");
            if acknowledged {
                return;
            }
            let _ = tokio::time::timeout(OK_WAIT_INTERVAL, notified).await;
        }
    }

    /// Wake every waiter and disarm the pattern; used when the link goes down.
    pub fn cancel_waiters(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut buffers = self.buffers();
            buffers.read_until = None;
            buffers.esc_pending.clear();
            buffers.utf8_tail.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn set_program_running(&self, running: bool) {
        self.program_running.store(running, Ordering::SeqCst);
        let mut buffers = self.buffers();
        buffers.force_output = running;
        buffers.catch_ok = running;
    }

    pub fn is_program_running(&self) -> bool {
        self.program_running.load(Ordering::SeqCst)
    }
}
