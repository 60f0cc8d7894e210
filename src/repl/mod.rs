//! MicroPython REPL control on top of a [`Connection`].
//!
//! The device speaks the standard MicroPython control protocol: Ctrl-A for
//! raw mode, Ctrl-B for the friendly prompt, Ctrl-C to interrupt and Ctrl-D
//! to execute (raw) or soft reset (friendly).
//!
//! The helpers here expect the caller to hold the connection's control lock
//! (see [`ConnectionCore::lock_control`](crate::connection::ConnectionCore::lock_control)),
//! except for [`get_to_repl`], which takes it itself.

pub mod routines;
pub mod session;

pub use routines::{DeviceRoutines, FsEntry, FsSnapshot, Processor, StorageInfo, VersionInfo};
pub use session::{OutputSink, ReplOutput, ReplSession, ReplSettings};

use std::time::Duration;

use crate::connection::{Connection, Payload};
use crate::device::{DeviceError, Result};
use crate::serial::SerialError;

pub const CTRL_RAW_MODE: &str = "\x01";
pub const CTRL_NORMAL_MODE: &str = "\x02";
pub const CTRL_INTERRUPT: &str = "\x03";
pub const CTRL_SOFT_RESET: &str = "\x04";

pub const RAW_REPL_BANNER: &str = "raw REPL; CTRL-B to exit";
pub const NORMAL_BANNER: &str = "MicroPython";
pub const PROMPT: &str = ">>>";
pub const RAW_PROMPT: &str = ">";

/// Banner lines printed after `MicroPython ...` when entering the friendly
/// prompt; hidden when a routine returns there.
pub const NORMAL_BANNER_LINES: usize = 3;

// a routine restoring the prompt may need several round trips
const CONTROL_WAIT_FACTOR: u32 = 3;

/// Two interrupts, in case the first lands inside a `try` block.
fn interrupt_sequence() -> String {
    format!("\r{}{}", CTRL_INTERRUPT, CTRL_INTERRUPT)
}

async fn send_blocks<C: Connection + ?Sized>(conn: &C, command: &str) -> Result<()> {
    let block_size = conn.core().repl().settings().send_block_size.max(1);
    for block in command.as_bytes().chunks(block_size) {
        conn.write_to_device(Payload::Bytes(block)).await?;
    }
    Ok(())
}

/// Interrupt anything running and switch to raw mode.
pub async fn get_to_raw<C: Connection + ?Sized>(conn: &C) -> Result<()> {
    let repl = conn.core().repl();
    repl.start_read_until(RAW_REPL_BANNER);
    conn.write_to_device(Payload::Text(&interrupt_sequence())).await?;
    conn.write_to_device(Payload::Text(&format!("\r{}", CTRL_RAW_MODE))).await?;
    repl.halt_until_read(2, repl.settings().timeout).await?;
    Ok(())
}

/// Back to the friendly prompt, hiding the raw-mode chatter and the first
/// `omit_offset` lines of the banner.
pub async fn get_to_normal<C: Connection + ?Sized>(conn: &C, omit_offset: usize) -> Result<()> {
    get_to_raw(conn).await?;

    let repl = conn.core().repl();
    repl.start_read_until(NORMAL_BANNER);
    conn.write_to_device(Payload::Text(&format!("\r{}", CTRL_NORMAL_MODE))).await?;
    repl.halt_until_read(omit_offset, repl.settings().timeout).await?;
    Ok(())
}

/// Ensure the device sits at an idle `>>>` prompt.
///
/// If a routine is running a program, the program is interrupted and the
/// routine is given the time to bring the prompt back before this one
/// confirms it.
pub async fn get_to_repl<C: Connection + ?Sized>(conn: &C) -> Result<()> {
    if !conn.is_connected() {
        return Err(DeviceError::NotConnected);
    }

    let repl = conn.core().repl();
    let timeout = repl.settings().timeout;
    let _control = match conn.core().try_lock_control() {
        Some(guard) => guard,
        None => {
            if repl.is_program_running() {
                log::debug!("Interrupting the running program");
                conn.write_to_device(Payload::Text(&interrupt_sequence())).await?;
            }
            tokio::time::timeout(timeout * CONTROL_WAIT_FACTOR, conn.core().lock_control())
                .await
                .map_err(|_| SerialError::Timeout)?
        }
    };
    if !conn.is_connected() {
        return Err(DeviceError::NotConnected);
    }

    repl.start_read_until(PROMPT);
    conn.write_to_device(Payload::Text(&interrupt_sequence())).await?;
    let waited = repl.halt_until_read(0, timeout).await;
    // an empty wake-up or a timeout both mean nothing once the link is gone
    if !conn.is_connected() {
        conn.core().program_finished();
        return Err(DeviceError::NotConnected);
    }
    waited?;
    conn.core().program_finished();
    Ok(())
}

/// Run `command` in raw mode.
///
/// The command is streamed in `send_block_size` pieces and executed with
/// Ctrl-D. With `wait_for_end` the lines printed before `wait_for` are
/// returned (minus `omit_offset` trailing ones being shown to the user).
pub async fn write_utility_cmd_raw<C: Connection + ?Sized>(
    conn: &C,
    command: &str,
    wait_for_end: bool,
    omit_offset: usize,
    wait_for: &str,
) -> Result<Option<Vec<String>>> {
    get_to_raw(conn).await?;
    send_blocks(conn, command).await?;

    if !wait_for_end {
        conn.write_to_device(Payload::Text(CTRL_SOFT_RESET)).await?;
        return Ok(None);
    }

    let repl = conn.core().repl();
    repl.start_read_until(wait_for);
    conn.write_to_device(Payload::Text(CTRL_SOFT_RESET)).await?;
    if wait_for == RAW_PROMPT {
        repl.wait_until_ok().await;
    }
    let lines = repl.halt_until_read(omit_offset, repl.settings().timeout).await?;
    Ok(Some(lines))
}

/// Upload `source` in raw mode and run it as the program `name`.
///
/// Output is forwarded to the terminal while the program runs. Returns once
/// the program ends, is interrupted, or the link goes down; the device is
/// left in raw mode.
pub async fn execute_program<C: Connection + ?Sized>(conn: &C, name: &str, source: &str) -> Result<()> {
    get_to_raw(conn).await?;
    send_blocks(conn, source).await?;

    let core = conn.core();
    if !core.program_started(name) {
        log::debug!("Running {} again", name);
    }
    core.repl().start_read_until(RAW_PROMPT);

    let result = async {
        conn.write_to_device(Payload::Text(CTRL_SOFT_RESET)).await?;
        core.repl().wait_until_ok().await;
        core.repl().halt_until_read(0, Duration::MAX).await?;
        Ok(())
    }
    .await;
    core.program_finished();
    result
}
