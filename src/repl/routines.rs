//! Device routines run through the raw REPL: battery, version, filesystem
//! listing and program execution.
//!
//! Every routine takes the connection's control lock for its whole run and
//! returns the device to the friendly prompt afterwards. A routine started
//! while another one holds the REPL fails with [`DeviceError::Busy`].

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::{
    execute_program, get_to_normal, write_utility_cmd_raw, NORMAL_BANNER_LINES, RAW_PROMPT,
};
use crate::connection::Connection;
use crate::device::{DeviceError, Result};

const RESET_TERMINAL_CMD: &str = "import os\nos.dupterm(None)\n";

const CLEAR_IS_RUNNING_CMD: &str = r#"import sys
FILE_PATH = '/lib/ble/isrunning'
try:
   with open(FILE_PATH, 'r+b') as file:
      file.write(b'\x00')
except Exception as err:
    print('Some kind of error clearing is running..' + err)
"#;

const VERSION_CMD: &str = r#"import os
import sys
import machine
print(sys.implementation[1])
print(sys.implementation[2])
try:
    f = open("/lib/XRPLib/version.py", "r")
    while True:
        line = f.readline()
        if len(line) == 0:
            print("ERROR EOF")
            break
        if "__version__ = " in line:
            print(line.split('\'')[1])
            break
except:
    print("ERROR EX")
print(''.join(['{:02x}'.format(b) for b in machine.unique_id()]))
"#;

// Prints `parent,index,F|D,name;` entries in walk order, `parent` being the
// full path below the root, then the statvfs sizes.
const FS_TREE_CMD: &str = r#"import os
import gc
outstr = ''
gc.collect()
def walk(top):
    global outstr
    extend = ''
    if top != '':
        extend = '/'
    item_index = 0
    for dirent in os.listdir(top):
        mode = os.stat(top + extend + dirent)[0]
        if mode == 32768:
            outstr = outstr + top + ',' + str(item_index) + ',F,' + dirent + ';'
            item_index = item_index + 1
        elif mode == 16384:
            outstr = outstr + top + ',' + str(item_index) + ',D,' + dirent + ';'
            item_index = item_index + 1
            walk(top + extend + dirent)
walk('')
print(outstr)
a = os.statvfs('/')
print(a[0], a[2], a[3])
"#;

/// ADC counts per volt: the 16-bit reading spans roughly 14 V after the
/// board's divider.
const BATTERY_COUNTS_PER_VOLT: f64 = 65536.0 / 14.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Processor {
    Rp2040,
    Rp2350,
}

impl Processor {
    /// Recognize the chip from `sys.implementation._machine`.
    pub fn detect(machine: &str) -> Option<Self> {
        if machine.contains("RP2350") {
            Some(Processor::Rp2350)
        } else if machine.contains("RP2040") {
            Some(Processor::Rp2040)
        } else {
            None
        }
    }

    /// GPIO wired to the battery voltage divider.
    pub fn battery_pin(self) -> u8 {
        match self {
            Processor::Rp2040 => 28,
            Processor::Rp2350 => 46,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub micropython: String,
    pub machine: String,
    /// `None` when XRPLib is missing or has no version marker.
    pub xrplib: Option<String>,
    pub unique_id: String,
    pub processor: Option<Processor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FsEntry {
    File { name: String },
    Dir { name: String, children: Vec<FsEntry> },
}

impl FsEntry {
    pub fn name(&self) -> &str {
        match self {
            FsEntry::File { name } | FsEntry::Dir { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    pub block_size: u64,
    pub total_blocks: u64,
    pub free_blocks: u64,
}

impl StorageInfo {
    pub fn total_bytes(&self) -> u64 {
        self.block_size * self.total_blocks
    }

    pub fn free_bytes(&self) -> u64 {
        self.block_size * self.free_blocks
    }

    fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(|part| part.parse::<u64>());
        Some(Self {
            block_size: parts.next()?.ok()?,
            total_blocks: parts.next()?.ok()?,
            free_blocks: parts.next()?.ok()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsSnapshot {
    pub root: Vec<FsEntry>,
    pub storage: Option<StorageInfo>,
}

/// Output of a raw command starts right after the `OK` acknowledgement.
fn strip_ok(line: &str) -> &str {
    line.strip_prefix("OK").unwrap_or(line)
}

fn response_line<'a>(lines: &'a [String], index: usize, what: &str) -> Result<&'a str> {
    lines
        .get(index)
        .map(|line| line.trim_end())
        .ok_or_else(|| DeviceError::Protocol(format!("missing {} in device response", what)))
}

/// Rebuild the tree from the `parent,index,kind,name;` listing.
///
/// Entries come in walk order, so a directory's children directly follow
/// it and are recognized by naming its full path as their parent.
pub fn parse_fs_listing(listing: &str) -> Vec<FsEntry> {
    let entries: Vec<(&str, &str, &str)> = listing
        .split(';')
        .filter_map(|entry| {
            let mut fields = entry.splitn(4, ',');
            let parent = fields.next()?;
            let _index = fields.next()?;
            let kind = fields.next()?;
            let name = fields.next()?;
            Some((parent, kind, name))
        })
        .collect();

    fn children(entries: &[(&str, &str, &str)], pos: &mut usize, dir: &str) -> Vec<FsEntry> {
        let mut out = Vec::new();
        while let Some(&(parent, kind, name)) = entries.get(*pos) {
            if parent != dir {
                break;
            }
            *pos += 1;
            if kind == "D" {
                let path = if dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", dir, name)
                };
                let nested = children(entries, pos, &path);
                out.push(FsEntry::Dir {
                    name: name.to_string(),
                    children: nested,
                });
            } else {
                out.push(FsEntry::File { name: name.to_string() });
            }
        }
        out
    }

    let mut pos = 0;
    let root = children(&entries, &mut pos, "");
    if pos < entries.len() {
        log::warn!("Ignored {} out-of-order filesystem entries", entries.len() - pos);
    }
    root
}

/// Routines that query or drive the XRP through its REPL.
#[derive(Default)]
pub struct DeviceRoutines {
    processor: Mutex<Option<Processor>>,
}

impl DeviceRoutines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chip detected by the last [`version_info`](Self::version_info).
    pub fn processor(&self) -> Option<Processor> {
        *self.processor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Forget the detected chip; a different board may be attached next.
    pub fn reset(&self) {
        *self.processor.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Run a utility command and return its hidden output lines, then go
    /// back to the friendly prompt.
    async fn utility<C: Connection + ?Sized>(conn: &C, command: &str) -> Result<Vec<String>> {
        if !conn.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let _control = conn.core().try_lock_control().ok_or(DeviceError::Busy)?;

        let lines = write_utility_cmd_raw(conn, command, true, 1, RAW_PROMPT).await;
        let restored = get_to_normal(conn, NORMAL_BANNER_LINES).await;
        let lines = lines?.unwrap_or_default();
        restored?;
        Ok(lines)
    }

    /// Detach the REPL from any other terminal (BLE) so the cable owns it.
    pub async fn reset_terminal<C: Connection + ?Sized>(&self, conn: &C) -> Result<()> {
        Self::utility(conn, RESET_TERMINAL_CMD).await.map(|_| ())
    }

    /// Clear the flag XRPLib keeps while a program runs on its own.
    pub async fn clear_is_running<C: Connection + ?Sized>(&self, conn: &C) -> Result<()> {
        Self::utility(conn, CLEAR_IS_RUNNING_CMD).await.map(|_| ())
    }

    /// Battery voltage in volts.
    pub async fn battery_voltage<C: Connection + ?Sized>(&self, conn: &C) -> Result<f64> {
        let pin = self.processor().unwrap_or(Processor::Rp2040).battery_pin();
        let command = format!("from machine import ADC, Pin\nprint(ADC(Pin({})).read_u16())\n", pin);

        let lines = Self::utility(conn, &command).await?;
        let reading = strip_ok(response_line(&lines, 0, "ADC reading")?);
        let counts: u32 = reading
            .trim()
            .parse()
            .map_err(|_| DeviceError::Protocol(format!("invalid ADC reading {:?}", reading)))?;
        Ok(f64::from(counts) / BATTERY_COUNTS_PER_VOLT)
    }

    /// Firmware, library and board identity. Also detects the processor.
    pub async fn version_info<C: Connection + ?Sized>(&self, conn: &C) -> Result<VersionInfo> {
        let lines = Self::utility(conn, VERSION_CMD).await?;

        let micropython = strip_ok(response_line(&lines, 0, "MicroPython version")?).to_string();
        if micropython.starts_with("ERROR") {
            return Err(DeviceError::Protocol("device could not report its version".into()));
        }
        let machine = response_line(&lines, 1, "machine")?.to_string();
        let xrplib = response_line(&lines, 2, "XRPLib version")?;
        let unique_id = response_line(&lines, 3, "unique id")?.to_string();

        let processor = Processor::detect(&machine);
        if processor.is_some() {
            let mut known = self.processor.lock().unwrap_or_else(PoisonError::into_inner);
            if known.is_none() {
                log::info!("Detected {:?} processor", processor);
                *known = processor;
            }
        }

        Ok(VersionInfo {
            micropython,
            machine,
            xrplib: (!xrplib.starts_with("ERROR")).then(|| xrplib.to_string()),
            unique_id,
            processor,
        })
    }

    /// Tree of the device's filesystem and its free space.
    pub async fn fs_tree<C: Connection + ?Sized>(&self, conn: &C) -> Result<FsSnapshot> {
        let lines = Self::utility(conn, FS_TREE_CMD).await?;

        let listing = strip_ok(response_line(&lines, 0, "filesystem listing")?);
        let storage = lines.get(1).and_then(|line| StorageInfo::parse(line));
        if storage.is_none() {
            log::debug!("Device did not report storage sizes");
        }
        Ok(FsSnapshot {
            root: parse_fs_listing(listing),
            storage,
        })
    }

    /// Upload and run `source` as `name`, returning when it ends or is
    /// stopped with [`get_to_repl`](super::get_to_repl). Output reaches the
    /// data callback while it runs.
    pub async fn run_program<C: Connection + ?Sized>(&self, conn: &C, name: &str, source: &str) -> Result<()> {
        if !conn.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let _control = conn.core().try_lock_control().ok_or(DeviceError::Busy)?;
        log::info!("Running {} ({} bytes)", name, source.len());

        let result = execute_program(conn, name, source).await;
        if conn.is_connected() {
            get_to_normal(conn, NORMAL_BANNER_LINES).await?;
        }
        log::info!("{} finished", name);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> FsEntry {
        FsEntry::File { name: name.into() }
    }

    #[test]
    fn listing_rebuilds_nested_directories() {
        let listing =
            ",0,F,main.py;,1,D,lib;lib,0,D,XRPLib;lib/XRPLib,0,F,version.py;lib,1,F,ble.py;,2,F,boot.py;";
        let root = parse_fs_listing(listing);

        assert_eq!(
            root,
            vec![
                file("main.py"),
                FsEntry::Dir {
                    name: "lib".into(),
                    children: vec![
                        FsEntry::Dir {
                            name: "XRPLib".into(),
                            children: vec![file("version.py")],
                        },
                        file("ble.py"),
                    ],
                },
                file("boot.py"),
            ]
        );
    }

    #[test]
    fn directory_named_like_its_ancestor_keeps_its_own_children() {
        // a/b/a is empty; c.py belongs to the outer a
        let listing = ",0,D,a;a,0,D,b;a/b,0,D,a;a,1,F,c.py;";
        let root = parse_fs_listing(listing);

        assert_eq!(
            root,
            vec![FsEntry::Dir {
                name: "a".into(),
                children: vec![
                    FsEntry::Dir {
                        name: "b".into(),
                        children: vec![FsEntry::Dir {
                            name: "a".into(),
                            children: vec![],
                        }],
                    },
                    file("c.py"),
                ],
            }]
        );
    }

    #[test]
    fn empty_listing_is_an_empty_tree() {
        assert!(parse_fs_listing("").is_empty());
    }

    #[test]
    fn storage_line_is_parsed() {
        let storage = StorageInfo::parse("4096 352 200").unwrap();
        assert_eq!(storage.total_bytes(), 4096 * 352);
        assert_eq!(storage.free_bytes(), 4096 * 200);
        assert!(StorageInfo::parse("4096 x").is_none());
    }

    #[test]
    fn processor_is_detected_from_machine_string() {
        assert_eq!(
            Processor::detect("Raspberry Pi Pico W with RP2040"),
            Some(Processor::Rp2040)
        );
        assert_eq!(Processor::detect("XRP with RP2350"), Some(Processor::Rp2350));
        assert_eq!(Processor::detect("ESP32"), None);
        assert_eq!(Processor::Rp2350.battery_pin(), 46);
    }

    #[test]
    fn fs_entries_serialize_with_a_type_tag() {
        let json = serde_json::to_value(file("main.py")).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["name"], "main.py");
    }
}
