//! Chunked file transfer.
//!
//! Turns file bytes into REPL-safe literal-write command sequences:
//! comment stripping, byte escaping into Python bytes-literal form,
//! windowing that never splits an escape sequence, a free-memory probe
//! after every n-th window for in-band flow control, and a CRC-32
//! integrity check executed on the device.

use crate::repl::classifier::OutputClassifier;
use crate::repl::driver::ReplDriver;
use crate::repl::types::{re, Command, LinkConfig};
use std::sync::Arc;
use std::time::Duration;
use upylink_core::{forward, LinkError, LinkResult};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  CRC-32
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reflected CRC-32 lookup table (polynomial 0xEDB88320).
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// Standard reflected CRC-32, matching the routine run on the device.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for &byte in data {
        let index = ((crc ^ byte as u32) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    crc ^ 0xFFFFFFFF
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Payload preparation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strip inline comments (`#` to end of line).  Assumes no `#` occurs
/// inside string literals; known limitation of the transfer format.
pub fn strip_comments(text: &str) -> String {
    re("#.*").replace_all(text, "").into_owned()
}

fn escape_unit(byte: u8) -> String {
    match byte {
        b'\\' => "\\\\".to_string(),
        b'"' => "\\\"".to_string(),
        b'\r' => "\\r".to_string(),
        b'\n' => "\\n".to_string(),
        b'\t' => "\\t".to_string(),
        0x20..=0x7e => (byte as char).to_string(),
        other => format!("\\x{other:02x}"),
    }
}

/// Escape arbitrary bytes into Python bytes-literal text.  The
/// device-side `b"..."` literal decodes back to the original bytes
/// exactly.
pub fn escape_bytes(data: &[u8]) -> String {
    data.iter().map(|&b| escape_unit(b)).collect()
}

/// Escape and split into windows of at most `window` characters.
/// Windows are computed over the escaped text and never split a
/// multi-character escape sequence.
pub fn escape_windows(data: &[u8], window: usize) -> Vec<String> {
    let mut windows = Vec::new();
    let mut current = String::new();
    for &byte in data {
        let unit = escape_unit(byte);
        if !current.is_empty() && current.len() + unit.len() > window {
            windows.push(std::mem::take(&mut current));
        }
        current.push_str(&unit);
    }
    if !current.is_empty() {
        windows.push(current);
    }
    windows
}

/// Parse the reply of a free-memory probe (`s <free>`).
pub fn parse_free_memory(line: &str) -> Option<u32> {
    let rest = line.strip_prefix("s ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Build the full command sequence of a transfer job: open-for-write,
/// bind the writer, one literal write per window with a memory probe
/// after windows 0, n, 2n, ..., then the confirmed close.
pub fn build_transfer_commands(payload: &[u8], target: &str, config: &LinkConfig) -> Vec<Command> {
    let reply_timeout = config.reply_timeout();
    let bind_delay = Duration::from_millis(5);
    let chunk_reply = re("^[1-9][0-9]*");
    let probe_reply = re("^s [0-9]+");
    let close_reply = re(r"^>>> fd\.close\(\)$");

    let mut commands = vec![
        Command::settle("import gc", bind_delay),
        Command::settle(format!("fd = open(\"{target}\", \"wb\")"), bind_delay),
        Command::settle("f = fd.write", bind_delay),
    ];
    for (index, window) in escape_windows(payload, config.write_window).iter().enumerate() {
        commands.push(Command::expect(
            format!("f(b\"{window}\")"),
            chunk_reply.clone(),
            reply_timeout,
            "timeOut",
        ));
        if index % config.probe_interval == 0 {
            commands.push(Command::expect(
                "print(\"s\",gc.mem_free())",
                probe_reply.clone(),
                reply_timeout,
                "timeOut",
            ));
        }
    }
    commands.push(Command::expect(
        "fd.close()",
        close_reply,
        reply_timeout,
        "timeOut",
    ));
    commands
}

/// Device-side CRC-32 routine, defined once per check.
const REMOTE_CRC_FN: &[&str] = &[
    "def c(data, crc_want, target):",
    " crc = 0xFFFFFFFF",
    " for byte in data:",
    "  crc ^= byte",
    "  for _ in range(8):",
    "   if crc & 1:",
    "    crc = (crc >> 1) ^ 0xEDB88320",
    "   else:",
    "    crc >>= 1",
    " if crc_want == hex(crc ^ 0xFFFFFFFF):",
    "  print(\"crc32\"+target+\"T\")",
    " else:",
    "  print(\"crc32\"+target+\"F\")",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Transfer engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Uploads files through the REPL driver.
pub struct FileTransferEngine {
    driver: Arc<ReplDriver>,
    classifier: Arc<OutputClassifier>,
    config: LinkConfig,
}

impl FileTransferEngine {
    pub fn new(
        driver: Arc<ReplDriver>,
        classifier: Arc<OutputClassifier>,
        config: LinkConfig,
    ) -> Self {
        Self {
            driver,
            classifier,
            config,
        }
    }

    /// Upload `bytes` to `target` on the device.
    ///
    /// Runs a gc preamble, arms the overflow observer, then streams the
    /// windowed literal writes.  A free-memory reading below the
    /// low-water mark aborts the transfer with `MemoryOverflow` instead
    /// of writing into an exhausted heap.  With `soft_reboot` the
    /// sequence ends on the enter-key path so the device starts the
    /// program right after the final close.
    pub async fn put(
        &self,
        bytes: &[u8],
        source_name: &str,
        target: &str,
        soft_reboot: bool,
    ) -> LinkResult<()> {
        self.transfer(bytes, source_name, target, soft_reboot)
            .await
            .map_err(|err| forward(err, |detail| LinkError::FileTransferFailed { detail }))
    }

    async fn transfer(
        &self,
        bytes: &[u8],
        source_name: &str,
        target: &str,
        soft_reboot: bool,
    ) -> LinkResult<()> {
        // Collect garbage first to maximise free memory for the transfer.
        self.driver
            .execute(
                vec![Command::bare("import gc"), Command::bare("gc.collect()")],
                false,
                true,
                None,
            )
            .await?;

        let low_water = self.config.memory_low_water;
        self.classifier.observe_condition(move |line| {
            parse_free_memory(line)
                .map(|free| free < low_water)
                .unwrap_or(false)
        });

        let text = String::from_utf8_lossy(bytes);
        let stripped = strip_comments(&text);
        let commands = build_transfer_commands(stripped.as_bytes(), target, &self.config);
        log::debug!(
            "uploading {} as {target}: {} commands",
            source_name,
            commands.len()
        );
        let message = format!("{source_name} was successfully uploaded.");
        self.driver
            .execute(commands, soft_reboot, false, Some(message))
            .await
    }

    /// Verify the just-written `target` against a host-side CRC-32 over
    /// `data` (the bytes that were transmitted).  The device prints
    /// `crc32<target>T` or `crc32<target>F`.
    pub async fn crc32_check(&self, data: &[u8], target: &str) -> LinkResult<()> {
        let define: Vec<Command> = REMOTE_CRC_FN.iter().map(|line| Command::bare(*line)).collect();
        self.driver.execute(define, false, true, None).await?;

        // Python's hex() prints without zero padding; match it exactly.
        let checksum = format!("0x{:x}", crc32(data));
        let token = re(&format!("^crc32{}[TF]$", regex::escape(target)));
        let run = vec![
            Command::bare(format!("d=open('{target}','rb')")),
            Command::bare("i=d.read()"),
            Command::expect(
                format!("c(i,'{checksum}','{target}')"),
                token,
                self.config.reply_timeout(),
                "timeOut",
            ),
        ];
        self.driver.execute(run, false, false, None).await
    }
}
