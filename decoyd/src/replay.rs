#![forbid(unsafe_code)]

use crate::router::{Output, Router};
use anyhow::{Context, Result, bail};
use bytes::Bytes;
use std::io::{BufRead, Write};
use std::time::{Duration, Instant};
use utils::{bytes_to_hex, hex_to_bytes};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub packets: usize,
    pub chunks: usize,
    pub ticks: usize,
    pub network_out: usize,
    pub control_out: usize,
}

/// Drive `router` from a text trace.
///
/// Each input line is `net <hex>` (a packet), `ctl <hex>` (control-channel
/// bytes) or `tick <secs>` (advance the clock and run timers). Blank lines
/// and `#` comments are skipped. Outputs are written as `net <hex>` and
/// `ctl <hex>` lines.
pub fn replay<R: BufRead, W: Write>(
    router: &mut Router,
    input: R,
    output: &mut W,
    start: Instant,
) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary::default();
    let mut now = start;
    for (idx, line) in input.lines().enumerate() {
        let lineno = idx + 1;
        let line = line.with_context(|| format!("read trace line {lineno}"))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (kind, arg) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let outputs = match kind {
            "net" => {
                summary.packets += 1;
                router.on_packet(parse_hex(arg, lineno)?)
            }
            "ctl" => {
                summary.chunks += 1;
                router.on_control_chunk(parse_hex(arg, lineno)?)
            }
            "tick" => {
                let secs: u64 = arg
                    .trim()
                    .parse()
                    .with_context(|| format!("line {lineno}: invalid tick seconds"))?;
                summary.ticks += 1;
                now += Duration::from_secs(secs);
                router.on_tick(now)
            }
            other => bail!("line {lineno}: unknown trace entry {other:?}"),
        };
        for out in outputs {
            match out {
                Output::Network(packet) => {
                    summary.network_out += 1;
                    writeln!(output, "net {}", bytes_to_hex(&packet))?;
                }
                Output::Control(message) => {
                    summary.control_out += 1;
                    writeln!(output, "ctl {}", bytes_to_hex(&message.to_bytes()))?;
                }
            }
        }
    }
    Ok(summary)
}

fn parse_hex(arg: &str, lineno: usize) -> Result<Bytes> {
    let bytes = hex_to_bytes(arg)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("line {lineno}: bad hex"))?;
    Ok(Bytes::from(bytes))
}
