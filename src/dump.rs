//! Human readable heap reports.
//!
//! Everything here formats straight from the block headers into the given
//! writer. [`print_heap`] goes through a fixed buffer on the stack and writes
//! to the standard error file descriptor directly, so it is safe to call while
//! debugging a heap that is installed as the global allocator.

use std::fmt::{self, Write};

use crate::heap::Heap;

/// Printable report of a [`Heap`], created by [`Heap::dump`].
///
/// ```text
/// ╔══════════ Heap ══════════╗
/// ║ begin:   0x7f3a2c000000 ║
/// ║ end:     0x7f3a2c100000 ║
/// ╟───── 0x7f3a2c000000 ─────╢
/// ║ #                    24 ║
/// ╟───── 0x7f3a2c000028 ─────╢
/// ║                 1048520 ║
/// ╟───── 0x7f3a2c100000 ─────╢
/// ║ total size:     1048576 ║
/// ║ fragmentation:    0.000 ║
/// ╚══════════════════════════╝
/// ```
///
/// `#` marks blocks in use. The alternate form (`{:#}`) prints every block
/// as a box with its back reference instead.
pub struct HeapDump<'a, S> {
    heap: &'a Heap<S>,
}

impl<'a, S> HeapDump<'a, S> {
    pub(crate) fn new(heap: &'a Heap<S>) -> Self {
        Self { heap }
    }

    fn summary(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heap = self.heap;

        writeln!(f, "╔══════════ Heap ══════════╗")?;
        writeln!(f, "║ begin:   {:>14p} ║", heap.begin())?;
        writeln!(f, "║ end:     {:>14p} ║", heap.end())?;

        for block in heap.blocks() {
            writeln!(f, "╟───── {:#x} ─────╢", block.address)?;
            writeln!(
                f,
                "║ {}   {:>19} ║",
                if block.in_use { "#" } else { " " },
                block.size
            )?;
        }

        if !heap.begin().is_null() {
            writeln!(f, "╟───── {:p} ─────╢", heap.end())?;
        }

        writeln!(f, "║ total size:  {:>10} ║", heap.total_size())?;
        writeln!(f, "║ fragmentation: {:>8.3} ║", heap.fragmentation())?;
        writeln!(f, "╚══════════════════════════╝")
    }

    fn blocks(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in self.heap.blocks() {
            writeln!(f, "╭─ {:#018x} ──────────────────╮", block.address)?;
            if let Some(previous) = block.previous {
                writeln!(f, "│ previous:      {:#018x} │", previous)?;
            }
            writeln!(f, "│ size:              {:>14} │", block.size)?;
            writeln!(
                f,
                "│            {:>22} │",
                if block.in_use { "in use" } else { "free" }
            )?;
            writeln!(f, "╰─────────────────────────────────────╯")?;
        }

        Ok(())
    }
}

impl<S> fmt::Display for HeapDump<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            self.blocks(f)
        } else {
            self.summary(f)
        }
    }
}

/// Writes the [`HeapDump`] of `heap` to standard error without allocating.
pub fn print_heap<S>(heap: &Heap<S>) {
    let mut out = StackWriter::new();
    let _ = write!(out, "{}", heap.dump());
    out.flush();
}

/// Like [`print_heap`] with one box per block.
pub fn print_all_blocks<S>(heap: &Heap<S>) {
    let mut out = StackWriter::new();
    let _ = write!(out, "{:#}", heap.dump());
    out.flush();
}

/// Collects formatted text in a fixed buffer and flushes it to standard error
/// whenever it fills up.
struct StackWriter {
    buffer: [u8; 512],
    len: usize,
}

impl StackWriter {
    const fn new() -> Self {
        Self {
            buffer: [0; 512],
            len: 0,
        }
    }

    fn flush(&mut self) {
        write_stderr(&self.buffer[..self.len]);
        self.len = 0;
    }
}

impl Write for StackWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut bytes = s.as_bytes();

        while !bytes.is_empty() {
            if self.len == self.buffer.len() {
                self.flush();
            }

            let n = bytes.len().min(self.buffer.len() - self.len);
            self.buffer[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            self.len += n;
            bytes = &bytes[n..];
        }

        Ok(())
    }
}

#[cfg(unix)]
fn write_stderr(mut bytes: &[u8]) {
    while !bytes.is_empty() {
        let written = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if written <= 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

#[cfg(not(unix))]
fn write_stderr(bytes: &[u8]) {
    use std::io::Write as _;

    // Standard error is unbuffered.
    let _ = std::io::stderr().write_all(bytes);
}
