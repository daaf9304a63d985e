//! Rendering of a finished traversal.
//!
//! One line per completed record, in creation order: a 10-wide right-aligned
//! binary IEC size, two spaces, and the path (directories get a trailing
//! separator). Errored records are skipped on stdout; instead a
//! `"<path>: <error-name>"` line goes to the error stream. A broken pipe on
//! the output stream silently ends printing for the current root.

use std::io::{self, Write};

use humansize::{format_size, FormatSizeOptions, BINARY};

use crate::record::NodeState;
use crate::traversal::Traversal;

fn size_options() -> FormatSizeOptions {
    FormatSizeOptions::from(BINARY).decimal_places(1)
}

/// Formats a byte count the way the size column expects it.
pub fn human_size(bytes: u64) -> String {
    format_size(bytes, size_options())
}

/// Prints every record of a finished traversal.
pub fn print_records<W: Write, E: Write>(
    traversal: &Traversal,
    out: &mut W,
    err: &mut E,
) -> io::Result<()> {
    debug_assert!(traversal.progress().is_finished());

    for index in 0..traversal.len() {
        let node = traversal.node(index);
        let is_dir = match node.state() {
            NodeState::CompletedDirectory => true,
            NodeState::CompletedFile => false,
            NodeState::Errored(kind) => {
                err.write_all(node.path().as_bytes())?;
                writeln!(err, ": {kind}")?;
                continue;
            }
            state @ (NodeState::IncompleteDirectory(_) | NodeState::IncompleteFile) => {
                unreachable!("non-terminal record {index} after traversal end: {state:?}")
            }
        };

        let line = write_line(out, node.size(), node.path().as_bytes(), is_dir);
        match line {
            Ok(()) => {}
            Err(ref error) if error.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
            Err(error) => return Err(error),
        }
    }
    out.flush()
}

fn write_line<W: Write>(out: &mut W, size: u64, path: &[u8], is_dir: bool) -> io::Result<()> {
    write!(out, "{:>10}  ", human_size(size))?;
    out.write_all(path)?;
    if is_dir {
        out.write_all(b"/")?;
    }
    out.write_all(b"\n")
}
