use serde::Serialize;
use std::io::{Result, Write};

/// Writes one JSON document per line.
pub(crate) struct JsonLinesWriter<W> {
    wtr: W,
    lines: u64,
}

impl<W> JsonLinesWriter<W>
where
    W: Write,
{
    pub(crate) fn from_writer(wtr: W) -> Self {
        Self { wtr, lines: 0 }
    }

    pub(crate) fn serialize<S: Serialize>(&mut self, value: S) -> Result<()> {
        let buf = serde_json::to_vec(&value)?;
        if buf.contains(&b'\n') {
            return Err(std::io::Error::other("JSON lines cannot have newline"));
        }
        self.wtr.write_all(&buf)?;
        self.wtr.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    /// Number of lines written so far.
    pub(crate) fn lines(&self) -> u64 {
        self.lines
    }

    pub(crate) fn flush(&mut self) -> Result<()> {
        self.wtr.flush()
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.wtr
    }
}
