//! `manifest.csv`: one appended row per finished slice.
//!
//! The first write creates the file with a header row. Rows use CRLF line
//! endings and RFC 4180 quoting, since the detail column is JSON.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

pub const MANIFEST_FILE: &str = "manifest.csv";

/// A manifest row, in one of the two layouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestRow {
    /// Full record written when piece commitments are computed.
    Commitment {
        payload_cid: String,
        filename: String,
        piece_cid: String,
        payload_size: u64,
        piece_size: u64,
        detail: String,
    },
    /// Light record without commitment.
    Light {
        payload_cid: String,
        filename: String,
        detail: String,
    },
}

impl ManifestRow {
    fn header(&self) -> &'static [&'static str] {
        match self {
            ManifestRow::Commitment { .. } => &[
                "payload_cid",
                "filename",
                "piece_cid",
                "payload_size",
                "piece_size",
                "detail",
            ],
            ManifestRow::Light { .. } => &["payload_cid", "filename", "detail"],
        }
    }

    fn fields(&self) -> Vec<String> {
        match self {
            ManifestRow::Commitment {
                payload_cid,
                filename,
                piece_cid,
                payload_size,
                piece_size,
                detail,
            } => vec![
                payload_cid.clone(),
                filename.clone(),
                piece_cid.clone(),
                payload_size.to_string(),
                piece_size.to_string(),
                detail.clone(),
            ],
            ManifestRow::Light {
                payload_cid,
                filename,
                detail,
            } => vec![payload_cid.clone(), filename.clone(), detail.clone()],
        }
    }
}

fn quote(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn encode_line<S: AsRef<str>>(fields: &[S]) -> String {
    let mut line = fields
        .iter()
        .map(|f| quote(f.as_ref()))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str("\r\n");
    line
}

/// Appends rows to `<dir>/manifest.csv`.
///
/// Appends from several threads through one writer never interleave.
#[derive(Debug)]
pub struct ManifestWriter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ManifestWriter {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(MANIFEST_FILE),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &ManifestRow) -> io::Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        let is_create = match fs::metadata(&self.path) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e),
        };

        let mut record = String::new();
        if is_create {
            record.push_str(&encode_line(row.header()));
        }
        record.push_str(&encode_line(row.fields().as_slice()));

        let mut file = OpenOptions::new().append(true).create(true).open(&self.path)?;
        file.write_all(record.as_bytes())?;
        file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn light(cid: &str) -> ManifestRow {
        ManifestRow::Light {
            payload_cid: cid.to_string(),
            filename: "graph-total-1-part-0".to_string(),
            detail: "[]".to_string(),
        }
    }

    #[test]
    fn test_header_written_once() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let writer = ManifestWriter::in_dir(temp_dir.path());

        writer.append(&light("aa"))?;
        writer.append(&light("bb"))?;

        let contents = fs::read_to_string(writer.path())?;
        assert_eq!(
            contents,
            "payload_cid,filename,detail\r\naa,graph-total-1-part-0,[]\r\nbb,graph-total-1-part-0,[]\r\n"
        );
        Ok(())
    }

    #[test]
    fn test_commitment_row_quotes_json_detail() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let writer = ManifestWriter::in_dir(temp_dir.path());

        writer.append(&ManifestRow::Commitment {
            payload_cid: "cid".to_string(),
            filename: "slice".to_string(),
            piece_cid: "piece".to_string(),
            payload_size: 10,
            piece_size: 128,
            detail: r#"[{"start":0,"size":10}]"#.to_string(),
        })?;

        let contents = fs::read_to_string(writer.path())?;
        let mut lines = contents.split("\r\n");
        assert_eq!(
            lines.next(),
            Some("payload_cid,filename,piece_cid,payload_size,piece_size,detail")
        );
        assert_eq!(
            lines.next(),
            Some(r#"cid,slice,piece,10,128,"[{""start"":0,""size"":10}]""#)
        );
        Ok(())
    }

    #[test]
    fn test_concurrent_appends_keep_rows_whole() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let writer = std::sync::Arc::new(ManifestWriter::in_dir(temp_dir.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let writer = writer.clone();
                std::thread::spawn(move || writer.append(&light(&format!("cid{i}"))))
            })
            .collect();
        for handle in handles {
            handle.join().expect("append thread panicked")?;
        }

        let contents = fs::read_to_string(writer.path())?;
        let lines: Vec<&str> = contents.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 9);
        assert_eq!(lines[0], "payload_cid,filename,detail");
        assert_eq!(lines.iter().filter(|l| l.starts_with("cid")).count(), 8);
        Ok(())
    }
}
