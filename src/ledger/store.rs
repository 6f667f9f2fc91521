use std::fs::{File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::ledger::block::LedgerBlock;

/// Append-only block file: each record is a u32 big-endian length, the
/// block's canonical JSON, its self_hash in hex, and a trailing newline.
/// The hash trailer allows integrity recovery without parsing the JSON.
pub(crate) struct LedgerFile {
    file: File,
    path: PathBuf,
}

impl LedgerFile {
    pub(crate) fn open(path: &Path) -> anyhow::Result<(Self, Vec<LedgerBlock>)> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create ledger directory {}", parent.display())
                })?;
            }
        }

        let blocks = match File::open(path) {
            Ok(existing) => read_blocks(existing, path)?,
            Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to open ledger {}", path.display()))
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open ledger {} for append", path.display()))?;

        Ok((Self { file, path: path.to_path_buf() }, blocks))
    }

    /// Append one block and fsync before returning.
    pub(crate) fn append(&mut self, block: &LedgerBlock) -> anyhow::Result<()> {
        let body = serde_json::to_vec(block).context("Failed to serialize ledger block")?;
        let len = u32::try_from(body.len()).context("Ledger block record too large")?;

        let mut record = Vec::with_capacity(4 + body.len() + block.self_hash.len() + 1);
        record.extend_from_slice(&len.to_be_bytes());
        record.extend_from_slice(&body);
        record.extend_from_slice(block.self_hash.as_bytes());
        record.push(b'\n');

        self.file
            .write_all(&record)
            .with_context(|| format!("Failed to append to ledger {}", self.path.display()))?;
        self.file
            .sync_all()
            .with_context(|| format!("Failed to fsync ledger {}", self.path.display()))?;
        Ok(())
    }
}

fn read_blocks(file: File, path: &Path) -> anyhow::Result<Vec<LedgerBlock>> {
    let mut reader = BufReader::new(file);
    let mut blocks = Vec::new();

    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read ledger {}", path.display()))
            }
        }

        let len = u32::from_be_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        reader
            .read_exact(&mut body)
            .with_context(|| format!("Truncated record in ledger {}", path.display()))?;

        let block: LedgerBlock = serde_json::from_slice(&body)
            .with_context(|| format!("Corrupt record at index {} in ledger", blocks.len()))?;

        let mut trailer = vec![0u8; block.self_hash.len() + 1];
        reader
            .read_exact(&mut trailer)
            .with_context(|| format!("Truncated hash trailer in ledger {}", path.display()))?;
        let trailer_hash = &trailer[..trailer.len() - 1];
        if trailer_hash != block.self_hash.as_bytes() {
            anyhow::bail!(
                "Hash trailer mismatch at record {} in ledger {}",
                blocks.len(),
                path.display()
            );
        }

        blocks.push(block);
    }

    Ok(blocks)
}
