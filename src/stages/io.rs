//! File I/O and combining stages
//!
//! * `read-file`: fills buffers from `buf_in` with file contents and sends
//!   them out on `data_out`, stopping after the buffer that reaches EOF.
//! * `write-file`: appends every buffer from `data_in` to a file.
//! * `multiwrite-file`: writes every buffer from `data_in` to its own file,
//!   named by substituting a sequence number for `%d` in `filename_fmt`.
//! * `rr-combine`: round-robin over the `data_in` array onto `data_out`.

use super::boxed;
use crate::error::{Error, Result};
use crate::pin::PinDecl;
use crate::stage::{StageDef, StageIo, StageLogic, StageParams, Step};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;

/// Stage types defined here
pub fn definitions() -> Vec<StageDef> {
    vec![
        StageDef::new("read-file", |params| ReadFile::open(params).map(boxed))
            .with_doc("reads a file into buffers from buf_in and conveys them on data_out")
            .with_pins(&[PinDecl::input("buf_in"), PinDecl::output("data_out")])
            .with_params(&["filename"]),
        StageDef::new("write-file", |params| WriteFile::create(params).map(boxed))
            .with_doc("writes every buffer from data_in to a file")
            .with_pins(&[PinDecl::input("data_in"), PinDecl::output("buf_out")])
            .with_params(&["filename"]),
        StageDef::new("multiwrite-file", |params| MultiWrite::new(params).map(boxed))
            .with_doc("writes each buffer accepted into a separate file")
            .with_pins(&[PinDecl::input("data_in"), PinDecl::output("buf_out")])
            .with_params(&["filename_fmt"]),
        StageDef::new("rr-combine", |_| Ok(boxed(Combine)))
            .with_doc("round robin combine")
            .with_pins(&[PinDecl::array_input("data_in"), PinDecl::output("data_out")]),
    ]
}

struct ReadFile {
    path: PathBuf,
    reader: BufReader<File>,
    total: u64,
}

impl ReadFile {
    fn open(params: &StageParams<'_>) -> Result<Self> {
        let path = PathBuf::from(params.require("filename")?);
        let file = File::open(&path).map_err(|e| Error::file(&path, e))?;
        tracing::debug!(stage = params.stage(), path = %path.display(), "opened for reading");
        Ok(Self {
            path,
            reader: BufReader::new(file),
            total: 0,
        })
    }

    fn fill(&mut self, dst: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < dst.len() {
            match self.reader.read(&mut dst[n..]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::file(&self.path, e)),
            }
        }
        Ok(n)
    }
}

impl StageLogic for ReadFile {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let Some(mut buf) = io.input("buf_in")?.accept() else {
            return Ok(Step::Terminate);
        };
        let n = self.fill(buf.as_mut_slice())?;
        buf.set_len(n);
        self.total += n as u64;
        tracing::debug!(bytes = n, total = self.total, "read");
        io.output("data_out")?.convey(buf)?;

        let at_eof = self
            .reader
            .fill_buf()
            .map_err(|e| Error::file(&self.path, e))?
            .is_empty();
        if at_eof {
            tracing::debug!(path = %self.path.display(), "EOF reached");
            return Ok(Step::Terminate);
        }
        Ok(Step::Continue)
    }
}

struct WriteFile {
    path: PathBuf,
    writer: BufWriter<File>,
    total: u64,
}

impl WriteFile {
    fn create(params: &StageParams<'_>) -> Result<Self> {
        let path = PathBuf::from(params.require("filename")?);
        let file = File::create(&path).map_err(|e| Error::file(&path, e))?;
        tracing::debug!(stage = params.stage(), path = %path.display(), "opened for writing");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            total: 0,
        })
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().map_err(|e| Error::file(&self.path, e))
    }
}

impl StageLogic for WriteFile {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let Some(buf) = io.input("data_in")?.accept() else {
            self.flush()?;
            return Ok(Step::Terminate);
        };
        self.writer
            .write_all(buf.filled())
            .map_err(|e| Error::file(&self.path, e))?;
        self.total += buf.len() as u64;
        tracing::debug!(bytes = buf.len(), total = self.total, "wrote");
        io.output("buf_out")?.convey(buf)?;
        Ok(Step::Continue)
    }

    fn fini(&mut self, _io: &StageIo<'_>) -> Result<()> {
        self.flush()
    }
}

struct MultiWrite {
    format: String,
    next: usize,
}

impl MultiWrite {
    fn new(params: &StageParams<'_>) -> Result<Self> {
        let format = params.require("filename_fmt")?;
        if !format.contains("%d") {
            return Err(Error::InvalidParam {
                stage: params.stage().to_string(),
                param: "filename_fmt".to_string(),
                value: format.to_string(),
            });
        }
        Ok(Self {
            format: format.to_string(),
            next: 0,
        })
    }
}

/// Substitute `n` for the first `%d` in `format`
pub fn format_filename(format: &str, n: usize) -> String {
    format.replacen("%d", &n.to_string(), 1)
}

impl StageLogic for MultiWrite {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let Some(buf) = io.input("data_in")?.accept() else {
            return Ok(Step::Terminate);
        };
        let path = format_filename(&self.format, self.next);
        self.next += 1;
        std::fs::write(&path, buf.filled()).map_err(|e| Error::file(&path, e))?;
        tracing::debug!(bytes = buf.len(), path = %path, "wrote run file");
        io.output("buf_out")?.convey(buf)?;
        Ok(Step::Continue)
    }
}

struct Combine;

impl StageLogic for Combine {
    fn step(&mut self, io: &StageIo<'_>) -> Result<Step> {
        let data_in = io.fan_in("data_in")?;
        let data_out = io.output("data_out")?;

        let mut moved = 0;
        for i in 0..data_in.width() {
            if let Some(buf) = data_in.accept(i) {
                data_out.convey(buf)?;
                moved += 1;
            }
        }
        if moved == 0 {
            return Ok(Step::Terminate);
        }
        Ok(Step::Continue)
    }
}
