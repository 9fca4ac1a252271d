use crate::backup::result_error::result::Result;
use age::stream::StreamWriter;
use flate2::write::{GzEncoder, ZlibEncoder};
use std::fs::File;
use std::io::{BufWriter, Error, IntoInnerError, Write};

pub trait Finish<O> {
    fn finish(self) -> std::result::Result<O, Error>;
}

impl<W: Write> Finish<W> for StreamWriter<W> {
    fn finish(self) -> std::result::Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for GzEncoder<W> {
    fn finish(self) -> std::result::Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for ZlibEncoder<W> {
    fn finish(self) -> std::result::Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for zstd::stream::write::Encoder<'static, W> {
    fn finish(self) -> std::result::Result<W, Error> {
        self.finish()
    }
}

impl<W: Write> Finish<W> for BufWriter<W> {
    fn finish(self) -> std::result::Result<W, Error> {
        self.into_inner().map_err(IntoInnerError::into_error)
    }
}

pub type LayerWriter = Box<dyn StackWriter>;

/// One layer of a writer stack.
pub trait StackWriter: Write + Send {
    /// Flushes and finalizes this layer, handing back the layer it wraps.
    /// Returns `None` once the file at the bottom of the stack is closed.
    fn finish_layer(self: Box<Self>) -> std::io::Result<Option<LayerWriter>>;
}

/// A stage that wraps the current top of a writer stack.
pub trait Transform: Send + Sync {
    fn wrap(&self, inner: LayerWriter) -> Result<LayerWriter>;
}

/// Bottom of every stack: the destination file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn new(file: File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StackWriter for FileSink {
    fn finish_layer(self: Box<Self>) -> std::io::Result<Option<LayerWriter>> {
        let file = self.writer.finish()?;
        file.sync_all()?;
        Ok(None)
    }
}

/// A file sink wrapped by zero or more transform layers. Layers are finished
/// in the reverse order of wrapping.
pub struct WriterStack {
    top: LayerWriter,
    depth: usize,
}

impl WriterStack {
    /// Wraps `sink` with each transform in turn; `transforms[0]` ends up
    /// closest to the file, the last transform receives the raw bytes.
    pub fn build(sink: LayerWriter, transforms: &[&dyn Transform]) -> Result<Self> {
        let mut top = sink;
        for transform in transforms {
            top = transform.wrap(top)?;
        }
        Ok(Self {
            top,
            depth: transforms.len(),
        })
    }

    /// Number of transform layers above the sink.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Finishes every layer from the outermost down to the file.
    ///
    /// Stops at the first failing layer and returns its error; the layers
    /// beneath it are dropped, which still releases the file descriptor.
    pub fn close(self) -> std::io::Result<()> {
        let mut current = Some(self.top);
        while let Some(layer) = current {
            current = layer.finish_layer()?;
        }
        Ok(())
    }
}

impl Write for WriterStack {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.top.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.top.flush()
    }
}
