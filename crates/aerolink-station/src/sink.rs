//! Video output sinks.
//!
//! The pipeline forwards recovered data packets in order; the station
//! writes them as a raw byte stream to a file or stdout, or drops them in
//! monitor mode.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use aerolink_transport::receiver::{NullSink, VideoSink};

/// Writes every forwarded packet payload back to back.
///
/// A failing writer does not stop the pipeline; errors are counted and
/// logged on the first occurrence and every thousandth after.
pub struct WriterSink {
    label: String,
    out: BufWriter<Box<dyn Write + Send>>,
    packets: u64,
    bytes: u64,
    errors: u64,
}

impl WriterSink {
    pub fn new(label: &str, out: Box<dyn Write + Send>) -> Self {
        WriterSink {
            label: label.to_string(),
            out: BufWriter::new(out),
            packets: 0,
            bytes: 0,
            errors: 0,
        }
    }

    pub fn create_file(path: &Path) -> anyhow::Result<Self> {
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        tracing::info!(path = %path.display(), "output: writing video to file");
        Ok(Self::new(&path.display().to_string(), Box::new(file)))
    }

    pub fn stdout() -> Self {
        tracing::info!("output: writing video to stdout");
        Self::new("stdout", Box::new(std::io::stdout()))
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn errors(&self) -> u64 {
        self.errors
    }

    pub fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::warn!(output = %self.label, error = %e, "output flush failed");
        }
    }
}

impl VideoSink for WriterSink {
    fn forward(&mut self, _block_index: u32, _packet_index: u8, data: &[u8]) {
        match self.out.write_all(data) {
            Ok(()) => {
                self.packets += 1;
                self.bytes += data.len() as u64;
            }
            Err(e) => {
                if self.errors % 1000 == 0 {
                    tracing::warn!(
                        output = %self.label,
                        error = %e,
                        errors = self.errors + 1,
                        "output write failed"
                    );
                }
                self.errors += 1;
            }
        }
    }
}

impl Drop for WriterSink {
    fn drop(&mut self) {
        self.flush();
    }
}

/// Sink chosen at startup.
pub enum OutputSink {
    /// Monitor mode: recovered video is dropped.
    Null(NullSink),
    Writer(WriterSink),
}

impl OutputSink {
    pub fn null() -> Self {
        tracing::info!("output: monitor mode (set --output to capture)");
        OutputSink::Null(NullSink)
    }

    /// `-` means stdout.
    pub fn open(target: &str) -> anyhow::Result<Self> {
        if target == "-" {
            return Ok(OutputSink::Writer(WriterSink::stdout()));
        }
        Ok(OutputSink::Writer(WriterSink::create_file(Path::new(target))?))
    }

    pub fn flush(&mut self) {
        if let OutputSink::Writer(w) = self {
            w.flush();
        }
    }
}

impl VideoSink for OutputSink {
    fn forward(&mut self, block_index: u32, packet_index: u8, data: &[u8]) {
        match self {
            OutputSink::Null(n) => n.forward(block_index, packet_index, data),
            OutputSink::Writer(w) => w.forward(block_index, packet_index, data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("disk gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::other("disk gone"))
        }
    }

    #[test]
    fn forwards_payloads_in_order() {
        let buf = Shared::default();
        let mut sink = WriterSink::new("mem", Box::new(buf.clone()));
        sink.forward(1, 0, b"abc");
        sink.forward(1, 1, b"de");
        sink.flush();
        assert_eq!(buf.0.lock().unwrap().as_slice(), b"abcde");
        assert_eq!(sink.packets(), 2);
        assert_eq!(sink.bytes(), 5);
    }

    #[test]
    fn write_errors_are_counted_not_fatal() {
        let mut sink = WriterSink::new("broken", Box::new(Broken));
        // Bypass the buffer with payloads larger than its capacity.
        let big = vec![0u8; 16 * 1024];
        sink.forward(0, 0, &big);
        sink.forward(0, 1, &big);
        assert_eq!(sink.errors(), 2);
        assert_eq!(sink.packets(), 0);
    }

    #[test]
    fn file_sink_writes_to_disk() {
        let path = std::env::temp_dir().join(format!("aerolink-sink-{}.bin", std::process::id()));
        {
            let mut sink = WriterSink::create_file(&path).unwrap();
            sink.forward(0, 0, b"video");
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"video");
        let _ = std::fs::remove_file(&path);
    }
}
