use anyhow::Context;
use parking_lot::Mutex;
use pcap_file::pcapng::PcapNgWriter;
use pcap_file::pcapng::blocks::enhanced_packet::EnhancedPacketBlock;
use pcap_file::pcapng::blocks::interface_description::InterfaceDescriptionBlock;
use pcap_file::pcapng::blocks::section_header::SectionHeaderBlock;
use pcap_file::{DataLink, Endianness};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub trait PcapExporterFactory: Send + Sync {
    fn create_pcap_exporter_for_interface(&self, name: &str) -> anyhow::Result<PcapExporter>;
}

pub struct NoOpPcapExporterFactory;
impl PcapExporterFactory for NoOpPcapExporterFactory {
    fn create_pcap_exporter_for_interface(&self, _: &str) -> anyhow::Result<PcapExporter> {
        PcapExporter::noop()
    }
}

pub struct FileBasedPcapExporterFactory {
    dir: PathBuf,
}

impl FileBasedPcapExporterFactory {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }
}

impl PcapExporterFactory for FileBasedPcapExporterFactory {
    fn create_pcap_exporter_for_interface(&self, name: &str) -> anyhow::Result<PcapExporter> {
        // Interface names are usually PCI addresses, which contain characters we'd rather not
        // have in file names
        let file_name: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self.dir.join(format!("{file_name}.pcapng"));
        let pcap_file = fs::File::create(&path)
            .with_context(|| format!("failed to open {} for writing", path.display()))?;
        PcapExporter::new(pcap_file)
    }
}

/// Writes the frames an interface transmits to a pcapng capture
pub struct PcapExporter {
    capture_start: Instant,
    total_tracked_frames: AtomicU64,
    writer: Mutex<PcapNgWriter<BufWriter<Box<dyn Write + Send + Sync + 'static>>>>,
}

impl PcapExporter {
    pub fn new(writer: impl Write + Send + Sync + 'static) -> anyhow::Result<Self> {
        let writer: Box<dyn Write + Send + Sync + 'static> = Box::new(writer);
        let mut writer = PcapNgWriter::with_section_header(
            BufWriter::new(writer),
            SectionHeaderBlock {
                endianness: Endianness::Big,
                major_version: 1,
                minor_version: 0,
                section_length: 0,
                options: vec![],
            },
        )
        .context("failed to write pcapng section header")?;

        writer
            .write_pcapng_block(InterfaceDescriptionBlock {
                linktype: DataLink::ETHERNET,
                snaplen: 65535,
                options: vec![],
            })
            .context("failed to write pcapng interface description")?;

        Ok(Self {
            capture_start: Instant::now(),
            writer: Mutex::new(writer),
            total_tracked_frames: AtomicU64::new(0),
        })
    }

    pub fn noop() -> anyhow::Result<Self> {
        Self::new(std::io::sink())
    }

    pub fn total_tracked_frames(&self) -> u64 {
        self.total_tracked_frames.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> anyhow::Result<()> {
        self.writer
            .lock()
            .get_mut()
            .flush()
            .context("failed to flush pcap writer")
    }

    pub fn track_frame(&self, frame: &[u8]) {
        self.total_tracked_frames.fetch_add(1, Ordering::Relaxed);

        // A capture that can no longer be written to is not worth interrupting the relay for
        let mut writer = self.writer.lock();
        writer
            .write_pcapng_block(EnhancedPacketBlock {
                interface_id: 0,
                timestamp: correct_timestamp(self.capture_start.elapsed()),
                original_len: frame.len() as u32,
                data: frame.to_vec().into(),
                options: Vec::new(),
            })
            .ok();
    }
}

fn correct_timestamp(d: Duration) -> Duration {
    // Round to the nearest microsecond
    let micros = (d.as_secs_f64() * 1_000_000.0).round();

    // Return the time, three orders of magnitude smaller (the library multiplies the timestamp
    // by 1000 when writing it with the default interface resolution)
    Duration::from_secs_f64(micros / 1_000_000_000.0)
}
