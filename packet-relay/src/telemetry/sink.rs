use crate::telemetry::{PublishError, TelemetrySink};
use parking_lot::Mutex;
use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};

/// Sends every record as one UDP datagram, without ever blocking
pub struct UdpSink {
    socket: UdpSocket,
    destination: SocketAddr,
}

impl UdpSink {
    pub fn connect(destination: impl ToSocketAddrs) -> io::Result<Self> {
        let destination = destination.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no address to send telemetry to")
        })?;
        let bind: SocketAddr = if destination.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            destination,
        })
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }
}

impl TelemetrySink for UdpSink {
    fn publish(&self, record: &str) -> Result<(), PublishError> {
        match self.socket.send_to(record.as_bytes(), self.destination) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(PublishError::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }
}

/// Writes records to any writer, e.g. stdout
pub struct WriterSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl WriterSink<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> TelemetrySink for WriterSink<W> {
    fn publish(&self, record: &str) -> Result<(), PublishError> {
        // A contended writer means someone else is publishing; drop instead of waiting
        let mut writer = self.writer.try_lock().ok_or(PublishError::WouldBlock)?;
        writer.write_all(record.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

/// Keeps every record in memory
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<String> {
        self.records.lock().clone()
    }

    /// Records starting with the given measurement name
    pub fn records_for(&self, measurement: &str) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| {
                r.strip_prefix(measurement)
                    .is_some_and(|rest| rest.starts_with('('))
            })
            .cloned()
            .collect()
    }

    /// Makes every later publish fail
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl TelemetrySink for MemorySink {
    fn publish(&self, record: &str) -> Result<(), PublishError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(PublishError::Closed);
        }

        self.records.lock().push(record.to_string());
        Ok(())
    }
}

/// Discards every record
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn publish(&self, _: &str) -> Result<(), PublishError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_memory_sink_filters_by_measurement() {
        let sink = MemorySink::new();
        sink.publish("Latency_stats(ctx-0),hop(0)=1\n").unwrap();
        sink.publish("Forwarder_stats(ctx-0),DELTA_NS=1\n").unwrap();
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.records_for("Latency_stats").len(), 1);

        sink.close();
        assert!(matches!(sink.publish("x(y)\n"), Err(PublishError::Closed)));
    }

    #[test]
    fn test_writer_sink() {
        let sink = WriterSink::new(Vec::new());
        sink.publish("a(b),c=d\n").unwrap();
        sink.publish("e(f)\n").unwrap();
        assert_eq!(&*sink.writer.lock(), b"a(b),c=d\ne(f)\n");
    }

    #[test]
    fn test_udp_sink_delivers_datagrams() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let sink = UdpSink::connect(receiver.local_addr().unwrap()).unwrap();
        sink.publish("Forwarder_stats(ctx-1),DELTA_NS=5\n").unwrap();

        let mut buf = [0; 128];
        let (len, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"Forwarder_stats(ctx-1),DELTA_NS=5\n");
    }
}
