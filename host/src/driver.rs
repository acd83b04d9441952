//! Transport between the host and an HCI controller.
use bt_hci::data::AclPacketHeader;
use bt_hci::event::EventPacketHeader;
use bt_hci::transport::{Error as TransportError, WithIndicator};
use bt_hci::{FromHciBytes, HostToControllerPacket, PacketKind, ReadHciError, WriteHci};
pub use embedded_io_async::ErrorKind;
use embedded_io_async::{Read, Write};

/// Interface to a driver for a HCI adapter
pub trait HciDriver {
    type Error: embedded_io_async::Error;

    /// Reads an entire HCI packet, without its indicator, into the provided buffer.
    ///
    /// If successful, returns the packet kind and the length of the packet.
    async fn read(&mut self, buf: &mut [u8]) -> Result<(PacketKind, usize), Self::Error>;

    /// Write `packet` as a single HCI packet.
    async fn write<P: HostToControllerPacket>(&mut self, packet: &P) -> Result<(), Self::Error>;
}

/// HCI over a byte stream carrying H4 framed packets, such as a UART.
pub struct SerialDriver<T> {
    io: T,
}

impl<T> SerialDriver<T> {
    pub fn new(io: T) -> Self {
        Self { io }
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T: Read + Write> HciDriver for SerialDriver<T> {
    type Error = TransportError<T::Error>;

    async fn read(&mut self, buf: &mut [u8]) -> Result<(PacketKind, usize), Self::Error> {
        let mut indicator = [0u8; 1];
        self.io.read_exact(&mut indicator).await?;
        let (kind, _) = PacketKind::from_hci_bytes(&indicator).map_err(ReadHciError::<T::Error>::from)?;
        let header_len = match kind {
            PacketKind::AclData => 4,
            PacketKind::Event => 2,
            _ => return Err(TransportError::Read(ReadHciError::InvalidValue)),
        };
        if buf.len() < header_len {
            return Err(TransportError::Read(ReadHciError::BufferTooSmall));
        }
        self.io.read_exact(&mut buf[..header_len]).await?;
        let data_len = match kind {
            PacketKind::AclData => AclPacketHeader::from_hci_bytes(&buf[..header_len]).map(|(h, _)| h.data_len()),
            _ => EventPacketHeader::from_hci_bytes(&buf[..header_len]).map(|(h, _)| usize::from(h.params_len)),
        }
        .map_err(ReadHciError::<T::Error>::from)?;
        let total = header_len + data_len;
        if total > buf.len() {
            return Err(TransportError::Read(ReadHciError::BufferTooSmall));
        }
        self.io.read_exact(&mut buf[header_len..total]).await?;
        Ok((kind, total))
    }

    async fn write<P: HostToControllerPacket>(&mut self, packet: &P) -> Result<(), Self::Error> {
        WithIndicator::new(packet).write_hci_async(&mut self.io).await?;
        self.io.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bt_hci::cmd::link_control::Disconnect;
    use bt_hci::param::{ConnHandle, DisconnectReason};
    use embassy_futures::block_on;
    use embedded_io_async::ReadExactError;

    use super::*;

    struct Wire<'a> {
        rx: &'a [u8],
        tx: std::vec::Vec<u8>,
    }

    impl<'a> Wire<'a> {
        fn new(rx: &'a [u8]) -> Self {
            Self {
                rx,
                tx: std::vec::Vec::new(),
            }
        }
    }

    impl embedded_io_async::ErrorType for Wire<'_> {
        type Error = ErrorKind;
    }

    impl Read for Wire<'_> {
        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
            let n = buf.len().min(self.rx.len());
            buf[..n].copy_from_slice(&self.rx[..n]);
            self.rx = &self.rx[n..];
            Ok(n)
        }
    }

    impl Write for Wire<'_> {
        async fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }
    }

    #[test]
    fn reads_framed_packets() {
        let stream = [
            0x04, 0x13, 0x05, 0x01, 0x40, 0x00, 0x02, 0x00, // completed packets
            0x02, 0x40, 0x20, 0x03, 0x00, 0xaa, 0xbb, 0xcc, // acl
        ];
        let mut driver = SerialDriver::new(Wire::new(&stream[..]));
        let mut buf = [0u8; 32];
        let (kind, len) = unwrap!(block_on(driver.read(&mut buf)));
        assert_eq!(kind, PacketKind::Event);
        assert_eq!(&buf[..len], &stream[1..8]);
        let (kind, len) = unwrap!(block_on(driver.read(&mut buf)));
        assert_eq!(kind, PacketKind::AclData);
        assert_eq!(&buf[..len], &stream[9..]);
        assert!(matches!(
            block_on(driver.read(&mut buf)),
            Err(TransportError::Read(ReadHciError::Read(ReadExactError::UnexpectedEof)))
        ));
    }

    #[test]
    fn rejects_oversized_packets() {
        let stream = [0x02, 0x40, 0x20, 0x10, 0x00];
        let mut driver = SerialDriver::new(Wire::new(&stream[..]));
        let mut buf = [0u8; 8];
        assert!(matches!(
            block_on(driver.read(&mut buf)),
            Err(TransportError::Read(ReadHciError::BufferTooSmall))
        ));
    }

    #[test]
    fn rejects_packets_a_host_never_receives() {
        let mut buf = [0u8; 8];
        for indicator in [0x01, 0x07] {
            let stream = [indicator, 0x00, 0x00];
            let mut driver = SerialDriver::new(Wire::new(&stream[..]));
            assert!(matches!(
                block_on(driver.read(&mut buf)),
                Err(TransportError::Read(ReadHciError::InvalidValue))
            ));
        }
    }

    #[test]
    fn writes_indicator_first() {
        let mut driver = SerialDriver::new(Wire::new(&[]));
        let cmd = Disconnect::new(ConnHandle::new(0x0040), DisconnectReason::RemoteUserTerminatedConn);
        unwrap!(block_on(driver.write(&cmd)));
        assert_eq!(driver.into_inner().tx, [0x01, 0x06, 0x04, 0x03, 0x40, 0x00, 0x13]);
    }
}
