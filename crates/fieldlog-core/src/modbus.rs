//! Minimal Modbus RTU client.
//!
//! Only function 0x03 (read holding registers) is implemented, which is all
//! the supported sensors need. Frames are:
//!
//! ```text
//! request:   unit | 0x03 | addr_hi addr_lo | count_hi count_lo | crc_lo crc_hi
//! response:  unit | 0x03 | byte_count | data... | crc_lo crc_hi
//! exception: unit | 0x83 | code | crc_lo crc_hi
//! ```
//!
//! The transport is any tokio byte stream, normally a serial port opened in
//! raw 8N1 mode. RTU frames carry no transaction id, so before every request
//! the client discards whatever is waiting on the line, and after a framing
//! error it drains the rest of the bad frame. One stray byte costs one read.

use std::path::Path;
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, trace};

use crate::error::{SensorError, SensorResult};

/// Read holding registers.
pub const READ_HOLDING_REGISTERS: u8 = 0x03;

/// Flag set on the function code of an exception response.
const EXCEPTION_FLAG: u8 = 0x80;

/// Largest register count a single request may ask for.
pub const MAX_REGISTERS: u16 = 125;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Line speed of the supported anemometer.
pub const DEFAULT_BAUD_RATE: u32 = 4800;

/// Shortest inter-frame gap, used from 19200 baud up.
const MIN_FRAME_GAP: Duration = Duration::from_micros(1750);

/// Silence that ends an RTU frame: 3.5 character times of 11 bits.
///
/// ```
/// use std::time::Duration;
/// use fieldlog_core::modbus::frame_gap;
///
/// assert_eq!(frame_gap(4800), Duration::from_micros(8020));
/// assert_eq!(frame_gap(115_200), Duration::from_micros(1750));
/// ```
pub fn frame_gap(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return MIN_FRAME_GAP;
    }
    Duration::from_micros(38_500_000 / u64::from(baud_rate)).max(MIN_FRAME_GAP)
}

/// CRC-16/MODBUS of `data`.
///
/// ```
/// use fieldlog_core::modbus::crc16;
///
/// assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Encode a read-holding-registers request frame.
pub fn encode_read_request(unit: u8, address: u16, count: u16) -> BytesMut {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(unit);
    frame.put_u8(READ_HOLDING_REGISTERS);
    frame.put_u16(address);
    frame.put_u16(count);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Modbus RTU master over a byte stream.
#[derive(Debug)]
pub struct ModbusRtu<T> {
    transport: T,
    timeout: Duration,
    frame_gap: Duration,
}

impl ModbusRtu<SerialStream> {
    /// Open a serial port in raw 8N1 mode at `baud_rate`.
    pub fn open<P: AsRef<Path>>(device: P, baud_rate: u32, timeout: Duration) -> SensorResult<Self> {
        let port = tokio_serial::new(device.as_ref().to_string_lossy(), baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open_native_async()
            .map_err(std::io::Error::from)?;
        Ok(Self::new(port, timeout).with_frame_gap(frame_gap(baud_rate)))
    }
}

impl<T> ModbusRtu<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a transport. `timeout` bounds each request/response exchange.
    ///
    /// The inter-frame gap defaults to the one of [`DEFAULT_BAUD_RATE`].
    pub fn new(transport: T, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            frame_gap: frame_gap(DEFAULT_BAUD_RATE),
        }
    }

    /// Set the line silence that marks the end of a frame.
    #[must_use]
    pub fn with_frame_gap(mut self, gap: Duration) -> Self {
        self.frame_gap = gap;
        self
    }

    /// Read `count` holding registers starting at `address`.
    pub async fn read_holding_registers(
        &mut self,
        unit: u8,
        address: u16,
        count: u16,
    ) -> SensorResult<Vec<u16>> {
        if count == 0 || count > MAX_REGISTERS {
            return Err(SensorError::invalid_frame(format!(
                "register count {} outside 1..={}",
                count, MAX_REGISTERS
            )));
        }

        let duration = self.timeout;
        let result = tokio::time::timeout(duration, self.exchange(unit, address, count))
            .await
            .map_err(|_| SensorError::timeout("read_holding_registers", duration))
            .and_then(|r| r);

        if let Err(SensorError::InvalidFrame(_)) = &result {
            // Bounded so a babbling line cannot hold the tick.
            if tokio::time::timeout(duration, self.discard_pending()).await.is_err() {
                debug!("modbus line still busy after {:?}", duration);
            }
        }
        result
    }

    /// Read and drop bytes until the line has been silent for one frame gap.
    ///
    /// Returns the number of bytes dropped.
    async fn discard_pending(&mut self) -> SensorResult<usize> {
        let mut scratch = [0u8; 64];
        let mut discarded = 0;
        loop {
            match tokio::time::timeout(self.frame_gap, self.transport.read(&mut scratch)).await {
                Err(_) | Ok(Ok(0)) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
        if discarded > 0 {
            debug!("modbus dropped {} stale byte(s)", discarded);
        }
        Ok(discarded)
    }

    async fn exchange(&mut self, unit: u8, address: u16, count: u16) -> SensorResult<Vec<u16>> {
        self.discard_pending().await?;

        let request = encode_read_request(unit, address, count);
        trace!("modbus tx {:02X?}", &request[..]);
        self.transport.write_all(&request).await?;
        self.transport.flush().await?;

        let mut header = [0u8; 3];
        self.transport.read_exact(&mut header).await?;
        let [resp_unit, function, third] = header;

        if resp_unit != unit {
            return Err(SensorError::invalid_frame(format!(
                "response from unit {} to request for unit {}",
                resp_unit, unit
            )));
        }

        if function == READ_HOLDING_REGISTERS | EXCEPTION_FLAG {
            let mut crc = [0u8; 2];
            self.transport.read_exact(&mut crc).await?;
            check_crc(&header, crc)?;
            return Err(SensorError::Exception {
                function: READ_HOLDING_REGISTERS,
                code: third,
            });
        }
        if function != READ_HOLDING_REGISTERS {
            return Err(SensorError::invalid_frame(format!(
                "unexpected function code 0x{:02X}",
                function
            )));
        }

        let byte_count = usize::from(third);
        if byte_count != usize::from(count) * 2 {
            return Err(SensorError::invalid_frame(format!(
                "expected {} data bytes, device announced {}",
                usize::from(count) * 2,
                byte_count
            )));
        }

        let mut rest = vec![0u8; byte_count + 2];
        self.transport.read_exact(&mut rest).await?;
        trace!("modbus rx {:02X?} {:02X?}", header, rest);

        let (data, crc) = rest.split_at(byte_count);
        let mut frame = Vec::with_capacity(3 + byte_count);
        frame.extend_from_slice(&header);
        frame.extend_from_slice(data);
        check_crc(&frame, [crc[0], crc[1]])?;

        let mut data = data;
        let mut registers = Vec::with_capacity(usize::from(count));
        while data.has_remaining() {
            registers.push(data.get_u16());
        }
        Ok(registers)
    }

    /// Shut the transport down.
    pub async fn close(&mut self) -> SensorResult<()> {
        self.transport.shutdown().await?;
        Ok(())
    }
}

fn check_crc(frame: &[u8], received: [u8; 2]) -> SensorResult<()> {
    let expected = crc16(frame);
    let received = u16::from_le_bytes(received);
    if expected != received {
        return Err(SensorError::invalid_frame(format!(
            "CRC mismatch: computed 0x{:04X}, received 0x{:04X}",
            expected, received
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    /// Build a register response frame the way a slave would.
    pub(crate) fn response_frame(unit: u8, registers: &[u16]) -> Vec<u8> {
        let mut frame = BytesMut::new();
        frame.put_u8(unit);
        frame.put_u8(READ_HOLDING_REGISTERS);
        frame.put_u8((registers.len() * 2) as u8);
        for reg in registers {
            frame.put_u16(*reg);
        }
        let crc = crc16(&frame);
        frame.put_u16_le(crc);
        frame.to_vec()
    }

    /// Answer one request on `slave` with `reply`, returning the request bytes.
    pub(crate) async fn serve_once(slave: &mut DuplexStream, reply: &[u8]) -> Vec<u8> {
        let mut request = [0u8; 8];
        slave.read_exact(&mut request).await.unwrap();
        slave.write_all(reply).await.unwrap();
        request.to_vec()
    }

    #[test]
    fn test_crc_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x02]), 0x0BC4);
    }

    #[test]
    fn test_encode_request() {
        let frame = encode_read_request(1, 0, 2);
        assert_eq!(&frame[..], &[0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
    }

    #[tokio::test]
    async fn test_read_registers() {
        let (master, mut slave) = duplex(64);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));

        let server = tokio::spawn(async move {
            serve_once(&mut slave, &response_frame(1, &[325, 270])).await
        });

        let registers = client.read_holding_registers(1, 0, 2).await.unwrap();
        assert_eq!(registers, vec![325, 270]);

        let request = server.await.unwrap();
        assert_eq!(request, encode_read_request(1, 0, 2).to_vec());
    }

    #[tokio::test]
    async fn test_exception_response() {
        let (master, mut slave) = duplex(64);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));

        let mut reply = vec![0x01, 0x83, 0x02];
        let crc = crc16(&reply);
        reply.extend_from_slice(&crc.to_le_bytes());
        tokio::spawn(async move { serve_once(&mut slave, &reply).await });

        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(matches!(
            err,
            SensorError::Exception {
                function: 0x03,
                code: 0x02
            }
        ));
    }

    #[tokio::test]
    async fn test_crc_mismatch() {
        let (master, mut slave) = duplex(64);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));

        let mut reply = response_frame(1, &[1, 2]);
        let last = reply.len() - 1;
        reply[last] ^= 0xFF;
        tokio::spawn(async move { serve_once(&mut slave, &reply).await });

        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[tokio::test]
    async fn test_wrong_unit() {
        let (master, mut slave) = duplex(64);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));

        tokio::spawn(async move { serve_once(&mut slave, &response_frame(7, &[1, 2])).await });

        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(matches!(err, SensorError::InvalidFrame(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_times_out() {
        let (master, _slave) = duplex(64);
        let mut client = ModbusRtu::new(master, Duration::from_millis(500));

        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(matches!(err, SensorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_noise_byte_costs_one_read() {
        let (master, mut slave) = duplex(256);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));

        tokio::spawn(async move {
            let mut reply = vec![0x00];
            reply.extend(response_frame(1, &[325, 270]));
            serve_once(&mut slave, &reply).await;
            for i in 0..10 {
                serve_once(&mut slave, &response_frame(1, &[i, 180])).await;
            }
        });

        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(matches!(err, SensorError::InvalidFrame(_)));
        for i in 0..10 {
            let registers = client.read_holding_registers(1, 0, 2).await.unwrap();
            assert_eq!(registers, vec![i, 180]);
        }
    }

    #[tokio::test]
    async fn test_unsolicited_bytes_discarded_before_request() {
        let (master, mut slave) = duplex(256);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));

        tokio::spawn(async move {
            slave.write_all(&response_frame(9, &[1, 1])).await.unwrap();
            serve_once(&mut slave, &response_frame(1, &[412, 185])).await
        });

        let registers = client.read_holding_registers(1, 0, 2).await.unwrap();
        assert_eq!(registers, vec![412, 185]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_timeout() {
        let (master, mut slave) = duplex(256);
        let mut client = ModbusRtu::new(master, Duration::from_millis(300));

        tokio::spawn(async move {
            let mut ignored = [0u8; 8];
            slave.read_exact(&mut ignored).await.unwrap();
            for i in 0..5 {
                serve_once(&mut slave, &response_frame(1, &[i, 90])).await;
            }
        });

        let err = client.read_holding_registers(1, 0, 2).await.unwrap_err();
        assert!(matches!(err, SensorError::Timeout { .. }));
        for i in 0..5 {
            let registers = client.read_holding_registers(1, 0, 2).await.unwrap();
            assert_eq!(registers, vec![i, 90]);
        }
    }

    #[tokio::test]
    async fn test_register_count_bounds() {
        let (master, _slave) = duplex(64);
        let mut client = ModbusRtu::new(master, Duration::from_secs(1));
        assert!(client.read_holding_registers(1, 0, 0).await.is_err());
        assert!(client.read_holding_registers(1, 0, 126).await.is_err());
    }
}
