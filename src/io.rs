// Copyright (C) 2019  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Bus transport for the hashing chips: an async UART abstraction with
//! a real serial port implementation, and the reset line GPIO.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{self, Instant};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};

use crate::error::{self, ErrorKind};

/// Baud rate the chips come up with after reset
pub const DEFAULT_BAUD: u32 = 115_200;

/// How a bounded receive ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// The buffer was filled completely
    Full,
    /// The deadline passed with nothing read
    Empty,
    /// The deadline passed mid-frame
    Partial,
}

/// Byte transport towards the chip chain. The chips share one
/// half-duplex bus, so one instance owns the port exclusively.
#[async_trait]
pub trait Uart: Send {
    async fn send(&mut self, bytes: &[u8]) -> error::Result<()>;

    /// Read exactly `buf.len()` bytes, giving up after `timeout`.
    /// A `Partial` outcome means the byte stream is out of sync; the
    /// caller must `clear` before reusing the bus.
    async fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration)
        -> error::Result<RecvStatus>;

    /// Drop anything pending in the receive direction
    fn clear(&mut self) -> error::Result<()>;

    fn set_baud(&mut self, baud: u32) -> error::Result<()>;
}

/// UART backed by a real serial port
pub struct SerialUart {
    port: SerialStream,
}

impl SerialUart {
    pub fn open(path: &str, baud: u32) -> error::Result<Self> {
        let port = tokio_serial::new(path, baud).open_native_async()?;
        Ok(Self { port })
    }
}

#[async_trait]
impl Uart for SerialUart {
    async fn send(&mut self, bytes: &[u8]) -> error::Result<()> {
        self.port.write_all(bytes).await?;
        Ok(())
    }

    async fn recv_exact(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> error::Result<RecvStatus> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let expired = if remaining.is_zero() {
                true
            } else {
                match time::timeout(remaining, self.port.read(&mut buf[filled..])).await {
                    Err(_) => true,
                    Ok(read) => match read? {
                        0 => {
                            return Err(ErrorKind::Serial("port closed".to_string()).into());
                        }
                        n => {
                            filled += n;
                            false
                        }
                    },
                }
            };
            if expired {
                return Ok(if filled == 0 {
                    RecvStatus::Empty
                } else {
                    RecvStatus::Partial
                });
            }
        }
        Ok(RecvStatus::Full)
    }

    fn clear(&mut self) -> error::Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> error::Result<()> {
        self.port.set_baud_rate(baud)?;
        Ok(())
    }
}

/// Chip reset line. Held high in normal operation, pulsed low to
/// power-cycle the chain state.
pub struct ResetPin {
    pin: sysfs_gpio::Pin,
}

impl ResetPin {
    /// Settle time on each edge of the reset pulse
    const RESET_PULSE: Duration = Duration::from_millis(100);

    pub fn open(gpio: u64) -> error::Result<Self> {
        let pin = sysfs_gpio::Pin::new(gpio);
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::High)?;
        Ok(Self { pin })
    }

    pub async fn pulse(&mut self) -> error::Result<()> {
        self.pin.set_value(0)?;
        time::sleep(Self::RESET_PULSE).await;
        self.pin.set_value(1)?;
        time::sleep(Self::RESET_PULSE).await;
        Ok(())
    }
}

#[cfg(test)]
pub mod test_utils {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockState {
        sent: Vec<Vec<u8>>,
        rx: VecDeque<u8>,
        baud: u32,
        cleared: usize,
    }

    /// Scripted UART double: records every frame sent and replays
    /// queued response bytes. Clones share state, so a test can keep
    /// a handle after moving the mock into a driver.
    #[derive(Clone)]
    pub struct MockUart(Arc<Mutex<MockState>>);

    impl MockUart {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(MockState {
                baud: DEFAULT_BAUD,
                ..Default::default()
            })))
        }

        pub fn queue_rx(&self, bytes: &[u8]) {
            self.0.lock().unwrap().rx.extend(bytes.iter().copied());
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.0.lock().unwrap().sent.clone()
        }

        pub fn baud(&self) -> u32 {
            self.0.lock().unwrap().baud
        }

        pub fn cleared(&self) -> usize {
            self.0.lock().unwrap().cleared
        }
    }

    #[async_trait]
    impl Uart for MockUart {
        async fn send(&mut self, bytes: &[u8]) -> error::Result<()> {
            self.0.lock().unwrap().sent.push(bytes.to_vec());
            Ok(())
        }

        async fn recv_exact(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> error::Result<RecvStatus> {
            let mut state = self.0.lock().unwrap();
            if state.rx.is_empty() {
                return Ok(RecvStatus::Empty);
            }
            if state.rx.len() < buf.len() {
                // the scripted bytes end mid-frame; consume them like
                // a serial read racing the deadline would
                state.rx.clear();
                return Ok(RecvStatus::Partial);
            }
            for slot in buf.iter_mut() {
                *slot = state.rx.pop_front().expect("rx underflow");
            }
            Ok(RecvStatus::Full)
        }

        // scripted replies survive a clear so a test can pre-queue the
        // response to a request that follows a flush
        fn clear(&mut self) -> error::Result<()> {
            self.0.lock().unwrap().cleared += 1;
            Ok(())
        }

        fn set_baud(&mut self, baud: u32) -> error::Result<()> {
            self.0.lock().unwrap().baud = baud;
            Ok(())
        }
    }
}
