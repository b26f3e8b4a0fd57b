#![cfg_attr(not(test), no_std)]

//! Driver for the MAX17841 SPI-to-UART bridge (ASCI) in front of a BMB
//! daisy chain.
//!
//! The bridge buffers framed commands in a load queue, clocks them down the
//! isolated UART link, and raises its interrupt line once the chain's reply
//! has landed in the receive queue. Every queue load is read back and
//! verified before transmission, every reply is checked against its CRC and
//! alive counter, and terminal failures feed the comms health bucket.

use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::spi::SpiDevice;

use bms_core::bucket::LeakyBucket;

pub mod crc;
pub mod ll;

/// Read and write attempts used to verify data integrity.
pub const NUM_DATA_CHECKS: usize = 3;

/// Bounded wait for the ASCI interrupt after triggering a transmission.
const INTERRUPT_TIMEOUT: Duration = Duration::from_millis(10);

pub const BYTES_PER_BMB_REGISTER: usize = 2;

// BMB command frame sizes, excluding the ASCI queue prefix.
const WRITE_FRAME_LEN: usize = 6; // cmd, reg, lsb, msb, crc, alive
const READ_FRAME_LEN: usize = 5; // cmd, reg, data check, crc, alive
const HELLO_FRAME_LEN: usize = 3; // cmd, reg, initialization address

// Scratch sizing for the largest reply we ever pull out of the RX queue.
const RX_SCRATCH: usize = 64;

/// Largest chain the receive scratch can hold replies for.
pub const MAX_CHAIN_DEVICES: usize = (RX_SCRATCH - 1 - READ_FRAME_LEN) / BYTES_PER_BMB_REGISTER;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    Spi(E),
    /// The ASCI interrupt did not arrive inside the timeout window.
    Timeout,
    /// The interrupt line itself failed.
    Interrupt,
    /// The ASCI flagged an RX error, or stop was never reached.
    Rx,
    /// A register or load-queue readback did not match what was written.
    Verify,
    /// Reply CRC mismatch.
    Crc,
    /// The alive counter did not match the expected device count.
    AliveCounter,
}

fn write_frame(cmd: u8, reg: u8, value: u16) -> [u8; WRITE_FRAME_LEN] {
    let mut frame = [cmd, reg, value as u8, (value >> 8) as u8, 0, 0];
    frame[4] = crc::calculate(&frame[..4]);
    // frame[5] is the alive counter seed, incremented by each BMB
    frame
}

fn read_frame(cmd: u8, reg: u8) -> [u8; READ_FRAME_LEN] {
    let mut frame = [cmd, reg, 0x00, 0, 0];
    frame[3] = crc::calculate(&frame[..3]);
    frame
}

fn device_address(bmb_index: usize, tag: u8) -> u8 {
    ((bmb_index as u8) << 3) | tag
}

// A write echoes back down the chain unchanged except for the alive counter,
// which every device increments.
fn check_write_reply<E>(sent: &[u8], reply: &[u8], expected_alive: u8) -> Result<(), Error<E>> {
    if reply[..WRITE_FRAME_LEN - 1] != sent[..WRITE_FRAME_LEN - 1] {
        return Err(Error::Verify);
    }
    if reply[WRITE_FRAME_LEN - 1] != expected_alive {
        return Err(Error::AliveCounter);
    }
    Ok(())
}

// Reply layout: [cmd, reg, data check, data x 2n, crc, alive]. The CRC
// covers everything before itself.
fn parse_read_reply<E>(reply: &[u8], out: &mut [u16]) -> Result<(), Error<E>> {
    let n = out.len();
    let crc_index = 3 + BYTES_PER_BMB_REGISTER * n;

    if crc::calculate(&reply[..crc_index]) != reply[crc_index] {
        return Err(Error::Crc);
    }
    if reply[crc_index + 1] != n as u8 {
        return Err(Error::AliveCounter);
    }

    for (i, word) in out.iter_mut().enumerate() {
        *word = u16::from_le_bytes([reply[3 + 2 * i], reply[4 + 2 * i]]);
    }
    Ok(())
}

/// The line driver, the interrupt line, and the comms health bucket.
pub struct Max17841<SPI, INT, SHDN> {
    spi: SPI,
    int: INT,
    shdn: SHDN,
    bucket: LeakyBucket,
}

impl<SPI, INT, SHDN> Max17841<SPI, INT, SHDN>
where
    SPI: SpiDevice,
    INT: Wait,
    SHDN: OutputPin,
{
    pub fn new(spi: SPI, int: INT, shdn: SHDN) -> Self {
        Self {
            spi,
            int,
            shdn,
            // Trips near a 1:10 sustained failure-to-success ratio.
            bucket: LeakyBucket::new(200, 100, 1, 10),
        }
    }

    /// Sustained-failure latch of the comms health bucket.
    pub fn link_filled(&self) -> bool {
        self.bucket.filled()
    }

    pub fn bucket(&self) -> &LeakyBucket {
        &self.bucket
    }

    pub fn enable(&mut self) {
        self.shdn.set_high().unwrap();
    }

    pub fn disable(&mut self) {
        self.shdn.set_low().unwrap();
    }

    /// Power cycle the line driver.
    pub async fn reset(&mut self) {
        self.disable();
        Timer::after(Duration::from_millis(10)).await;
        self.enable();
    }

    async fn command(&mut self, cmd: u8) -> Result<(), Error<SPI::Error>> {
        self.spi.write(&[cmd]).await.map_err(Error::Spi)
    }

    async fn read_register(&mut self, reg: u8) -> Result<u8, Error<SPI::Error>> {
        // The read address is one above the write address.
        let tx = [reg + 1, 0];
        let mut rx = [0; 2];
        self.spi.transfer(&mut rx, &tx).await.map_err(Error::Spi)?;
        Ok(rx[1])
    }

    async fn write_register(&mut self, reg: u8, value: u8) -> Result<(), Error<SPI::Error>> {
        self.spi.write(&[reg, value]).await.map_err(Error::Spi)
    }

    async fn write_and_verify_register(
        &mut self,
        reg: u8,
        value: u8,
    ) -> Result<(), Error<SPI::Error>> {
        for _ in 0..NUM_DATA_CHECKS {
            self.write_register(reg, value).await?;
            if self.read_register(reg).await? == value {
                return Ok(());
            }
        }
        log::warn!("failed to write and verify ASCI register {:#04x}", reg);
        Err(Error::Verify)
    }

    async fn clear_rx_interrupt_flags(&mut self) -> Result<(), Error<SPI::Error>> {
        for _ in 0..NUM_DATA_CHECKS {
            self.write_register(ll::RX_INTERRUPT_FLAGS, 0x00).await?;
            let flags = self.read_register(ll::RX_INTERRUPT_FLAGS).await?;
            if flags & !0x40 == 0x00 {
                return Ok(());
            }
        }
        log::warn!("failed to clear ASCI RX interrupt flags");
        Err(Error::Verify)
    }

    async fn clear_rx_busy_flag(&mut self) -> Result<(), Error<SPI::Error>> {
        for _ in 0..NUM_DATA_CHECKS {
            self.write_register(ll::RX_INTERRUPT_FLAGS, !ll::RX_FLAG_BUSY)
                .await?;
            let flags = self.read_register(ll::RX_INTERRUPT_FLAGS).await?;
            if flags & ll::RX_FLAG_BUSY == 0x00 {
                return Ok(());
            }
        }
        log::warn!("failed to clear ASCI RX busy flag");
        Err(Error::Verify)
    }

    async fn rx_errors_exist(&mut self) -> Result<bool, Error<SPI::Error>> {
        let flags = self.read_register(ll::RX_INTERRUPT_FLAGS).await?;
        Ok(flags & ll::RX_FLAG_ERRORS != 0)
    }

    // Load the TX queue and read it back until the contents verify.
    async fn load_and_verify_tx_queue(&mut self, data: &[u8]) -> Result<(), Error<SPI::Error>> {
        let mut tx = [0; 16];
        let mut rx = [0; 16];

        for _ in 0..NUM_DATA_CHECKS {
            self.spi.write(data).await.map_err(Error::Spi)?;

            tx[..data.len()].fill(0);
            // The queue read-back address is one above the load address.
            tx[0] = data[0] + 1;
            self.spi
                .transfer(&mut rx[..data.len()], &tx[..data.len()])
                .await
                .map_err(Error::Spi)?;

            if rx[1..data.len()] == data[1..] {
                return Ok(());
            }
        }
        log::warn!("failed to load and verify ASCI TX queue");
        Err(Error::Verify)
    }

    // Pull the next message out of the RX queue into `reply`.
    async fn read_next_message(&mut self, reply: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        let mut tx = [0; RX_SCRATCH];
        let mut rx = [0; RX_SCRATCH];
        let len = reply.len() + 1;

        tx[0] = ll::CMD_RD_NXT_MSG;
        self.spi
            .transfer(&mut rx[..len], &tx[..len])
            .await
            .map_err(Error::Spi)?;

        // The first byte clocked back is the command echo.
        reply.copy_from_slice(&rx[1..len]);
        Ok(())
    }

    // One full chain transaction: load the queue, trigger transmission, wait
    // for RX stop, and read the reply back.
    async fn transact(&mut self, request: &[u8], reply: &mut [u8]) -> Result<(), Error<SPI::Error>> {
        self.command(ll::CMD_CLR_RX_BUF).await?;
        self.command(ll::CMD_CLR_TX_BUF).await?;

        self.load_and_verify_tx_queue(request).await?;

        self.write_and_verify_register(ll::RX_INTERRUPT_ENABLE, ll::RX_INT_STOP_ERROR_OVERFLOW)
            .await?;
        self.clear_rx_interrupt_flags().await?;

        self.command(ll::CMD_WR_NXT_LD_Q_L0).await?;

        match with_timeout(INTERRUPT_TIMEOUT, self.int.wait_for_low()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Interrupt),
            Err(_) => {
                log::debug!("ASCI interrupt timed out during transaction");
                return Err(Error::Timeout);
            }
        }

        // The interrupt must have been RX stop, not an error condition.
        if self.read_register(ll::RX_STATUS).await? & ll::RX_STATUS_STOP == 0 {
            return Err(Error::Rx);
        }

        self.read_next_message(reply).await?;

        if self.rx_errors_exist().await? {
            return Err(Error::Rx);
        }

        Ok(())
    }

    /// Bring the ASCI out of shutdown and into TX-queue mode.
    pub async fn init(&mut self) -> Result<(), Error<SPI::Error>> {
        self.reset().await;

        // Dummy transaction to shake the interface awake after power-up.
        self.read_register(ll::CONFIG_3).await?;

        self.write_and_verify_register(ll::CONFIG_3, ll::CONFIG_3_KEEP_ALIVE_160US)
            .await?;
        self.write_and_verify_register(ll::RX_INTERRUPT_ENABLE, ll::RX_INT_BUSY_ERROR_OVERFLOW)
            .await?;

        self.command(ll::CMD_CLR_RX_BUF).await?;

        // Preamble mode makes the chain's receivers lock on; the ASCI
        // signals readiness through RX busy.
        self.write_and_verify_register(ll::CONFIG_2, ll::CONFIG_2_TX_PREAMBLES)
            .await?;

        match with_timeout(INTERRUPT_TIMEOUT, self.int.wait_for_low()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(Error::Interrupt),
            Err(_) => {
                log::warn!("no interrupt while enabling TX preambles");
                return Err(Error::Timeout);
            }
        }

        let flags = self.read_register(ll::RX_INTERRUPT_FLAGS).await?;
        if flags & ll::RX_FLAG_BUSY == 0 {
            return Err(Error::Verify);
        }
        self.clear_rx_busy_flag().await?;

        if self.read_register(ll::RX_STATUS).await? != (ll::RX_STATUS_BUSY | ll::RX_STATUS_EMPTY) {
            return Err(Error::Verify);
        }

        self.write_and_verify_register(ll::RX_INTERRUPT_ENABLE, ll::RX_INT_STOP_ERROR_OVERFLOW)
            .await?;
        self.write_and_verify_register(ll::CONFIG_2, ll::CONFIG_2_TX_QUEUE)
            .await?;

        if self.read_register(ll::RX_STATUS).await? & ll::RX_STATUS_EMPTY == 0 {
            return Err(Error::Verify);
        }

        self.command(ll::CMD_CLR_TX_BUF).await?;
        self.command(ll::CMD_CLR_RX_BUF).await?;

        Ok(())
    }

    /// Enumerate the daisy chain; returns the number of responding BMBs.
    pub async fn hello_all(&mut self) -> Result<u8, Error<SPI::Error>> {
        let request = [
            ll::CMD_WR_LD_Q_L0,
            HELLO_FRAME_LEN as u8,
            ll::CMD_HELLO_ALL,
            0x00, // register address
            0x00, // initialization address
        ];
        let mut reply = [0; HELLO_FRAME_LEN];

        match self.transact(&request, &mut reply).await {
            Ok(()) => {
                self.bucket.success();
                // Each device increments the address byte as the frame
                // passes; the final value is the chain length.
                Ok(reply[HELLO_FRAME_LEN - 1])
            }
            Err(e) => {
                log::warn!("hello_all failed");
                self.bucket.failure();
                Err(e)
            }
        }
    }

    async fn write_frame_verified(
        &mut self,
        frame: [u8; WRITE_FRAME_LEN],
        expected_alive: u8,
    ) -> Result<(), Error<SPI::Error>> {
        let mut request = [0; 2 + WRITE_FRAME_LEN];
        request[0] = ll::CMD_WR_LD_Q_L0;
        request[1] = WRITE_FRAME_LEN as u8;
        request[2..].copy_from_slice(&frame);

        let mut reply = [0; WRITE_FRAME_LEN];

        let mut last = Error::Verify;
        for _ in 0..NUM_DATA_CHECKS {
            match self.transact(&request, &mut reply).await {
                Ok(()) => match check_write_reply(&frame, &reply, expected_alive) {
                    Ok(()) => {
                        self.bucket.success();
                        return Ok(());
                    }
                    Err(e) => last = e,
                },
                Err(e) => last = e,
            }
        }
        self.bucket.failure();
        Err(last)
    }

    /// Broadcast a register write to every BMB in the chain.
    pub async fn write_all(
        &mut self,
        reg: u8,
        value: u16,
        expected_count: u8,
    ) -> Result<(), Error<SPI::Error>> {
        let frame = write_frame(ll::CMD_WRITE_ALL, reg, value);
        self.write_frame_verified(frame, expected_count)
            .await
            .inspect_err(|_| log::warn!("write_all {:#04x} failed", reg))
    }

    /// Write a register on a single BMB.
    pub async fn write_device(
        &mut self,
        bmb_index: usize,
        reg: u8,
        value: u16,
    ) -> Result<(), Error<SPI::Error>> {
        let frame = write_frame(device_address(bmb_index, ll::DEVICE_WRITE_TAG), reg, value);
        self.write_frame_verified(frame, 1)
            .await
            .inspect_err(|_| log::warn!("write_device {} {:#04x} failed", bmb_index, reg))
    }

    async fn read_frame_verified(
        &mut self,
        frame: [u8; READ_FRAME_LEN],
        out: &mut [u16],
    ) -> Result<(), Error<SPI::Error>> {
        let reply_len = READ_FRAME_LEN + BYTES_PER_BMB_REGISTER * out.len();

        let mut request = [0; 2 + READ_FRAME_LEN];
        request[0] = ll::CMD_WR_LD_Q_L0;
        request[1] = reply_len as u8;
        request[2..].copy_from_slice(&frame);

        let mut reply = [0; RX_SCRATCH];
        let reply = &mut reply[..reply_len];

        let mut last = Error::Verify;
        for _ in 0..NUM_DATA_CHECKS {
            match self.transact(&request, reply).await {
                Ok(()) => match parse_read_reply(reply, out) {
                    Ok(()) => {
                        self.bucket.success();
                        return Ok(());
                    }
                    Err(e) => last = e,
                },
                Err(e) => last = e,
            }
        }
        self.bucket.failure();
        Err(last)
    }

    /// Read one register from every BMB; `out` holds one word per device.
    pub async fn read_all(&mut self, reg: u8, out: &mut [u16]) -> Result<(), Error<SPI::Error>> {
        let frame = read_frame(ll::CMD_READ_ALL, reg);
        self.read_frame_verified(frame, out)
            .await
            .inspect_err(|_| log::warn!("read_all {:#04x} failed", reg))
    }

    /// Read one register from a single BMB.
    pub async fn read_device(
        &mut self,
        bmb_index: usize,
        reg: u8,
    ) -> Result<u16, Error<SPI::Error>> {
        let frame = read_frame(device_address(bmb_index, ll::DEVICE_READ_TAG), reg);
        let mut out = [0; 1];
        self.read_frame_verified(frame, &mut out)
            .await
            .inspect_err(|_| log::warn!("read_device {} {:#04x} failed", bmb_index, reg))?;
        Ok(out[0])
    }
}
