//! ASCI register and command map

// Register write addresses; the matching read address is one higher.
pub const RX_STATUS: u8 = 0x00; // Non writable
pub const TX_STATUS: u8 = 0x02; // Non writable
pub const RX_INTERRUPT_ENABLE: u8 = 0x04;
pub const TX_INTERRUPT_ENABLE: u8 = 0x06;
pub const RX_INTERRUPT_FLAGS: u8 = 0x08;
pub const TX_INTERRUPT_FLAGS: u8 = 0x0A;
pub const CONFIG_1: u8 = 0x0C;
pub const CONFIG_2: u8 = 0x0E;
pub const CONFIG_3: u8 = 0x10;
pub const FMEA: u8 = 0x12; // Non writable
pub const MODEL: u8 = 0x14; // Non writable
pub const VERSION: u8 = 0x16; // Non writable
pub const RX_BYTE: u8 = 0x18; // Non writable
pub const RX_SPACE: u8 = 0x1A; // Non writable

// Single-byte commands to the ASCI itself.
pub const CMD_CLR_TX_BUF: u8 = 0x20;
pub const CMD_RD_MSG: u8 = 0x91;
pub const CMD_RD_NXT_MSG: u8 = 0x93;
pub const CMD_WR_NXT_LD_Q_L0: u8 = 0xB0;
pub const CMD_WR_LD_Q_L0: u8 = 0xC0;
pub const CMD_RD_LD_Q_L0: u8 = 0xC1;
pub const CMD_CLR_RX_BUF: u8 = 0xE0;

// Commands forwarded down the daisy chain.
pub const CMD_WRITE_ALL: u8 = 0x02;
pub const CMD_READ_ALL: u8 = 0x03;
pub const CMD_HELLO_ALL: u8 = 0x57;

// Device-address encoding for single-BMB access.
pub const DEVICE_WRITE_TAG: u8 = 0b100;
pub const DEVICE_READ_TAG: u8 = 0b101;

// RX_STATUS bits.
pub const RX_STATUS_STOP: u8 = 0x02;
pub const RX_STATUS_EMPTY: u8 = 0x01;
pub const RX_STATUS_BUSY: u8 = 0x20;

// RX interrupt enable/flag bits.
pub const RX_INT_STOP_ERROR_OVERFLOW: u8 = 0x8A;
pub const RX_INT_BUSY_ERROR_OVERFLOW: u8 = 0xA8;
pub const RX_FLAG_BUSY: u8 = 0x20;
pub const RX_FLAG_ERRORS: u8 = 0x88;

// CONFIG_2 modes.
pub const CONFIG_2_TX_PREAMBLES: u8 = 0x30;
pub const CONFIG_2_TX_QUEUE: u8 = 0x10;

// CONFIG_3: keep-alive period of 160 us.
pub const CONFIG_3_KEEP_ALIVE_160US: u8 = 0x05;
