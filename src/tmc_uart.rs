//! Embedded TMC UART sub-protocol frame codec.
//!
//! Stepper driver traffic appears in the log as escaped byte strings inside
//! `tmcuart_send`/`tmcuart_response` lines. On the wire every data byte is
//! expanded to ten bits (a start/stop pair around the byte) and the message
//! carries a trailing CRC-8. Two frame shapes exist:
//! - register read request: sync, address, register + CRC, packed to 5 bytes
//! - register write request: sync, address, register, 32-bit big-endian
//!   value + CRC, packed to 10 bytes
//!
//! Decoding never fails: fields are pulled from fixed bit offsets, the frame
//! is re-encoded from them, and any mismatch (bad CRC, corrupted framing) is
//! rendered as an `Invalid: ` annotation around the best-effort guess.

const READ_FRAME_LEN: usize = 5;
const WRITE_FRAME_LEN: usize = 10;

/// Codec for the fixed UART frame format.
pub struct TmcUartCodec;

impl TmcUartCodec {
    /// CRC-8 with polynomial 0x07, MSB-first register, data bits consumed
    /// LSB-first (the driver's UART convention).
    pub fn crc8(data: &[u8]) -> u8 {
        let mut crc: u8 = 0;
        for &byte in data {
            let mut b = byte;
            for _ in 0..8 {
                if ((crc >> 7) ^ (b & 0x01)) != 0 {
                    crc = (crc << 1) ^ 0x07;
                } else {
                    crc <<= 1;
                }
                b >>= 1;
            }
        }
        crc
    }

    /// Expand each byte to ten bits (start bit low, stop bit high) and slice
    /// the accumulated bit string back into bytes.
    fn add_serial_bits(data: &[u8]) -> Vec<u8> {
        let mut out: u128 = 0;
        let mut pos: u32 = 0;
        for &d in data {
            let b = ((d as u128) << 1) | 0x200;
            out |= b << pos;
            pos += 10;
        }
        let count = ((pos + 7) / 8) as usize;
        (0..count).map(|i| (out >> (8 * i)) as u8).collect()
    }

    /// Frame a register read request.
    pub fn encode_read(sync: u8, addr: u8, reg: u8) -> Vec<u8> {
        let mut msg = vec![sync, addr, reg];
        msg.push(Self::crc8(&msg));
        Self::add_serial_bits(&msg)
    }

    /// Frame a register write request.
    pub fn encode_write(sync: u8, addr: u8, reg: u8, val: u32) -> Vec<u8> {
        let mut msg = vec![sync, addr, reg];
        msg.extend_from_slice(&val.to_be_bytes());
        msg.push(Self::crc8(&msg));
        Self::add_serial_bits(&msg)
    }

    fn decode_read(data: &[u8]) -> String {
        let mut mval: u64 = 0;
        for (i, &d) in data.iter().enumerate() {
            mval |= (d as u64) << (8 * i);
        }
        let addr = ((mval >> 11) & 0xff) as u8;
        let reg = ((mval >> 21) & 0xff) as u8;

        if data != Self::encode_read(0xf5, addr, reg) {
            return format!("Invalid: {}", Self::render(addr, reg, None));
        }
        Self::render(addr, reg, None)
    }

    fn decode_write(data: &[u8]) -> String {
        let mut mval: u128 = 0;
        for (i, &d) in data.iter().enumerate() {
            mval |= (d as u128) << (8 * i);
        }
        let addr = ((mval >> 11) & 0xff) as u8;
        let reg = ((mval >> 21) & 0xff) as u8;
        let val = ((((mval >> 31) & 0xff) << 24)
            | (((mval >> 41) & 0xff) << 16)
            | (((mval >> 51) & 0xff) << 8)
            | ((mval >> 61) & 0xff)) as u32;

        // Write acknowledgements come back addressed to the host.
        let sync = if addr == 0xff { 0x05 } else { 0xf5 };

        if data != Self::encode_write(sync, addr, reg, val) {
            return format!("Invalid: {}", Self::render(addr, reg, Some(val)));
        }
        Self::render(addr, reg, Some(val))
    }

    /// Human-readable field rendering. A register with its high bit set is a
    /// write (rendered with `=`); without it, a read-back (`==`).
    fn render(addr: u8, reg: u8, val: Option<u32>) -> String {
        match val {
            None => format!("({:x}@{:x})", reg, addr),
            Some(v) if reg & 0x80 != 0 => format!("({:x}@{:x}={:08x})", reg & 0x7f, addr, v),
            Some(v) => format!("({:x}@{:x}=={:08x})", reg, addr, v),
        }
    }

    /// Decode a raw frame into its annotation text. Unknown lengths render
    /// as a literal length marker rather than failing.
    pub fn parse_msg(data: &[u8]) -> String {
        match data.len() {
            WRITE_FRAME_LEN => Self::decode_write(data),
            READ_FRAME_LEN => Self::decode_read(data),
            0 => String::new(),
            _ => "(length?)".to_string(),
        }
    }
}
