//! Polled writes to the PS UART. Only the transmit side exists; the
//! runtime never reads from the console.

use core::fmt::Write;

use crate::utils::locks::{SpinLock, spinlock};

const UART_BASE: usize = 0xFF00_0000;
const UART_FIFO: usize = UART_BASE + 0x30;
const UART_CHANNEL_STS: usize = UART_BASE + 0x2C;
const STS_TXFULL: u32 = 1 << 4;

pub struct Serial;

static SERIAL: SpinLock<Serial> = spinlock(Serial);

impl Serial {
    fn put_byte(&mut self, byte: u8) {
        unsafe {
            while core::ptr::read_volatile(UART_CHANNEL_STS as *const u32) & STS_TXFULL != 0 {
                core::hint::spin_loop();
            }
            core::ptr::write_volatile(UART_FIFO as *mut u32, byte as u32);
        }
    }
}

impl Write for Serial {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.put_byte(b'\r');
            }
            self.put_byte(byte);
        }
        Ok(())
    }
}

pub fn _serial(args: core::fmt::Arguments) {
    SERIAL
        .lock()
        .write_fmt(args)
        .expect("failed to write to serial");
}
