//! The module containing the serial (UART) debug channel.
//!
//! Every failure path in the crate reports one line through the [`log`]
//! facade, which this module renders onto COM1. The byte sink sits
//! behind the [`SerialPort`] trait, the same seam pattern the rest of
//! the crate uses for hardware, so the rendering path is exercised by
//! tests against a capture buffer while the real build transmits through
//! the IO port pair.

use crate::config::LOGGING_LEVEL;
use core::{fmt, fmt::Write};
use spin::Mutex;

/// Installs the microkernel's debug channel.
///
/// # Panics
///
/// Panics if a logger is already installed.
pub fn init_uart_logger() {
    log::set_logger(&UART_LOGGER)
        .map(|()| log::set_max_level(LOGGING_LEVEL))
        .unwrap();
}

/// One outgoing byte sink.
trait SerialPort {
    /// Pushes one byte out, blocking until the sink accepts it.
    fn transmit(&mut self, byte: u8);
}

const COM1_IO_PORT_BASE: u16 = 0x3f8;
const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0;
const UART_OFFSET_LINE_STATUS: u16 = 5;

/// The first serial port, addressed through its legacy IO ports.
struct Com1;

impl SerialPort for Com1 {
    fn transmit(&mut self, byte: u8) {
        // Spin until the transmitter holding buffer drains.
        while (inb(COM1_IO_PORT_BASE + UART_OFFSET_LINE_STATUS) & 0x20) == 0 {}
        outb(COM1_IO_PORT_BASE + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER, byte);
    }
}

/// Reads 8-bits from an IO port.
fn inb(port: u16) -> u8 {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::inb(port) }
}

/// Writes 8-bits to an IO port.
fn outb(port: u16, val: u8) {
    // Safety: this project runs at CPL0.
    unsafe { x86::io::outb(port, val) };
}

struct Uart<T> {
    port: T,
}

impl<T: SerialPort> Write for Uart<T> {
    // Writes bytes `string` to the serial port.
    fn write_str(&mut self, string: &str) -> Result<(), fmt::Error> {
        for byte in string.bytes() {
            self.port.transmit(byte);
        }
        Ok(())
    }
}

struct UartLogger<T> {
    uart: Mutex<Uart<T>>,
}

impl<T: SerialPort> UartLogger<T> {
    const fn new(port: T) -> Self {
        Self {
            uart: Mutex::new(Uart { port }),
        }
    }

    fn lock(&self) -> spin::MutexGuard<'_, Uart<T>> {
        self.uart.lock()
    }
}

impl<T: SerialPort + Send> log::Log for UartLogger<T> {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Trace
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(self.lock(), "#{}:{}: {}", pp_id(), record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Identifies the calling physical processor by its local APIC ID.
fn pp_id() -> u32 {
    // See: CPUID Fn0000_0001_EBX LocalApicId, LogicalProcessorCount, CLFlush
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

static UART_LOGGER: UartLogger<Com1> = UartLogger::new(Com1);

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    struct CapturePort(Vec<u8>);

    impl SerialPort for CapturePort {
        fn transmit(&mut self, byte: u8) {
            self.0.push(byte);
        }
    }

    fn rendered(logger: UartLogger<CapturePort>) -> String {
        String::from_utf8(logger.uart.into_inner().port.0).unwrap()
    }

    #[test]
    fn records_are_rendered_onto_the_port() {
        let logger = UartLogger::new(CapturePort(Vec::new()));
        logger.log(
            &log::Record::builder()
                .level(log::Level::Error)
                .args(format_args!("vmrun failed"))
                .build(),
        );

        let output = rendered(logger);
        assert!(output.starts_with('#'), "missing the pp prefix: {output}");
        assert!(output.ends_with(":ERROR: vmrun failed\n"), "{output}");
    }

    #[test]
    fn records_append_in_issue_order() {
        let logger = UartLogger::new(CapturePort(Vec::new()));
        for reason in [0x60_u64, 0x400] {
            logger.log(
                &log::Record::builder()
                    .level(log::Level::Debug)
                    .args(format_args!("exit reason {reason:#x}"))
                    .build(),
            );
        }

        let output = rendered(logger);
        let first = output.find("exit reason 0x60").unwrap();
        let second = output.find("exit reason 0x400").unwrap();
        assert!(first < second);
    }

    #[test]
    fn every_severity_up_to_trace_is_enabled() {
        let logger = UartLogger::new(CapturePort(Vec::new()));
        for level in [
            log::Level::Error,
            log::Level::Warn,
            log::Level::Info,
            log::Level::Debug,
            log::Level::Trace,
        ] {
            assert!(logger.enabled(&log::Metadata::builder().level(level).build()));
        }
    }
}
