// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The OS serial handle: open, line configuration, and the poll-bounded
//! read/write primitives the engine workers run on.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{
    cfmakeraw, cfsetspeed, tcdrain, tcgetattr, tcsetattr, BaudRate, ControlFlags, InputFlags,
    SetArg, Termios,
};

use crate::{Error, Result};

/// Number of data bits per character.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataBits {
    Five,
    Six,
    Seven,
    Eight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    /// Hardware RTS/CTS.
    RtsCts,
    /// Software XON/XOFF.
    XonXoff,
}

/// Line parameters applied at open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow: FlowControl,
}

impl Default for LineSettings {
    /// 115200 8N1, no flow control.
    fn default() -> Self {
        LineSettings {
            baud: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow: FlowControl::None,
        }
    }
}

/// An opened, raw-configured serial device.
///
/// Reads and writes go through `&self`, so the reader and writer workers
/// can share one device; callers never touch it directly.
#[derive(Debug)]
pub struct SerialDevice {
    file: File,
}

impl SerialDevice {
    /// Opens non-blocking (so a modem line waiting for carrier cannot hang
    /// the open) and applies `settings` in raw mode. `EBUSY` from an
    /// exclusive-use holder maps to a sharing conflict.
    pub fn open(path: &Path, settings: &LineSettings) -> Result<SerialDevice> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .map_err(|err| match err.raw_os_error() {
                Some(code) if code == libc::EBUSY => Error::SharingConflict {
                    device: path.display().to_string(),
                },
                Some(code) if code == libc::ENODEV || code == libc::ENXIO => Error::Disconnected,
                _ => Error::io(err),
            })?;
        let device = SerialDevice { file };
        device.configure(settings)?;
        Ok(device)
    }

    fn configure(&self, settings: &LineSettings) -> Result<()> {
        let mut tios: Termios =
            tcgetattr(&self.file).map_err(|e| config_error("tcgetattr", e))?;
        cfmakeraw(&mut tios);

        let speed = baud_constant(settings.baud)?;
        cfsetspeed(&mut tios, speed).map_err(|e| config_error("cfsetspeed", e))?;

        tios.control_flags &= !(ControlFlags::CSIZE
            | ControlFlags::PARENB
            | ControlFlags::PARODD
            | ControlFlags::CSTOPB
            | ControlFlags::CRTSCTS);
        tios.control_flags |= ControlFlags::CLOCAL | ControlFlags::CREAD;
        tios.control_flags |= match settings.data_bits {
            DataBits::Five => ControlFlags::CS5,
            DataBits::Six => ControlFlags::CS6,
            DataBits::Seven => ControlFlags::CS7,
            DataBits::Eight => ControlFlags::CS8,
        };
        match settings.parity {
            Parity::None => {}
            Parity::Even => tios.control_flags |= ControlFlags::PARENB,
            Parity::Odd => {
                tios.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
            }
        }
        if settings.stop_bits == StopBits::Two {
            tios.control_flags |= ControlFlags::CSTOPB;
        }
        tios.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
        match settings.flow {
            FlowControl::None => {}
            FlowControl::RtsCts => tios.control_flags |= ControlFlags::CRTSCTS,
            FlowControl::XonXoff => {
                tios.input_flags |= InputFlags::IXON | InputFlags::IXOFF;
            }
        }

        tcsetattr(&self.file, SetArg::TCSANOW, &tios)
            .map_err(|e| config_error("tcsetattr", e))
    }

    /// Waits up to `timeout_ms` for readable data. Hangup and error
    /// conditions report as readable so the following read surfaces them.
    pub(crate) fn wait_readable(&self, timeout_ms: u16) -> io::Result<bool> {
        self.wait(PollFlags::POLLIN, timeout_ms)
    }

    pub(crate) fn wait_writable(&self, timeout_ms: u16) -> io::Result<bool> {
        self.wait(PollFlags::POLLOUT, timeout_ms)
    }

    fn wait(&self, events: PollFlags, timeout_ms: u16) -> io::Result<bool> {
        let mut fds = [PollFd::new(self.file.as_fd(), events)];
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(nix::errno::Errno::EINTR) => Ok(false),
            Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
        }
    }

    /// One read into `buf`. `Ok(0)` is end-of-file: the far end hung up or
    /// the device vanished.
    pub(crate) fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    /// One write from `buf`; short writes are expected and the caller
    /// keeps the tail.
    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    /// Blocks until the driver's output queue is empty.
    pub(crate) fn drain(&self) -> io::Result<()> {
        loop {
            match tcdrain(&self.file) {
                Ok(()) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from_raw_os_error(errno as i32)),
            }
        }
    }

    /// Asserts or drops the driver's exclusive-use flag (`TIOCEXCL` /
    /// `TIOCNXCL`).
    pub(crate) fn set_exclusive(&self, exclusive: bool) -> io::Result<()> {
        let request = if exclusive {
            libc::TIOCEXCL
        } else {
            libc::TIOCNXCL
        };
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn config_error(what: &str, errno: nix::errno::Errno) -> Error {
    Error::Config(format!("{what} failed: {errno}"))
}

fn baud_constant(baud: u32) -> Result<BaudRate> {
    let rate = match baud {
        50 => BaudRate::B50,
        75 => BaudRate::B75,
        110 => BaudRate::B110,
        134 => BaudRate::B134,
        150 => BaudRate::B150,
        200 => BaudRate::B200,
        300 => BaudRate::B300,
        600 => BaudRate::B600,
        1_200 => BaudRate::B1200,
        1_800 => BaudRate::B1800,
        2_400 => BaudRate::B2400,
        4_800 => BaudRate::B4800,
        9_600 => BaudRate::B9600,
        19_200 => BaudRate::B19200,
        38_400 => BaudRate::B38400,
        57_600 => BaudRate::B57600,
        115_200 => BaudRate::B115200,
        230_400 => BaudRate::B230400,
        #[cfg(target_os = "linux")]
        460_800 => BaudRate::B460800,
        #[cfg(target_os = "linux")]
        500_000 => BaudRate::B500000,
        #[cfg(target_os = "linux")]
        921_600 => BaudRate::B921600,
        #[cfg(target_os = "linux")]
        1_000_000 => BaudRate::B1000000,
        #[cfg(target_os = "linux")]
        2_000_000 => BaudRate::B2000000,
        other => {
            return Err(Error::Config(format!("unsupported baud rate {other}")));
        }
    };
    Ok(rate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_line_settings() {
        let s = LineSettings::default();
        assert_eq!(s.baud, 115_200);
        assert_eq!(s.data_bits, DataBits::Eight);
        assert_eq!(s.parity, Parity::None);
        assert_eq!(s.stop_bits, StopBits::One);
        assert_eq!(s.flow, FlowControl::None);
    }

    #[test]
    fn odd_baud_rates_are_rejected() {
        assert!(matches!(baud_constant(115_201), Err(Error::Config(_))));
        assert!(baud_constant(9_600).is_ok());
    }

    #[test]
    fn opening_a_missing_device_fails() {
        let err = SerialDevice::open(
            Path::new("/dev/does-not-exist-okserial"),
            &LineSettings::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
