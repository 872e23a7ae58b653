//! Framed serial protocol to the register-poll USB interface board.
//!
//! Every exchange is `{app_byte, verb_byte, length_le16, payload}` in both
//! directions. Board reset is a timed RTS/DTR sequence followed by draining
//! the reply buffer until the board reports it empty.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::libc;
use nix::sys::termios::{self, BaudRate, SetArg, SpecialCharacterIndices};

use crate::{Error, Result};

nix::ioctl_write_ptr_bad!(tiocmbis, libc::TIOCMBIS, libc::c_int);
nix::ioctl_write_ptr_bad!(tiocmbic, libc::TIOCMBIC, libc::c_int);
nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

/// A bidirectional serial line with modem-control signals. Abstracted so
/// the framing and the register-poll back-end can be driven by a scripted
/// line in tests.
pub trait SerialLine: Send {
    /// Read up to `buf.len()` bytes; returns 0 on timeout.
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;
    /// Bytes buffered by the line, ready to read.
    fn in_waiting(&mut self) -> Result<usize>;
}

/// A real tty configured raw at 115200 8N1 with a 2 second read timeout.
pub struct TtyLine {
    file: File,
}

impl TtyLine {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(|e| Error::Config(format!("cannot open serial device {path:?}: {e}")))?;

        let mut tio = termios::tcgetattr(&file)
            .map_err(|e| Error::Config(format!("tcgetattr on {path:?}: {e}")))?;
        termios::cfmakeraw(&mut tio);
        termios::cfsetspeed(&mut tio, BaudRate::B115200)
            .map_err(|e| Error::Config(format!("cannot set baud rate: {e}")))?;
        // VMIN=0/VTIME=20: reads return what is available within 2 seconds
        tio.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        tio.control_chars[SpecialCharacterIndices::VTIME as usize] = 20;
        termios::tcsetattr(&file, SetArg::TCSANOW, &tio)
            .map_err(|e| Error::Config(format!("tcsetattr on {path:?}: {e}")))?;

        Ok(Self { file })
    }

    fn set_modem_bit(&mut self, bit: libc::c_int, level: bool) -> Result<()> {
        let fd = self.file.as_raw_fd();
        let res = unsafe {
            if level {
                tiocmbis(fd, &bit)
            } else {
                tiocmbic(fd, &bit)
            }
        };
        res.map_err(Error::from)?;
        Ok(())
    }
}

impl SerialLine for TtyLine {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.set_modem_bit(libc::TIOCM_RTS as libc::c_int, level)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.set_modem_bit(libc::TIOCM_DTR as libc::c_int, level)
    }

    fn in_waiting(&mut self) -> Result<usize> {
        let mut available: libc::c_int = 0;
        unsafe { fionread(self.file.as_raw_fd(), &mut available) }.map_err(Error::from)?;
        Ok(available as usize)
    }
}

/// One framed command, in either direction.
#[derive(Debug, Clone, PartialEq)]
pub struct BoardCommand {
    pub app: u8,
    pub verb: u8,
    pub data: Vec<u8>,
}

impl BoardCommand {
    pub fn new(app: u8, verb: u8, data: Vec<u8>) -> Self {
        Self { app, verb, data }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(self.data.len() + 4);
        b.push(self.app);
        b.push(self.verb);
        b.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        b.extend_from_slice(&self.data);
        b
    }
}

impl fmt::Display for BoardCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "app {:#04x}, verb {:#04x}, len {}",
            self.app,
            self.verb,
            self.data.len()
        )
    }
}

/// The framed link: reads and writes [`BoardCommand`]s over a serial line.
pub struct FacedancerLink {
    line: Box<dyn SerialLine>,
}

impl FacedancerLink {
    /// Open the link, resetting the board first.
    pub fn open(line: Box<dyn SerialLine>) -> Result<Self> {
        let mut link = Self { line };
        link.reset(10)?;
        Ok(link)
    }

    #[cfg(test)]
    pub(crate) fn raw(line: Box<dyn SerialLine>) -> Self {
        Self { line }
    }

    fn halt(&mut self) -> Result<()> {
        self.line.set_rts(true)?;
        self.line.set_dtr(true)
    }

    /// Timed RTS/DTR reset. The board floods its reply buffer on reset; we
    /// drain until it answers with the verb-0x7f "buffer empty" frame.
    pub fn reset(&mut self, attempts: usize) -> Result<()> {
        log::info!("resetting board...");
        for _ in 0..attempts {
            self.halt()?;
            self.line.set_dtr(false)?;
            let mut buf = [0u8; 1024];
            let n = self.line.read_some(&mut buf)?;
            if n < 4 {
                continue;
            }
            let verb = buf[1];
            let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
            if verb == 0x7f && len == n - 4 {
                log::info!("board reset");
                return Ok(());
            }
        }
        Err(Error::Transport(io::Error::new(
            io::ErrorKind::TimedOut,
            "board reset fault",
        )))
    }

    pub fn write_command(&mut self, cmd: &BoardCommand) -> Result<()> {
        log::trace!("tx command: {cmd}");
        self.line.write_all_bytes(&cmd.as_bytes())
    }

    pub fn read_command(&mut self) -> Result<BoardCommand> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header)?;
        let n = u16::from_le_bytes([header[2], header[3]]) as usize;
        let mut data = vec![0u8; n];
        if n > 0 {
            self.read_exact(&mut data)?;
        }
        let cmd = BoardCommand::new(header[0], header[1], data);
        log::trace!("rx command: {cmd}");
        Ok(cmd)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.line.read_some(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("expected {} bytes but received only {filled}", buf.len()),
                )));
            }
            filled += n;
        }
        Ok(())
    }
}

/// A scripted serial line: reads come from a queue, writes are recorded.
/// Backs the register-poll tests.
#[derive(Default)]
pub struct ScriptedLine {
    pub reads: std::collections::VecDeque<Vec<u8>>,
    pub written: Vec<u8>,
    pub rts: bool,
    pub dtr: bool,
}

impl ScriptedLine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_read(&mut self, data: &[u8]) {
        self.reads.push_back(data.to_vec());
    }

    /// Queue a framed reply.
    pub fn push_reply(&mut self, app: u8, verb: u8, data: &[u8]) {
        self.push_read(&BoardCommand::new(app, verb, data.to_vec()).as_bytes());
    }
}

/// A [`ScriptedLine`] behind a shared handle, so tests can keep inspecting
/// the line after handing it to a link.
impl SerialLine for std::sync::Arc<std::sync::Mutex<ScriptedLine>> {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.lock().unwrap().read_some(buf)
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.lock().unwrap().write_all_bytes(buf)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.lock().unwrap().set_rts(level)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.lock().unwrap().set_dtr(level)
    }

    fn in_waiting(&mut self) -> Result<usize> {
        self.lock().unwrap().in_waiting()
    }
}

impl SerialLine for ScriptedLine {
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(mut chunk) = self.reads.pop_front() else {
            return Ok(0);
        };
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            chunk.drain(..n);
            self.reads.push_front(chunk);
        }
        Ok(n)
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.written.extend_from_slice(buf);
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.rts = level;
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.dtr = level;
        Ok(())
    }

    fn in_waiting(&mut self) -> Result<usize> {
        Ok(self.reads.iter().map(Vec::len).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_layout() {
        let cmd = BoardCommand::new(0x40, 0x00, vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(cmd.as_bytes(), vec![0x40, 0x00, 0x03, 0x00, 0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn reset_succeeds_on_buffer_empty_reply() {
        let mut line = ScriptedLine::new();
        line.push_reply(0x00, 0x7f, &[0x01, 0x02]);
        let link = FacedancerLink::open(Box::new(line));
        assert!(link.is_ok());
    }

    #[test]
    fn reset_gives_up_after_attempts() {
        let line = ScriptedLine::new();
        assert!(FacedancerLink::open(Box::new(line)).is_err());
    }

    #[test]
    fn read_command_reassembles_fragments() {
        let mut line = ScriptedLine::new();
        // header and payload arrive in separate reads
        line.push_read(&[0x40, 0x00, 0x02, 0x00]);
        line.push_read(&[0xde, 0xad]);
        let mut link = FacedancerLink::raw(Box::new(line));
        let cmd = link.read_command().unwrap();
        assert_eq!(cmd, BoardCommand::new(0x40, 0x00, vec![0xde, 0xad]));
    }

    #[test]
    fn short_read_is_a_transport_error() {
        let mut line = ScriptedLine::new();
        line.push_read(&[0x40, 0x00, 0x08, 0x00, 0x01]);
        let mut link = FacedancerLink::raw(Box::new(line));
        assert!(link.read_command().is_err());
    }
}
