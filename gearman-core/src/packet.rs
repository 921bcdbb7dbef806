//! Gearman binary packet framing.
//!
//! ```text
//! +--------+---------+--------+------------------------------+
//! | magic  | command |  size  | arg0 \0 arg1 \0 ... data     |
//! | 4 B    | u32 BE  | u32 BE | `size` bytes                 |
//! +--------+---------+--------+------------------------------+
//! ```
//!
//! Commands that carry data terminate every argument with `\0` and put the
//! opaque data last. Commands without data leave their final argument
//! unterminated. Verb semantics are not interpreted here.

use crate::alloc::WorkloadAllocator;
use crate::error::{GearmanError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use smallvec::SmallVec;
use std::fmt;

/// Header length in bytes.
pub const HEADER_SIZE: usize = 12;

/// Largest body accepted by the decoder.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Packet direction marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub const REQUEST_BYTES: [u8; 4] = *b"\0REQ";
    pub const RESPONSE_BYTES: [u8; 4] = *b"\0RES";

    #[must_use]
    pub const fn as_bytes(self) -> [u8; 4] {
        match self {
            Self::Request => Self::REQUEST_BYTES,
            Self::Response => Self::RESPONSE_BYTES,
        }
    }

    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self> {
        match bytes {
            Self::REQUEST_BYTES => Ok(Self::Request),
            Self::RESPONSE_BYTES => Ok(Self::Response),
            other => Err(GearmanError::InvalidMagic(other)),
        }
    }
}

/// Static description of a command: wire name, argument count, data flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub name: &'static str,
    pub argc: usize,
    pub data: bool,
}

macro_rules! commands {
    ($($variant:ident = $num:literal => ($name:literal, $argc:literal, $data:literal),)*) => {
        /// Every command number defined by the binary protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Command {
            $($variant = $num,)*
        }

        impl Command {
            #[must_use]
            pub const fn info(self) -> CommandInfo {
                match self {
                    $(Self::$variant => CommandInfo { name: $name, argc: $argc, data: $data },)*
                }
            }
        }

        impl TryFrom<u32> for Command {
            type Error = GearmanError;

            fn try_from(value: u32) -> Result<Self> {
                match value {
                    $($num => Ok(Self::$variant),)*
                    other => Err(GearmanError::InvalidCommand(other)),
                }
            }
        }
    };
}

commands! {
    Text = 0 => ("TEXT", 5, false),
    CanDo = 1 => ("CAN_DO", 1, false),
    CantDo = 2 => ("CANT_DO", 1, false),
    ResetAbilities = 3 => ("RESET_ABILITIES", 0, false),
    PreSleep = 4 => ("PRE_SLEEP", 0, false),
    Unused = 5 => ("UNUSED", 0, false),
    Noop = 6 => ("NOOP", 0, false),
    SubmitJob = 7 => ("SUBMIT_JOB", 2, true),
    JobCreated = 8 => ("JOB_CREATED", 1, false),
    GrabJob = 9 => ("GRAB_JOB", 0, false),
    NoJob = 10 => ("NO_JOB", 0, false),
    JobAssign = 11 => ("JOB_ASSIGN", 2, true),
    WorkStatus = 12 => ("WORK_STATUS", 3, false),
    WorkComplete = 13 => ("WORK_COMPLETE", 1, true),
    WorkFail = 14 => ("WORK_FAIL", 1, false),
    GetStatus = 15 => ("GET_STATUS", 1, false),
    EchoReq = 16 => ("ECHO_REQ", 0, true),
    EchoRes = 17 => ("ECHO_RES", 0, true),
    SubmitJobBg = 18 => ("SUBMIT_JOB_BG", 2, true),
    Error = 19 => ("ERROR", 2, false),
    StatusRes = 20 => ("STATUS_RES", 5, false),
    SubmitJobHigh = 21 => ("SUBMIT_JOB_HIGH", 2, true),
    SetClientId = 22 => ("SET_CLIENT_ID", 1, false),
    CanDoTimeout = 23 => ("CAN_DO_TIMEOUT", 2, false),
    AllYours = 24 => ("ALL_YOURS", 0, false),
    WorkException = 25 => ("WORK_EXCEPTION", 1, true),
    OptionReq = 26 => ("OPTION_REQ", 1, false),
    OptionRes = 27 => ("OPTION_RES", 1, false),
    WorkData = 28 => ("WORK_DATA", 1, true),
    WorkWarning = 29 => ("WORK_WARNING", 1, true),
    GrabJobUniq = 30 => ("GRAB_JOB_UNIQ", 0, false),
    JobAssignUniq = 31 => ("JOB_ASSIGN_UNIQ", 3, true),
    SubmitJobHighBg = 32 => ("SUBMIT_JOB_HIGH_BG", 2, true),
    SubmitJobLow = 33 => ("SUBMIT_JOB_LOW", 2, true),
    SubmitJobLowBg = 34 => ("SUBMIT_JOB_LOW_BG", 2, true),
    SubmitJobSched = 35 => ("SUBMIT_JOB_SCHED", 7, true),
    SubmitJobEpoch = 36 => ("SUBMIT_JOB_EPOCH", 3, true),
}

impl Command {
    #[must_use]
    pub const fn name(self) -> &'static str {
        self.info().name
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One protocol message.
///
/// A packet is complete once it holds as many arguments as its command
/// requires; only complete packets can be encoded. Decoded packets are always
/// complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    magic: Magic,
    command: Command,
    args: SmallVec<[Bytes; 3]>,
    data: Bytes,
}

impl Packet {
    #[must_use]
    pub fn new(magic: Magic, command: Command) -> Self {
        Self {
            magic,
            command,
            args: SmallVec::new(),
            data: Bytes::new(),
        }
    }

    /// Build an `ECHO_REQ` carrying `payload`.
    #[must_use]
    pub fn echo_request(payload: Bytes) -> Self {
        Self::new(Magic::Request, Command::EchoReq).with_data(payload)
    }

    /// Append an argument. Arguments must not contain `\0`.
    pub fn push_arg(&mut self, arg: impl Into<Bytes>) -> Result<()> {
        let arg = arg.into();
        if self.args.len() >= self.command.info().argc {
            return Err(GearmanError::invalid_packet(format!(
                "{} takes {} arguments",
                self.command,
                self.command.info().argc
            )));
        }
        if arg.contains(&0) {
            return Err(GearmanError::invalid_packet("argument contains NUL"));
        }
        self.args.push(arg);
        Ok(())
    }

    #[must_use]
    pub fn with_data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    #[inline]
    #[must_use]
    pub const fn magic(&self) -> Magic {
        self.magic
    }

    #[inline]
    #[must_use]
    pub const fn command(&self) -> Command {
        self.command
    }

    #[must_use]
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&Bytes> {
        self.args.get(index)
    }

    #[must_use]
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.args.len() == self.command.info().argc
    }

    /// Body length as written in the header.
    #[must_use]
    pub fn body_len(&self) -> usize {
        let info = self.command.info();
        let args: usize = self.args.iter().map(Bytes::len).sum();
        let separators = if info.data {
            self.args.len()
        } else {
            self.args.len().saturating_sub(1)
        };
        args + separators + if info.data { self.data.len() } else { 0 }
    }

    /// Total bytes on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    /// Encode to wire format.
    pub fn encode(&self) -> Result<Bytes> {
        if !self.is_complete() {
            return Err(GearmanError::invalid_packet(format!(
                "{} needs {} arguments, has {}",
                self.command,
                self.command.info().argc,
                self.args.len()
            )));
        }
        let info = self.command.info();
        let body_len = self.body_len();
        let size = u32::try_from(body_len)
            .map_err(|_| GearmanError::invalid_packet("body exceeds u32"))?;

        let mut out = BytesMut::with_capacity(HEADER_SIZE + body_len);
        out.put_slice(&self.magic.as_bytes());
        out.put_u32(self.command as u32);
        out.put_u32(size);

        let last = self.args.len().saturating_sub(1);
        for (i, arg) in self.args.iter().enumerate() {
            out.put_slice(arg);
            if info.data || i != last {
                out.put_u8(0);
            }
        }
        if info.data {
            out.put_slice(&self.data);
        }
        Ok(out.freeze())
    }
}

/// Decode one packet from the front of `src`.
///
/// Returns:
/// - `Ok(Some(packet))` → packet consumed from `src`
/// - `Ok(None)` → need more data, `src` untouched
/// - `Err` → protocol violation
///
/// The data section is copied into a workload buffer from `alloc`.
pub fn decode(src: &mut BytesMut, alloc: &WorkloadAllocator) -> Result<Option<Packet>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &src[..HEADER_SIZE];
    let mut magic = [0u8; 4];
    header.copy_to_slice(&mut magic);
    let magic = Magic::from_bytes(magic)?;
    let command = Command::try_from(header.get_u32())?;
    let size = header.get_u32() as usize;

    if size > MAX_BODY_SIZE {
        return Err(GearmanError::invalid_packet(format!(
            "body of {size} bytes exceeds {MAX_BODY_SIZE}"
        )));
    }
    if src.len() < HEADER_SIZE + size {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let mut body = src.split_to(size).freeze();
    let info = command.info();

    let mut packet = Packet::new(magic, command);
    for i in 0..info.argc {
        let last_unterminated = !info.data && i + 1 == info.argc;
        if last_unterminated {
            packet.args.push(body.split_to(body.len()));
            break;
        }
        let Some(nul) = body.iter().position(|&b| b == 0) else {
            return Err(GearmanError::invalid_packet(format!(
                "{command} expects {} arguments",
                info.argc
            )));
        };
        packet.args.push(body.split_to(nul));
        body.advance(1);
    }

    if info.data {
        if !body.is_empty() {
            packet.data = alloc.alloc_copy(&body)?.freeze();
        }
    } else if !body.is_empty() {
        return Err(GearmanError::invalid_packet(format!(
            "{command} carries no data"
        )));
    }

    Ok(Some(packet))
}
