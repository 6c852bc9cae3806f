//! Shared request/sequence types crossing the frontend/backend boundary.

pub use pulser::NDDS;

/// Number of TTL output bits.
pub const NTTL: usize = 32;

/// Operand value meaning "assign the full TTL word".
pub const CMD_OPERAND_ALL: u32 = (1 << 26) - 1;

/// Override value meaning "override off".
pub const OVR_OFF: u32 = u32::MAX;

//////////////////////////////////// OPCODES

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, num_derive::FromPrimitive, num_derive::ToPrimitive,
)]
pub enum ReqOp {
    Ttl,
    DdsFreq,
    DdsAmp,
    DdsPhase,
    DdsReset,
    Clock,
}

/// The three DDS parameters, as encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_derive::FromPrimitive, num_derive::ToPrimitive)]
pub enum DdsType {
    Freq,
    Amp,
    Phase,
}

impl From<DdsType> for ReqOp {
    fn from(typ: DdsType) -> ReqOp {
        match typ {
            DdsType::Freq => ReqOp::DdsFreq,
            DdsType::Amp => ReqOp::DdsAmp,
            DdsType::Phase => ReqOp::DdsPhase,
        }
    }
}

/// Wire encoding of a DDS parameter address: `typ << 6 | chn`.
pub fn pack_dds_addr(typ: DdsType, chn: u8) -> u8 {
    (typ as u8) << 6 | chn
}

pub fn unpack_dds_addr(byte: u8) -> Option<(DdsType, u8)> {
    let chn = byte & 0x3f;
    if chn as usize >= NDDS {
        return None;
    }
    let typ = match byte >> 6 {
        0 => DdsType::Freq,
        1 => DdsType::Amp,
        2 => DdsType::Phase,
        _ => return None,
    };
    Some((typ, chn))
}

//////////////////////////////////// COMMANDS

/// An untimed request, packed into 64 bits so the request queue can pass it
/// by value: `[63:32]` val, `[31:6]` operand (channel or TTL mask selector),
/// `[5]` is_override, `[4]` has_res, `[3:0]` opcode. For reads the backend
/// fills `val` before handing the command back.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Cmd {
    bits: u64,
}

impl Cmd {
    pub fn new(op: ReqOp, operand: u32, is_override: bool, has_res: bool, val: u32) -> Cmd {
        debug_assert!(operand <= CMD_OPERAND_ALL);
        let bits = (op as u64)
            | (has_res as u64) << 4
            | (is_override as u64) << 5
            | u64::from(operand & CMD_OPERAND_ALL) << 6
            | u64::from(val) << 32;
        Cmd { bits }
    }

    pub fn op(&self) -> ReqOp {
        num_traits::FromPrimitive::from_u64(self.bits & 0xf).unwrap()
    }

    pub fn has_res(&self) -> bool {
        self.bits & 1 << 4 != 0
    }

    pub fn is_override(&self) -> bool {
        self.bits & 1 << 5 != 0
    }

    pub fn operand(&self) -> u32 {
        (self.bits >> 6) as u32 & CMD_OPERAND_ALL
    }

    pub fn val(&self) -> u32 {
        (self.bits >> 32) as u32
    }

    pub fn set_val(&mut self, val: u32) {
        self.bits = self.bits & 0xffff_ffff | u64::from(val) << 32;
    }
}

impl std::fmt::Debug for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cmd")
            .field("op", &self.op())
            .field("operand", &self.operand())
            .field("is_override", &self.is_override())
            .field("has_res", &self.has_res())
            .field("val", &self.val())
            .finish()
    }
}

//////////////////////////////////// SEQUENCES

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SeqState {
    Init = 0,
    Start = 1,
    Flushed = 2,
    End = 3,
    Cancel = 4,
}

impl SeqState {
    pub fn from_u8(v: u8) -> SeqState {
        match v {
            0 => SeqState::Init,
            1 => SeqState::Start,
            2 => SeqState::Flushed,
            3 => SeqState::End,
            _ => SeqState::Cancel,
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self >= SeqState::End
    }
}

/// Sequence lifecycle notification, delivered on the frontend thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqEvent {
    Start(u64),
    Flushed(u64),
    End(u64),
    Cancel(u64),
}

impl SeqEvent {
    pub fn id(&self) -> u64 {
        match *self {
            SeqEvent::Start(id)
            | SeqEvent::Flushed(id)
            | SeqEvent::End(id)
            | SeqEvent::Cancel(id) => id,
        }
    }
}
