//! Bytecode programs: fixed 8-byte instruction words (version 1).
//!
//! Byte 0 is the opcode, the arguments are little-endian in the rest of
//! the word; unused trailing bytes must be zero-filled by the encoder and
//! are ignored here.

use byteorder::{ByteOrder, LittleEndian};
use pulser::NDDS;

use super::{Runner, SeqError};

pub const INST_LEN: usize = 8;

const OP_TTL: u8 = 0;
const OP_WAIT: u8 = 1;
const OP_CLOCK: u8 = 2;
const OP_FREQ: u8 = 3;
const OP_AMP: u8 = 4;
const OP_PHASE: u8 = 5;
const OP_DETPHASE: u8 = 6;
const OP_RESET: u8 = 7;
const OP_DAC: u8 = 8;

const NDAC: u8 = 4;

pub fn push_ttl(code: &mut Vec<u8>, word: u32, t: u32) {
    debug_assert!(t <= pulser::MAX_PULSE_T);
    let mut inst = [0u8; INST_LEN];
    inst[0] = OP_TTL;
    LittleEndian::write_u32(&mut inst[1..5], word);
    LittleEndian::write_u24(&mut inst[5..8], t);
    code.extend_from_slice(&inst);
}

pub fn push_wait(code: &mut Vec<u8>, t: u64) {
    debug_assert!(t < 1 << 56);
    let mut inst = [0u8; INST_LEN];
    inst[0] = OP_WAIT;
    LittleEndian::write_uint(&mut inst[1..8], t, 7);
    code.extend_from_slice(&inst);
}

pub fn push_clock(code: &mut Vec<u8>, div: u8) {
    let mut inst = [0u8; INST_LEN];
    inst[0] = OP_CLOCK;
    inst[1] = div;
    code.extend_from_slice(&inst);
}

pub fn push_freq(code: &mut Vec<u8>, chn: u8, ftw: u32) {
    let mut inst = [0u8; INST_LEN];
    inst[0] = OP_FREQ;
    inst[1] = chn;
    LittleEndian::write_u32(&mut inst[2..6], ftw);
    code.extend_from_slice(&inst);
}

fn push_chn_u16(code: &mut Vec<u8>, op: u8, chn: u8, val: u16) {
    let mut inst = [0u8; INST_LEN];
    inst[0] = op;
    inst[1] = chn;
    LittleEndian::write_u16(&mut inst[2..4], val);
    code.extend_from_slice(&inst);
}

pub fn push_amp(code: &mut Vec<u8>, chn: u8, amp: u16) {
    push_chn_u16(code, OP_AMP, chn, amp);
}

pub fn push_phase(code: &mut Vec<u8>, chn: u8, phase: u16) {
    push_chn_u16(code, OP_PHASE, chn, phase);
}

pub fn push_detphase(code: &mut Vec<u8>, chn: u8, detphase: u16) {
    push_chn_u16(code, OP_DETPHASE, chn, detphase);
}

pub fn push_reset(code: &mut Vec<u8>, chn: u8) {
    let mut inst = [0u8; INST_LEN];
    inst[0] = OP_RESET;
    inst[1] = chn;
    code.extend_from_slice(&inst);
}

pub fn push_dac(code: &mut Vec<u8>, chn: u8, v: u16) {
    push_chn_u16(code, OP_DAC, chn, v);
}

fn check_chn(chn: u8, limit: u8, at: usize) -> Result<u8, SeqError> {
    if chn >= limit {
        return Err(SeqError::BadChannel { chn, at });
    }
    Ok(chn)
}

/// Run a bytecode program against `runner`.
pub fn exe<R: Runner>(runner: &mut R, code: &[u8]) -> Result<(), SeqError> {
    if code.len() % INST_LEN != 0 {
        return Err(SeqError::Truncated {
            at: code.len() - code.len() % INST_LEN,
        });
    }
    for (idx, inst) in code.chunks_exact(INST_LEN).enumerate() {
        let at = idx * INST_LEN;
        match inst[0] {
            OP_TTL => {
                let word = LittleEndian::read_u32(&inst[1..5]);
                let t = LittleEndian::read_u24(&inst[5..8]);
                runner.ttl(word, u64::from(t));
            }
            OP_WAIT => runner.wait(LittleEndian::read_uint(&inst[1..8], 7)),
            OP_CLOCK => runner.clock(inst[1]),
            OP_FREQ => {
                let chn = check_chn(inst[1], NDDS as u8, at)?;
                runner.dds_freq(chn, LittleEndian::read_u32(&inst[2..6]));
            }
            OP_AMP => {
                let chn = check_chn(inst[1], NDDS as u8, at)?;
                runner.dds_amp(chn, LittleEndian::read_u16(&inst[2..4]));
            }
            OP_PHASE => {
                let chn = check_chn(inst[1], NDDS as u8, at)?;
                runner.dds_phase(chn, LittleEndian::read_u16(&inst[2..4]));
            }
            OP_DETPHASE => {
                let chn = check_chn(inst[1], NDDS as u8, at)?;
                runner.dds_detphase(chn, LittleEndian::read_u16(&inst[2..4]));
            }
            OP_RESET => runner.dds_reset(check_chn(inst[1], NDDS as u8, at)?),
            OP_DAC => {
                let chn = check_chn(inst[1], NDAC, at)?;
                runner.dac(chn, LittleEndian::read_u16(&inst[2..4]));
            }
            op => return Err(SeqError::BadOp { op, at }),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::testutil::{Op, RecRunner};

    #[test]
    fn encode_and_exe() {
        let mut code = Vec::new();
        push_ttl(&mut code, 0xa5a5_0000, 120);
        push_wait(&mut code, 3_000_000);
        push_clock(&mut code, 9);
        push_freq(&mut code, 21, 0xdead_beef);
        push_amp(&mut code, 1, 0xfff);
        push_phase(&mut code, 2, 0x8000);
        push_detphase(&mut code, 2, 16);
        push_reset(&mut code, 0);
        push_dac(&mut code, 3, 1234);

        let mut rec = RecRunner::default();
        exe(&mut rec, &code).unwrap();
        assert_eq!(
            rec.ops,
            vec![
                Op::Ttl(0xa5a5_0000, 120),
                Op::Wait(3_000_000),
                Op::Clock(9),
                Op::Freq(21, 0xdead_beef),
                Op::Amp(1, 0xfff),
                Op::Phase(2, 0x8000),
                Op::DetPhase(2, 16),
                Op::Reset(0),
                Op::Dac(3, 1234),
            ]
        );
    }

    #[test]
    fn rejects_malformed() {
        let mut rec = RecRunner::default();
        assert_eq!(
            exe(&mut rec, &[0u8; 9]),
            Err(SeqError::Truncated { at: 8 })
        );
        let mut code = vec![0u8; INST_LEN];
        code[0] = 0x40;
        assert_eq!(
            exe(&mut rec, &code),
            Err(SeqError::BadOp { op: 0x40, at: 0 })
        );
        let mut code = Vec::new();
        push_freq(&mut code, 22, 0);
        assert_eq!(
            exe(&mut rec, &code),
            Err(SeqError::BadChannel { chn: 22, at: 0 })
        );
    }
}
