//! Command-list programs: the unrestricted sequence format.
//!
//! The binary form is a stream of variable-length little-endian
//! instructions (version 1). The text form, used for the startup script,
//! is one instruction per line:
//!
//! ```text
//! # comment
//! ttl = 0x00ff00ff       # assign the full TTL word
//! ttl(5) = 1             # set one TTL bit
//! wait 1.5ms             # ns/us/ms/s suffixes, or a bare cycle count
//! clock = 100
//! freq(3) = 0x12345678
//! amp(3) = 2048
//! phase(3) = 1024
//! detphase(3) = 512
//! reset(3)
//! dac(1) = 4096
//! ```
//!
//! TTL instructions hold for the minimal pulse time; longer holds are
//! written as an explicit `wait`.

use byteorder::{ByteOrder, LittleEndian};
use pulser::{PulseTime, NDDS};

use super::{Runner, SeqError};

const OP_TTL: u8 = 0;
const OP_TTL1: u8 = 1;
const OP_WAIT: u8 = 2;
const OP_CLOCK: u8 = 3;
const OP_FREQ: u8 = 4;
const OP_AMP: u8 = 5;
const OP_PHASE: u8 = 6;
const OP_DETPHASE: u8 = 7;
const OP_RESET: u8 = 8;
const OP_DAC: u8 = 9;

/// Number of DAC channels reachable through the SPI bridge.
const NDAC: u8 = 4;

// Binary builders; `parse` emits through these and tests build programs
// with them.

pub fn push_ttl(code: &mut Vec<u8>, word: u32, t: u64) {
    code.push(OP_TTL);
    code.extend_from_slice(&word.to_le_bytes());
    code.extend_from_slice(&t.to_le_bytes());
}

pub fn push_ttl1(code: &mut Vec<u8>, chn: u8, val: bool, t: u64) {
    code.push(OP_TTL1);
    code.push(chn);
    code.push(val as u8);
    code.extend_from_slice(&t.to_le_bytes());
}

pub fn push_wait(code: &mut Vec<u8>, t: u64) {
    code.push(OP_WAIT);
    code.extend_from_slice(&t.to_le_bytes());
}

pub fn push_clock(code: &mut Vec<u8>, div: u8) {
    code.push(OP_CLOCK);
    code.push(div);
}

pub fn push_freq(code: &mut Vec<u8>, chn: u8, ftw: u32) {
    code.push(OP_FREQ);
    code.push(chn);
    code.extend_from_slice(&ftw.to_le_bytes());
}

pub fn push_amp(code: &mut Vec<u8>, chn: u8, amp: u16) {
    code.push(OP_AMP);
    code.push(chn);
    code.extend_from_slice(&amp.to_le_bytes());
}

pub fn push_phase(code: &mut Vec<u8>, chn: u8, phase: u16) {
    code.push(OP_PHASE);
    code.push(chn);
    code.extend_from_slice(&phase.to_le_bytes());
}

pub fn push_detphase(code: &mut Vec<u8>, chn: u8, detphase: u16) {
    code.push(OP_DETPHASE);
    code.push(chn);
    code.extend_from_slice(&detphase.to_le_bytes());
}

pub fn push_reset(code: &mut Vec<u8>, chn: u8) {
    code.push(OP_RESET);
    code.push(chn);
}

pub fn push_dac(code: &mut Vec<u8>, chn: u8, v: u16) {
    code.push(OP_DAC);
    code.push(chn);
    code.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
    inst_start: usize,
}

impl<'a> Reader<'a> {
    fn truncated(&self) -> SeqError {
        SeqError::Truncated {
            at: self.inst_start,
        }
    }

    fn u8(&mut self) -> Result<u8, SeqError> {
        let byte = *self.code.get(self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(byte)
    }

    fn u16(&mut self) -> Result<u16, SeqError> {
        let end = self.pos + 2;
        if end > self.code.len() {
            return Err(self.truncated());
        }
        let val = LittleEndian::read_u16(&self.code[self.pos..end]);
        self.pos = end;
        Ok(val)
    }

    fn u32(&mut self) -> Result<u32, SeqError> {
        let end = self.pos + 4;
        if end > self.code.len() {
            return Err(self.truncated());
        }
        let val = LittleEndian::read_u32(&self.code[self.pos..end]);
        self.pos = end;
        Ok(val)
    }

    fn u64(&mut self) -> Result<u64, SeqError> {
        let end = self.pos + 8;
        if end > self.code.len() {
            return Err(self.truncated());
        }
        let val = LittleEndian::read_u64(&self.code[self.pos..end]);
        self.pos = end;
        Ok(val)
    }

    fn chn(&mut self, limit: u8) -> Result<u8, SeqError> {
        let chn = self.u8()?;
        if chn >= limit {
            return Err(SeqError::BadChannel {
                chn,
                at: self.inst_start,
            });
        }
        Ok(chn)
    }
}

fn walk(
    code: &[u8],
    mut on_op: impl FnMut(&mut Reader, u8) -> Result<(), SeqError>,
) -> Result<(), SeqError> {
    let mut rd = Reader {
        code,
        pos: 0,
        inst_start: 0,
    };
    while rd.pos < code.len() {
        rd.inst_start = rd.pos;
        let op = rd.u8()?;
        if op > OP_DAC {
            return Err(SeqError::BadOp {
                op,
                at: rd.inst_start,
            });
        }
        on_op(&mut rd, op)?;
    }
    Ok(())
}

/// Run a binary command list against `runner`.
pub fn exe<R: Runner>(runner: &mut R, code: &[u8]) -> Result<(), SeqError> {
    walk(code, |rd, op| {
        match op {
            OP_TTL => {
                let word = rd.u32()?;
                let t = rd.u64()?;
                runner.ttl(word, t);
            }
            OP_TTL1 => {
                let chn = rd.chn(32)?;
                let val = rd.u8()? != 0;
                let t = rd.u64()?;
                runner.ttl1(chn, val, t);
            }
            OP_WAIT => runner.wait(rd.u64()?),
            OP_CLOCK => runner.clock(rd.u8()?),
            OP_FREQ => {
                let chn = rd.chn(NDDS as u8)?;
                runner.dds_freq(chn, rd.u32()?);
            }
            OP_AMP => {
                let chn = rd.chn(NDDS as u8)?;
                runner.dds_amp(chn, rd.u16()?);
            }
            OP_PHASE => {
                let chn = rd.chn(NDDS as u8)?;
                runner.dds_phase(chn, rd.u16()?);
            }
            OP_DETPHASE => {
                let chn = rd.chn(NDDS as u8)?;
                runner.dds_detphase(chn, rd.u16()?);
            }
            OP_RESET => runner.dds_reset(rd.chn(NDDS as u8)?),
            OP_DAC => {
                let chn = rd.chn(NDAC)?;
                runner.dac(chn, rd.u16()?);
            }
            _ => unreachable!(),
        }
        Ok(())
    })
}

/// Nominal length of a binary command list, in cycles.
pub fn total_time(code: &[u8]) -> Result<u64, SeqError> {
    let mut total = 0u64;
    walk(code, |rd, op| {
        total += match op {
            OP_TTL => {
                rd.u32()?;
                rd.u64()?
            }
            OP_TTL1 => {
                rd.chn(32)?;
                rd.u8()?;
                rd.u64()?
            }
            OP_WAIT => rd.u64()?,
            OP_CLOCK => {
                rd.u8()?;
                u64::from(PulseTime::CLOCK)
            }
            OP_FREQ => {
                rd.chn(NDDS as u8)?;
                rd.u32()?;
                u64::from(PulseTime::DDS_FREQ)
            }
            OP_AMP => {
                rd.chn(NDDS as u8)?;
                rd.u16()?;
                u64::from(PulseTime::DDS_AMP)
            }
            OP_PHASE | OP_DETPHASE => {
                rd.chn(NDDS as u8)?;
                rd.u16()?;
                u64::from(PulseTime::DDS_PHASE)
            }
            OP_RESET => {
                rd.chn(NDDS as u8)?;
                u64::from(PulseTime::DDS_RESET)
            }
            OP_DAC => {
                rd.chn(NDAC)?;
                rd.u16()?;
                u64::from(PulseTime::DAC)
            }
            _ => unreachable!(),
        };
        Ok(())
    })?;
    Ok(total)
}

/// Error from the text front end, with a 1-based line and column span.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("line {line}, col {col_start}-{col_end}: {msg}")]
pub struct SyntaxError {
    pub line: usize,
    pub col_start: usize,
    pub col_end: usize,
    pub msg: String,
}

struct LineParser<'a> {
    line: &'a str,
    lineno: usize,
    pos: usize,
}

impl<'a> LineParser<'a> {
    fn err<T>(&self, start: usize, end: usize, msg: impl Into<String>) -> Result<T, SyntaxError> {
        Err(SyntaxError {
            line: self.lineno,
            col_start: start + 1,
            col_end: end.max(start + 1),
            msg: msg.into(),
        })
    }

    fn err_here<T>(&self, msg: impl Into<String>) -> Result<T, SyntaxError> {
        self.err(self.pos, self.pos + 1, msg)
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.line.len() - trimmed.len();
    }

    fn at_end(&mut self) -> bool {
        self.skip_ws();
        self.pos >= self.line.len()
    }

    fn eat(&mut self, ch: char) -> bool {
        self.skip_ws();
        if self.rest().starts_with(ch) {
            self.pos += ch.len_utf8();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> Result<(), SyntaxError> {
        if self.eat(ch) {
            Ok(())
        } else {
            self.err_here(format!("expected `{}`", ch))
        }
    }

    fn ident(&mut self) -> Result<(&'a str, (usize, usize)), SyntaxError> {
        self.skip_ws();
        let start = self.pos;
        let end = start
            + self
                .rest()
                .find(|c: char| !c.is_ascii_alphabetic())
                .unwrap_or_else(|| self.rest().len());
        if end == start {
            return self.err_here("expected an instruction");
        }
        self.pos = end;
        Ok((&self.line[start..end], (start, end)))
    }

    // Unsigned integer, decimal or 0x-hex, bounded by `max`.
    fn number(&mut self, max: u64) -> Result<u64, SyntaxError> {
        self.skip_ws();
        let start = self.pos;
        let rest = self.rest();
        let (digits, radix) = if let Some(hex) = rest.strip_prefix("0x").or(rest.strip_prefix("0X"))
        {
            let len = hex
                .find(|c: char| !c.is_ascii_hexdigit())
                .unwrap_or(hex.len());
            (&rest[2..2 + len], 16)
        } else {
            let len = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            (&rest[..len], 10)
        };
        if digits.is_empty() {
            return self.err_here("expected a number");
        }
        let end = start + if radix == 16 { 2 } else { 0 } + digits.len();
        let val = u64::from_str_radix(digits, radix)
            .ok()
            .filter(|&v| v <= max);
        match val {
            Some(val) => {
                self.pos = end;
                Ok(val)
            }
            None => self.err(start, end, format!("value out of range (max {})", max)),
        }
    }

    // A duration: integer/decimal with an ns/us/ms/s suffix, or a bare
    // cycle count. The result is in 10ns cycles.
    fn time(&mut self) -> Result<u64, SyntaxError> {
        self.skip_ws();
        let start = self.pos;
        let int = self.number(u64::MAX)?;
        let mut frac = "";
        if self.rest().starts_with('.') {
            self.pos += 1;
            let rest = self.rest();
            let len = rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len());
            frac = &rest[..len];
            self.pos += len;
        }
        let rest = self.rest();
        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        self.pos += unit_len;
        let end = self.pos;

        let ns_per_unit: u64 = match unit {
            "" => {
                if !frac.is_empty() {
                    return self.err(start, end, "a bare cycle count cannot have a fraction");
                }
                return Ok(int);
            }
            "ns" => 1,
            "us" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            _ => return self.err(start, end, format!("unknown time unit `{}`", unit)),
        };
        let mut ns = int
            .checked_mul(ns_per_unit)
            .ok_or(())
            .or_else(|_| self.err(start, end, "time too long"))?;
        let mut scale = ns_per_unit;
        for digit in frac.chars() {
            if scale % 10 != 0 {
                return self.err(start, end, "time is not a multiple of 10ns");
            }
            scale /= 10;
            ns += u64::from(digit.to_digit(10).unwrap()) * scale;
        }
        if ns % 10 != 0 {
            return self.err(start, end, "time is not a multiple of 10ns");
        }
        Ok(ns / 10)
    }

    fn chn(&mut self, limit: u64) -> Result<u8, SyntaxError> {
        self.expect('(')?;
        let chn = self.number(limit - 1)?;
        self.expect(')')?;
        Ok(chn as u8)
    }
}

/// Compile command-list source into the binary form. Returns the code and
/// the mask of TTL bits the program touches.
pub fn parse(src: &str) -> Result<(Vec<u8>, u32), SyntaxError> {
    let mut code = Vec::new();
    let mut ttl_mask = 0u32;
    for (idx, raw) in src.lines().enumerate() {
        let line = raw.find('#').map_or(raw, |p| &raw[..p]);
        let mut p = LineParser {
            line,
            lineno: idx + 1,
            pos: 0,
        };
        if p.at_end() {
            continue;
        }
        let (ident, span) = p.ident()?;
        match ident {
            "ttl" => {
                if p.eat('(') {
                    let chn = p.number(31)? as u8;
                    p.expect(')')?;
                    p.expect('=')?;
                    let val = p.number(1)?;
                    push_ttl1(&mut code, chn, val != 0, u64::from(PulseTime::MIN));
                    ttl_mask |= 1 << chn;
                } else {
                    p.expect('=')?;
                    let word = p.number(u64::from(u32::MAX))?;
                    push_ttl(&mut code, word as u32, u64::from(PulseTime::MIN));
                    ttl_mask = u32::MAX;
                }
            }
            "wait" => {
                p.eat('=');
                let t = p.time()?;
                push_wait(&mut code, t);
            }
            "clock" => {
                p.expect('=')?;
                push_clock(&mut code, p.number(255)? as u8);
            }
            "freq" => {
                let chn = p.chn(NDDS as u64)?;
                p.expect('=')?;
                push_freq(&mut code, chn, p.number(u64::from(u32::MAX))? as u32);
            }
            "amp" => {
                let chn = p.chn(NDDS as u64)?;
                p.expect('=')?;
                push_amp(&mut code, chn, p.number(0xfff)? as u16);
            }
            "phase" => {
                let chn = p.chn(NDDS as u64)?;
                p.expect('=')?;
                push_phase(&mut code, chn, p.number(0xffff)? as u16);
            }
            "detphase" => {
                let chn = p.chn(NDDS as u64)?;
                p.expect('=')?;
                push_detphase(&mut code, chn, p.number(0xffff)? as u16);
            }
            "reset" => push_reset(&mut code, p.chn(NDDS as u64)?),
            "dac" => {
                let chn = p.chn(u64::from(NDAC))?;
                p.expect('=')?;
                push_dac(&mut code, chn, p.number(0xffff)? as u16);
            }
            _ => {
                return p.err(span.0, span.1, format!("unknown instruction `{}`", ident));
            }
        }
        if !p.at_end() {
            return p.err(p.pos, line.len(), "trailing characters");
        }
    }
    Ok((code, ttl_mask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::seq::testutil::{Op, RecRunner};

    #[test]
    fn parse_and_exe() {
        let src = "\
# startup
ttl = 0x12    # full word
ttl(5) = 1
wait 1.5ms
clock = 100
freq(3) = 0x12345678
amp(3) = 2048
phase(3) = 1024
detphase(3) = 512
reset(3)
dac(1) = 4096
wait 250
";
        let (code, ttl_mask) = parse(src).unwrap();
        assert_eq!(ttl_mask, u32::MAX);

        let mut rec = RecRunner::default();
        exe(&mut rec, &code).unwrap();
        assert_eq!(
            rec.ops,
            vec![
                Op::Ttl(0x12, 3),
                Op::Ttl1(5, true, 3),
                Op::Wait(150_000),
                Op::Clock(100),
                Op::Freq(3, 0x12345678),
                Op::Amp(3, 2048),
                Op::Phase(3, 1024),
                Op::DetPhase(3, 512),
                Op::Reset(3),
                Op::Dac(1, 4096),
                Op::Wait(250),
            ]
        );

        let total = total_time(&code).unwrap();
        assert_eq!(total, 3 + 3 + 150_000 + 5 + 50 * 4 + 50 + 45 + 250);
    }

    #[test]
    fn bit_mask_only() {
        let (_, mask) = parse("ttl(0) = 1\nttl(17) = 0\n").unwrap();
        assert_eq!(mask, 1 | 1 << 17);
    }

    #[test]
    fn syntax_errors_carry_spans() {
        let err = parse("wait 10us\nblink(3) = 1\n").unwrap_err();
        assert_eq!(err.line, 2);
        assert_eq!((err.col_start, err.col_end), (1, 6));
        assert!(err.msg.contains("blink"));

        let err = parse("freq(22) = 1\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.msg.contains("out of range"));

        let err = parse("wait 15ns\n").unwrap_err();
        assert!(err.msg.contains("multiple of 10ns"));

        let err = parse("ttl = 1 etc\n").unwrap_err();
        assert!(err.msg.contains("trailing"));

        let err = parse("amp(0) = 0x1000\n").unwrap_err();
        assert!(err.msg.contains("out of range"));
    }

    #[test]
    fn decode_errors() {
        let mut rec = RecRunner::default();
        assert_eq!(
            exe(&mut rec, &[OP_FREQ, 3]),
            Err(SeqError::Truncated { at: 0 })
        );
        assert_eq!(
            exe(&mut rec, &[99]),
            Err(SeqError::BadOp { op: 99, at: 0 })
        );
        let mut code = Vec::new();
        push_wait(&mut code, 10);
        code.extend_from_slice(&[OP_RESET, 22]);
        assert_eq!(
            exe(&mut rec, &code),
            Err(SeqError::BadChannel { chn: 22, at: 9 })
        );
    }
}
