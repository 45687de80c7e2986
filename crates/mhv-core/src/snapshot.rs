//! Migration snapshot (`dom_context`)
//!
//! Wire format, little-endian throughout:
//!
//! ```text
//! [ctx_len: u64][context record: ctx_len bytes][memory image: region_size bytes]
//! ```
//!
//! Context record:
//!
//! | Field | Size |
//! |-------|------|
//! | version `u32`, domid `u16`, kind `u8`, pad `u8` | 8 |
//! | cpu, pause count, pause flags, domain flags (`u32` each) | 16 |
//! | CPU registers | `CPU_REG_WORDS * 8` |
//! | exception frame | `EXC_FRAME_WORDS * 8` |
//! | event channels (tag `u8`, pad, remote `u16`, port/virq `u16`, pad 2) | `NR_EVTCHN * 8` |
//! | virq map (`u16`, `0xFFFF` = none) | `NR_VIRQS * 2` |
//! | shared page: pending, mask, upcall `u8`, me_state `u8`, pad 6, signature 16 | `EVTCHN_WORDS * 16 + 24` |
//! | ME descriptor: spid `u64`, caps | `8 + SPAD_CAPS_SIZE` |
//! | callback: present `u8`, pad 7, entry `u64` | 16 |
//! | region size `u64` | 8 |
//!
//! Decoding validates the whole stream before anything is returned, so a
//! malformed snapshot is never partially applied.

use alloc::vec::Vec;
use mhv_abi::{snapshot, EVTCHN_WORDS, NR_EVTCHN, NR_VIRQS, SPAD_CAPS_SIZE};

use crate::domain::Domain;
use crate::evtchn::{EvtchnState, EvtchnTable};
use crate::me::MeState;
use crate::shared::SharedImage;
use crate::types::{
    CpuRegs, DomainFlags, DomainId, DomainKind, ExceptionFrame, MeDescriptor, PauseFlags,
    CPU_REG_WORDS, EXC_FRAME_WORDS,
};
use crate::wire::{Reader, Writer};

/// Length of the context record
pub const CONTEXT_LEN: usize = 8
    + 16
    + CPU_REG_WORDS * 8
    + EXC_FRAME_WORDS * 8
    + NR_EVTCHN * 8
    + NR_VIRQS * 2
    + EVTCHN_WORDS * 16
    + 24
    + 8
    + SPAD_CAPS_SIZE
    + 16
    + 8;

const NO_PORT: u16 = 0xFFFF;

const TAG_FREE: u8 = 0;
const TAG_RESERVED: u8 = 1;
const TAG_UNBOUND: u8 = 2;
const TAG_INTERDOMAIN: u8 = 3;
const TAG_VIRQ: u8 = 4;

/// Malformed snapshot stream
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotError {
    /// Stream shorter than its headers claim
    Truncated,
    /// Length header or memory tail does not match the record
    BadLength,
    /// Shared-page signature mismatch
    BadSignature,
    /// Unsupported record version
    BadVersion,
    /// A field holds a value no valid domain could have
    BadField,
}

/// Everything needed to resume a domain elsewhere
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomContext {
    pub domid: DomainId,
    pub kind: DomainKind,
    pub cpu: u32,
    pub pause_count: u32,
    pub pause_flags: PauseFlags,
    pub flags: DomainFlags,
    pub regs: CpuRegs,
    pub exc_frame: ExceptionFrame,
    pub evtchn: EvtchnTable,
    pub shared: SharedImage,
    pub desc: MeDescriptor,
    pub callback_entry: Option<u64>,
    pub region_size: u64,
}

impl DomContext {
    /// Capture `dom`. The caller must have frozen it first.
    pub fn capture(dom: &Domain) -> Self {
        let mut shared = dom.shared.image();
        shared.signature = snapshot::SIGNATURE;
        Self {
            domid: dom.id,
            kind: dom.kind,
            cpu: dom.cpu as u32,
            pause_count: dom.pause.count(),
            pause_flags: dom.pause.flags(),
            flags: dom.flags(),
            regs: *dom.regs.lock(),
            exc_frame: dom.exception_frame(),
            evtchn: dom.evtchn.lock().clone(),
            shared,
            desc: *dom.desc.lock(),
            callback_entry: dom.callback().map(|c| c.entry),
            region_size: dom.region.size,
        }
    }

    fn encode_record(&self, w: &mut Writer) {
        w.u32(snapshot::VERSION);
        w.u16(self.domid.0);
        w.u8(self.kind as u8);
        w.pad(1);
        w.u32(self.cpu);
        w.u32(self.pause_count);
        w.u32(self.pause_flags.bits());
        w.u32(self.flags.bits());
        for word in self.regs.to_words() {
            w.u64(word);
        }
        for word in self.exc_frame.0 {
            w.u64(word);
        }
        for state in self.evtchn.ports() {
            let (tag, remote, arg) = match *state {
                EvtchnState::Free => (TAG_FREE, 0, 0),
                EvtchnState::Reserved => (TAG_RESERVED, 0, 0),
                EvtchnState::Unbound { remote } => (TAG_UNBOUND, remote.0, 0),
                EvtchnState::Interdomain {
                    remote,
                    remote_port,
                } => (TAG_INTERDOMAIN, remote.0, remote_port),
                EvtchnState::Virq { virq } => (TAG_VIRQ, 0, virq),
            };
            w.u8(tag);
            w.pad(1);
            w.u16(remote);
            w.u16(arg);
            w.pad(2);
        }
        for port in self.evtchn.virq_map() {
            w.u16(port.unwrap_or(NO_PORT));
        }
        for word in self.shared.pending {
            w.u64(word);
        }
        for word in self.shared.mask {
            w.u64(word);
        }
        w.u8(self.shared.upcall_pending as u8);
        w.u8(self.shared.me_state);
        w.pad(6);
        w.bytes(&self.shared.signature);
        w.u64(self.desc.spid);
        w.bytes(&self.desc.caps);
        w.u8(self.callback_entry.is_some() as u8);
        w.pad(7);
        w.u64(self.callback_entry.unwrap_or(0));
        w.u64(self.region_size);
    }

    /// Build the wire stream: header, record, memory image.
    pub fn encode_stream(&self, memory: &[u8]) -> Vec<u8> {
        let mut w = Writer::with_capacity(snapshot::HEADER_LEN + CONTEXT_LEN + memory.len());
        w.u64(CONTEXT_LEN as u64);
        self.encode_record(&mut w);
        w.bytes(memory);
        w.into_vec()
    }

    /// Parse and validate a wire stream.
    ///
    /// Returns the context and the memory image it carries.
    pub fn decode_stream(bytes: &[u8]) -> Result<(Self, &[u8]), SnapshotError> {
        let mut r = Reader::new(bytes);
        let ctx_len = r.u64().ok_or(SnapshotError::Truncated)?;
        if ctx_len != CONTEXT_LEN as u64 {
            return Err(SnapshotError::BadLength);
        }
        let record = r.take(CONTEXT_LEN).ok_or(SnapshotError::Truncated)?;
        let memory = r.remaining();

        let ctx = Self::decode_record(record)?;
        if memory.len() as u64 != ctx.region_size {
            return Err(if (memory.len() as u64) < ctx.region_size {
                SnapshotError::Truncated
            } else {
                SnapshotError::BadLength
            });
        }
        ctx.validate()?;
        Ok((ctx, memory))
    }

    fn decode_record(record: &[u8]) -> Result<Self, SnapshotError> {
        let mut r = Reader::new(record);
        let t = SnapshotError::Truncated;

        let version = r.u32().ok_or(t)?;
        let domid = DomainId(r.u16().ok_or(t)?);
        let kind_raw = r.u8().ok_or(t)?;
        r.skip(1).ok_or(t)?;
        let cpu = r.u32().ok_or(t)?;
        let pause_count = r.u32().ok_or(t)?;
        let pause_flags_raw = r.u32().ok_or(t)?;
        let flags_raw = r.u32().ok_or(t)?;

        let mut words = [0u64; CPU_REG_WORDS];
        for w in words.iter_mut() {
            *w = r.u64().ok_or(t)?;
        }
        let regs = CpuRegs::from_words(&words);

        let mut exc_frame = ExceptionFrame::default();
        for w in exc_frame.0.iter_mut() {
            *w = r.u64().ok_or(t)?;
        }

        let mut ports = [EvtchnState::Free; NR_EVTCHN];
        for state in ports.iter_mut() {
            let tag = r.u8().ok_or(t)?;
            r.skip(1).ok_or(t)?;
            let remote = DomainId(r.u16().ok_or(t)?);
            let arg = r.u16().ok_or(t)?;
            r.skip(2).ok_or(t)?;
            *state = match tag {
                TAG_FREE => EvtchnState::Free,
                TAG_RESERVED => EvtchnState::Reserved,
                TAG_UNBOUND => EvtchnState::Unbound { remote },
                TAG_INTERDOMAIN => EvtchnState::Interdomain {
                    remote,
                    remote_port: arg,
                },
                TAG_VIRQ => EvtchnState::Virq { virq: arg },
                _ => return Err(SnapshotError::BadField),
            };
        }
        let mut virqs = [None; NR_VIRQS];
        for v in virqs.iter_mut() {
            *v = match r.u16().ok_or(t)? {
                NO_PORT => None,
                p => Some(p),
            };
        }

        let mut shared = SharedImage::default();
        for w in shared.pending.iter_mut() {
            *w = r.u64().ok_or(t)?;
        }
        for w in shared.mask.iter_mut() {
            *w = r.u64().ok_or(t)?;
        }
        shared.upcall_pending = match r.u8().ok_or(t)? {
            0 => false,
            1 => true,
            _ => return Err(SnapshotError::BadField),
        };
        shared.me_state = r.u8().ok_or(t)?;
        r.skip(6).ok_or(t)?;
        shared.signature = r.array().ok_or(t)?;

        let desc = MeDescriptor {
            spid: r.u64().ok_or(t)?,
            caps: r.array().ok_or(t)?,
        };
        let has_callback = r.u8().ok_or(t)?;
        r.skip(7).ok_or(t)?;
        let entry = r.u64().ok_or(t)?;
        let region_size = r.u64().ok_or(t)?;

        // Signature is checked before the version so that a stream from an
        // unrelated producer reports the more useful error.
        if shared.signature != snapshot::SIGNATURE {
            return Err(SnapshotError::BadSignature);
        }
        if version != snapshot::VERSION {
            return Err(SnapshotError::BadVersion);
        }

        Ok(Self {
            domid,
            kind: DomainKind::from_u8(kind_raw).ok_or(SnapshotError::BadField)?,
            cpu,
            pause_count,
            pause_flags: PauseFlags::from_bits(pause_flags_raw).ok_or(SnapshotError::BadField)?,
            flags: DomainFlags::from_bits(flags_raw).ok_or(SnapshotError::BadField)?,
            regs,
            exc_frame,
            evtchn: EvtchnTable::from_parts(ports, virqs),
            shared,
            desc,
            callback_entry: match has_callback {
                0 => None,
                1 => Some(entry),
                _ => return Err(SnapshotError::BadField),
            },
            region_size,
        })
    }

    /// Structural checks no valid capture can fail.
    fn validate(&self) -> Result<(), SnapshotError> {
        let bad = Err(SnapshotError::BadField);
        if !self.domid.is_me() || self.kind != DomainKind::Me {
            return bad;
        }
        // A dying or in-flight domain is never captured
        if self.flags.intersects(DomainFlags::DYING | DomainFlags::MIGRATING) {
            return bad;
        }
        if self.pause_count < self.pause_flags.bits().count_ones()
            || self.pause_count > snapshot::MAX_PAUSE_COUNT
        {
            return bad;
        }
        match MeState::from_u8(self.shared.me_state) {
            None | Some(MeState::Dead) => return bad,
            Some(_) => {}
        }

        let ports = self.evtchn.ports();
        if ports[0] != EvtchnState::Reserved {
            return bad;
        }
        for (port, state) in ports.iter().enumerate().skip(1) {
            match *state {
                EvtchnState::Free => {}
                EvtchnState::Reserved => return bad,
                EvtchnState::Unbound { remote } => {
                    if !remote.is_slot() {
                        return bad;
                    }
                }
                EvtchnState::Interdomain {
                    remote,
                    remote_port,
                } => {
                    if !remote.is_slot()
                        || remote == self.domid
                        || remote_port == 0
                        || remote_port as usize >= NR_EVTCHN
                    {
                        return bad;
                    }
                }
                EvtchnState::Virq { virq } => {
                    if self.evtchn.virq_port(virq) != Some(port as u16) {
                        return bad;
                    }
                }
            }
        }
        for (virq, port) in self.evtchn.virq_map().iter().enumerate() {
            if let Some(p) = *port {
                if p as usize >= NR_EVTCHN
                    || ports[p as usize]
                        != (EvtchnState::Virq {
                            virq: virq as u16,
                        })
                {
                    return bad;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use crate::types::MemRegion;
    use alloc::vec;
    use mhv_abi::virq;
    use proptest::prelude::*;

    fn sample(region_size: u64) -> DomContext {
        let reg = Registry::new();
        let d = reg
            .create(DomainId(3), 1, MemRegion::new(0x4000_0000, region_size))
            .unwrap();
        d.regs.lock().x[0] = 0xabcd;
        d.regs.lock().pc = 0xffff_0000_0000_1000;
        crate::evtchn::bind_virq(&d, virq::TIMER).unwrap();
        d.evtchn.lock().set(
            7,
            EvtchnState::Interdomain {
                remote: DomainId(0),
                remote_port: 12,
            },
        );
        d.shared.mark_pending(7);
        d.set_me_state(MeState::Migrating);
        d.desc.lock().spid = 0x5150;
        d.register_callback(0x8000, 0x1234);
        DomContext::capture(&d)
    }

    #[test]
    fn test_context_len_matches_encoder() {
        let ctx = sample(16);
        let stream = ctx.encode_stream(&[0u8; 16]);
        assert_eq!(stream.len(), snapshot::HEADER_LEN + CONTEXT_LEN + 16);
    }

    #[test]
    fn test_stream_roundtrip() {
        let ctx = sample(32);
        let mem: Vec<u8> = (0..32).collect();
        let stream = ctx.encode_stream(&mem);
        let (back, tail) = DomContext::decode_stream(&stream).unwrap();
        assert_eq!(back, ctx);
        assert_eq!(tail, &mem[..]);
        assert_eq!(back.callback_entry, Some(0x8000));
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut ctx = sample(8);
        ctx.shared.signature[0] ^= 0xff;
        let stream = ctx.encode_stream(&[0; 8]);
        assert_eq!(
            DomContext::decode_stream(&stream),
            Err(SnapshotError::BadSignature)
        );
    }

    #[test]
    fn test_bad_header_rejected() {
        let ctx = sample(8);
        let mut stream = ctx.encode_stream(&[0; 8]);
        stream[0] ^= 1;
        assert_eq!(
            DomContext::decode_stream(&stream),
            Err(SnapshotError::BadLength)
        );
        assert_eq!(
            DomContext::decode_stream(&stream[..4]),
            Err(SnapshotError::Truncated)
        );
    }

    #[test]
    fn test_truncated_memory_rejected() {
        let ctx = sample(64);
        let stream = ctx.encode_stream(&[0; 64]);
        assert_eq!(
            DomContext::decode_stream(&stream[..stream.len() - 1]),
            Err(SnapshotError::Truncated)
        );
        let mut long = stream.clone();
        long.push(0);
        assert_eq!(
            DomContext::decode_stream(&long),
            Err(SnapshotError::BadLength)
        );
    }

    #[test]
    fn test_inconsistent_virq_map_rejected() {
        let mut ctx = sample(8);
        let mut ports = *ctx.evtchn.ports();
        let virqs = *ctx.evtchn.virq_map();
        let bound = virqs[virq::TIMER as usize].unwrap();
        ports[bound as usize] = EvtchnState::Free;
        ctx.evtchn = EvtchnTable::from_parts(ports, virqs);
        assert_eq!(
            DomContext::decode_stream(&ctx.encode_stream(&[0; 8])),
            Err(SnapshotError::BadField)
        );
    }

    #[test]
    fn test_agency_context_rejected() {
        let mut ctx = sample(8);
        ctx.domid = DomainId::AGENCY;
        assert_eq!(
            DomContext::decode_stream(&ctx.encode_stream(&[0; 8])),
            Err(SnapshotError::BadField)
        );
    }

    proptest! {
        /// Arbitrary register frames, pause states and memory survive the
        /// wire unchanged.
        #[test]
        fn prop_roundtrip_preserves_state(
            regs in prop::array::uniform32(any::<u64>()),
            frame_seed in any::<u64>(),
            anon in 0u32..8,
            flags in 0u32..8,
            mem in prop::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut ctx = sample(mem.len() as u64);
            ctx.regs.x[..31].copy_from_slice(&regs[..31]);
            ctx.regs.sp = regs[31];
            for (i, w) in ctx.exc_frame.0.iter_mut().enumerate() {
                *w = frame_seed.rotate_left(i as u32);
            }
            ctx.pause_flags = PauseFlags::from_bits_truncate(flags);
            ctx.pause_count = ctx.pause_flags.bits().count_ones() + anon;

            let stream = ctx.encode_stream(&mem);
            let (back, tail) = DomContext::decode_stream(&stream).unwrap();
            prop_assert_eq!(back, ctx);
            prop_assert_eq!(tail, &mem[..]);
        }
    }

    #[test]
    fn test_garbage_never_panics() {
        let stream = vec![0xA5u8; snapshot::HEADER_LEN + CONTEXT_LEN];
        assert!(DomContext::decode_stream(&stream).is_err());
    }
}
