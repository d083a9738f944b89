//! Annex-B H.264 byte-stream scanning, NAL classification and access-unit
//! assembly. Stateful: feed it chunks as they arrive off a byte source and it
//! hands back zero or more complete `AccessUnit`s per call.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Scanning buffer bound. Past this the accumulated, still-unterminated NAL
/// is assumed corrupt or the stream never produced a start code; the buffer
/// is truncated from the head, keeping the tail, and scanning restarts for a
/// fresh start code in what's left.
const MAX_SCAN_BUFFER: usize = 512 * 1024;

/// How many frames may queue behind an un-cached IDR before the whole held
/// batch is emitted anyway with a warning. Not specified by the source;
/// chosen as roughly one second of video at typical frame rates.
const MAX_WARMUP_FRAMES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalType {
    Sps,
    Pps,
    Idr,
    NonIdr,
    Aud,
    Sei,
    Other(u8),
}

impl NalType {
    fn classify(nal_header: u8) -> Self {
        match nal_header & 0x1F {
            7 => NalType::Sps,
            8 => NalType::Pps,
            5 => NalType::Idr,
            1 => NalType::NonIdr,
            9 => NalType::Aud,
            6 => NalType::Sei,
            other => NalType::Other(other),
        }
    }

    fn is_picture(self) -> bool {
        matches!(self, NalType::Idr | NalType::NonIdr)
    }
}

/// `{sps, pps}` plus their Annex-B concatenation, ready to prepend to an IDR.
/// Either both are set or neither is: there is no partially-populated cache.
#[derive(Debug, Clone)]
pub struct ParameterSetCache {
    pub sps: Bytes,
    pub pps: Bytes,
    pub concatenated: Bytes,
}

impl ParameterSetCache {
    fn build(sps: Bytes, pps: Bytes) -> Self {
        let mut concatenated = BytesMut::with_capacity(sps.len() + pps.len());
        concatenated.extend_from_slice(&sps);
        concatenated.extend_from_slice(&pps);
        Self {
            sps,
            pps,
            concatenated: concatenated.freeze(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub contains_idr: bool,
    pub duration: Duration,
}

/// A finalised frame held back because it's an IDR with no cached parameter
/// sets yet, or because it falls after such an IDR and must not overtake it.
struct HeldFrame {
    data: Bytes,
    contains_idr: bool,
    duration: Duration,
}

/// Locates the next Annex-B start code at or after `from`, preferring the
/// 4-byte form. Scanning left to right and checking the 4-byte form first at
/// every position means a 3-byte match immediately preceded by `00` is never
/// reported on its own — the scan already matched the 4-byte form one
/// position earlier.
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if i + 4 <= buf.len() && buf[i..i + 4] == [0, 0, 0, 1] {
            return Some((i, 4));
        }
        if buf[i..i + 3] == [0, 0, 1] {
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// Converts a transcoder's raw Annex-B byte stream into access units.
pub struct Assembler {
    scan_buf: BytesMut,
    /// Length of the start code currently sitting at `scan_buf[0]`, once one
    /// has been found. `None` until the first start code in the stream.
    anchor_code_len: Option<usize>,

    pending_sps: Option<Bytes>,
    pending_pps: Option<Bytes>,
    cache: Option<ParameterSetCache>,

    leading_other: BytesMut,
    current_frame: BytesMut,
    current_has_idr: bool,

    /// Frames withheld, in source order, while waiting on an IDR that
    /// arrived before the parameter-set cache was populated. Empty whenever
    /// nothing is being held.
    held: VecDeque<HeldFrame>,

    fps: f64,
}

impl Assembler {
    pub fn new(initial_fps: f64) -> Self {
        Self {
            scan_buf: BytesMut::new(),
            anchor_code_len: None,
            pending_sps: None,
            pending_pps: None,
            cache: None,
            leading_other: BytesMut::new(),
            current_frame: BytesMut::new(),
            current_has_idr: false,
            held: VecDeque::new(),
            fps: initial_fps,
        }
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn cache(&self) -> Option<&ParameterSetCache> {
        self.cache.as_ref()
    }

    fn frame_duration(&self) -> Duration {
        if self.fps > 0.0 {
            Duration::from_secs_f64(1.0 / self.fps)
        } else {
            Duration::from_millis(33)
        }
    }

    /// Feeds one chunk of raw bytes off the transcoder's stdout. Returns any
    /// access units that became complete as a result, in source order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<AccessUnit> {
        self.scan_buf.extend_from_slice(chunk);
        let mut emitted = Vec::new();

        loop {
            let Some(code_len) = self.anchor_code_len else {
                match find_start_code(&self.scan_buf, 0) {
                    Some((pos, len)) => {
                        let _ = self.scan_buf.split_to(pos);
                        self.anchor_code_len = Some(len);
                        continue;
                    }
                    None => {
                        self.bound_scan_buf();
                        break;
                    }
                }
            };

            match find_start_code(&self.scan_buf, code_len) {
                Some((pos, next_len)) => {
                    let nal = self.scan_buf.split_to(pos).freeze();
                    self.anchor_code_len = Some(next_len);
                    emitted.extend(self.process_nal(nal));
                }
                None => {
                    self.bound_scan_buf();
                    break;
                }
            }
        }

        emitted
    }

    fn bound_scan_buf(&mut self) {
        if self.scan_buf.len() <= MAX_SCAN_BUFFER {
            return;
        }
        warn!(
            "nal scan buffer exceeded {} bytes without a start code, truncating from the head",
            MAX_SCAN_BUFFER
        );
        let drop_from = self.scan_buf.len() - MAX_SCAN_BUFFER;
        let _ = self.scan_buf.split_to(drop_from);
        self.anchor_code_len = None;
    }

    fn process_nal(&mut self, nal: Bytes) -> Vec<AccessUnit> {
        let header_idx = self.header_index(&nal);
        let header = nal[header_idx];
        match NalType::classify(header) {
            NalType::Sps => {
                self.pending_sps = Some(nal);
                self.maybe_commit_cache()
            }
            NalType::Pps => {
                self.pending_pps = Some(nal);
                self.maybe_commit_cache()
            }
            NalType::Aud => self.finalize_frame(),
            t if t.is_picture() => {
                let mut out = Vec::new();
                if !self.current_frame.is_empty() {
                    out = self.finalize_frame();
                }
                if self.current_frame.is_empty() {
                    self.current_frame.extend_from_slice(&self.leading_other);
                    self.leading_other.clear();
                }
                self.current_frame.extend_from_slice(&nal);
                self.current_has_idr = t == NalType::Idr;
                out
            }
            NalType::Sei | NalType::Other(_) => {
                if self.current_frame.is_empty() {
                    self.leading_other.extend_from_slice(&nal);
                } else {
                    self.current_frame.extend_from_slice(&nal);
                }
                Vec::new()
            }
        }
    }

    /// Index within `nal` (which still carries its leading start code) of
    /// the NAL header byte.
    fn header_index(&self, nal: &[u8]) -> usize {
        if nal.len() >= 4 && nal[0..4] == [0, 0, 0, 1] {
            4
        } else {
            3
        }
    }

    fn maybe_commit_cache(&mut self) -> Vec<AccessUnit> {
        if let (Some(sps), Some(pps)) = (self.pending_sps.clone(), self.pending_pps.clone()) {
            self.cache = Some(ParameterSetCache::build(sps, pps));
            debug!("parameter set cache updated");
            if !self.held.is_empty() {
                return self.drain_held();
            }
        }
        Vec::new()
    }

    /// Finalises `current_frame` into an `AccessUnit`. An IDR finalised
    /// before the parameter-set cache is populated is queued in `held`
    /// instead of being returned, and so is every frame finalised after it
    /// while it's still unresolved — nothing is ever allowed to overtake a
    /// withheld IDR. The queue drains, in order, once the cache arrives or
    /// the warm-up bound is exceeded.
    fn finalize_frame(&mut self) -> Vec<AccessUnit> {
        if self.current_frame.is_empty() {
            return Vec::new();
        }

        let has_idr = self.current_has_idr;
        let frame = self.current_frame.split().freeze();
        self.current_has_idr = false;
        let duration = self.frame_duration();

        if self.held.is_empty() && !(has_idr && self.cache.is_none()) {
            return vec![self.finish_unit(frame, has_idr, duration)];
        }

        self.held.push_back(HeldFrame {
            data: frame,
            contains_idr: has_idr,
            duration,
        });

        if self.cache.is_some() {
            return self.drain_held();
        }

        if self.held.len() > MAX_WARMUP_FRAMES {
            warn!("emitting withheld frames without cached SPS/PPS after warm-up window elapsed");
            return self.drain_held();
        }

        Vec::new()
    }

    fn drain_held(&mut self) -> Vec<AccessUnit> {
        let frames: Vec<HeldFrame> = self.held.drain(..).collect();
        frames
            .into_iter()
            .map(|h| self.finish_unit(h.data, h.contains_idr, h.duration))
            .collect()
    }

    fn finish_unit(&self, frame: Bytes, has_idr: bool, duration: Duration) -> AccessUnit {
        if has_idr {
            if let Some(cache) = &self.cache {
                let mut data = BytesMut::with_capacity(cache.concatenated.len() + frame.len());
                data.extend_from_slice(&cache.concatenated);
                data.extend_from_slice(&frame);
                return AccessUnit {
                    data: data.freeze(),
                    contains_idr: true,
                    duration,
                };
            }
        }
        AccessUnit {
            data: frame,
            contains_idr: has_idr,
            duration,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn start_code(len: usize) -> Vec<u8> {
        if len == 4 {
            vec![0, 0, 0, 1]
        } else {
            vec![0, 0, 1]
        }
    }

    fn nal(code_len: usize, header: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = start_code(code_len);
        v.push(header);
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn scenario_3_split_sps_across_chunks() {
        let mut asm = Assembler::new(30.0);
        let sps = nal(4, 0x67, &[0xAA, 0xBB, 0xCC]);
        let pps = nal(4, 0x68, &[0x11]);

        let split = sps.len() / 2;
        let chunk1 = &sps[..split];
        let chunk2 = [&sps[split..], &pps[..]].concat();

        let first = asm.feed(chunk1);
        assert!(first.is_empty());
        let second = asm.feed(&chunk2);
        assert!(second.is_empty(), "no access unit until a picture NAL arrives");

        let cache = asm.cache().expect("cache populated after SPS+PPS");
        assert_eq!(cache.sps.len(), sps.len());
        assert_eq!(cache.pps.len(), pps.len());
    }

    #[test]
    fn idr_gets_sps_pps_prefix_when_cache_present() {
        let mut asm = Assembler::new(30.0);
        let sps = nal(4, 0x67, &[1, 2, 3]);
        let pps = nal(4, 0x68, &[4]);
        let idr = nal(4, 0x65, &[9, 9]);
        let next = nal(4, 0x61, &[7]);

        let stream = [sps.clone(), pps.clone(), idr, next].concat();
        let units = asm.feed(&stream);

        assert_eq!(units.len(), 1);
        assert!(units[0].contains_idr);
        assert!(units[0].data.starts_with(&sps));
        assert!(units[0].data[sps.len()..].starts_with(&pps));
    }

    #[test]
    fn scenario_4_idr_without_cache_emitted_after_warmup() {
        let mut asm = Assembler::new(30.0);
        let idr = nal(4, 0x65, &[1]);
        asm.feed(&idr);

        let filler = nal(4, 0x61, &[2]);
        let mut all_emitted: Vec<AccessUnit> = Vec::new();
        for _ in 0..(MAX_WARMUP_FRAMES + 2) {
            all_emitted.extend(asm.feed(&filler));
        }

        assert!(!all_emitted.is_empty(), "withheld batch must flush once warm-up expires");
        assert!(all_emitted[0].contains_idr, "the withheld idr must surface first, not a later filler frame");
        assert!(all_emitted[1..].iter().all(|au| !au.contains_idr));
    }

    #[test]
    fn frames_after_an_unresolved_idr_do_not_overtake_it() {
        let mut asm = Assembler::new(30.0);
        let idr = nal(4, 0x65, &[0xAA]);
        let p2 = nal(4, 0x61, &[0xBB]);
        let p3 = nal(4, 0x61, &[0xCC]);

        assert!(asm.feed(&idr).is_empty());
        assert!(
            asm.feed(&p2).is_empty(),
            "idr must stay withheld while no parameter sets are cached"
        );
        assert!(
            asm.feed(&p3).is_empty(),
            "p2 must not be emitted ahead of the still-withheld idr"
        );

        let sps = nal(4, 0x67, &[1]);
        let pps = nal(4, 0x68, &[2]);
        let flushed = asm.feed(&[sps.clone(), pps].concat());

        assert_eq!(flushed.len(), 2, "idr and p2 flush together, in source order, once the cache arrives");
        assert!(flushed[0].contains_idr);
        assert!(flushed[0].data.starts_with(&sps));
        assert!(!flushed[1].contains_idr);
    }

    #[test]
    fn non_idr_frame_emitted_without_parameter_sets() {
        let mut asm = Assembler::new(30.0);
        let a = nal(4, 0x61, &[1]);
        let b = nal(4, 0x61, &[2]);
        let units = asm.feed(&[a, b].concat());
        assert_eq!(units.len(), 1);
        assert!(!units[0].contains_idr);
    }

    #[test]
    fn aud_finalises_without_being_retained() {
        let mut asm = Assembler::new(30.0);
        let pic = nal(4, 0x61, &[1]);
        let aud = nal(4, 0x09, &[]);
        let units = asm.feed(&[pic, aud].concat());
        assert_eq!(units.len(), 1);
        assert!(!units[0].data.windows(1).any(|w| w == [0x09]));
    }

    #[test]
    fn scan_buffer_truncates_from_head_on_overflow() {
        let mut asm = Assembler::new(30.0);
        let garbage = vec![0xFFu8; MAX_SCAN_BUFFER + 4096];
        let units = asm.feed(&garbage);
        assert!(units.is_empty());
        assert!(asm.scan_buf.len() <= MAX_SCAN_BUFFER);
    }
}
