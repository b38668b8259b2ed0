//! Shared adapter memory (SLIM).
//!
//! Holds the mailbox, the ring index words of both sides, and the ring slots.
//! The host and the adapter access it concurrently, so every word is atomic:
//!
//! - index words written by the other side are read with `Acquire`,
//! - slot contents are written with `Relaxed` stores and made visible by a
//!   `Release` fence before the index that covers them is stored,
//! - an index store must precede the doorbell that announces it.
//!
//! Ring accessors take ring numbers from the adapter configuration and
//! panic on one outside it. [`Hba`](super::Hba) checks ring numbers coming
//! from callers.

use std::sync::atomic::{AtomicU32, Ordering, fence};

use crate::config::HbaConfig;

use super::iocb::{IOCB_SIZE, IOCB_WORDS, Iocb};
use super::mailbox::MAILBOX_WORDS;

/// Index words of one ring.
#[derive(Debug, Default)]
struct RingIndices {
    /// Written by the host: next command slot the host will fill.
    cmd_put: AtomicU32,
    /// Written by the host: next response slot the host will read.
    rsp_get: AtomicU32,
    /// Written by the adapter: next command slot the adapter will read.
    cmd_get: AtomicU32,
    /// Written by the adapter: next response slot the adapter will fill.
    rsp_put: AtomicU32,
}

#[derive(Debug)]
struct RingMemory {
    cmd_entries: u32,
    rsp_entries: u32,
    cmd: Box<[AtomicU32]>,
    rsp: Box<[AtomicU32]>,
    indices: RingIndices,
}

fn zeroed(words: usize) -> Box<[AtomicU32]> {
    (0..words).map(|_| AtomicU32::new(0)).collect()
}

impl RingMemory {
    fn new(cmd_entries: u32, rsp_entries: u32) -> Self {
        Self {
            cmd_entries,
            rsp_entries,
            cmd: zeroed(cmd_entries as usize * IOCB_WORDS),
            rsp: zeroed(rsp_entries as usize * IOCB_WORDS),
            indices: RingIndices::default(),
        }
    }
}

fn write_slot(slots: &[AtomicU32], idx: u32, iocb: &Iocb) {
    let base = idx as usize * IOCB_WORDS;
    for (word, value) in slots[base..base + IOCB_WORDS].iter().zip(iocb.to_words()) {
        word.store(value, Ordering::Relaxed);
    }
}

fn read_slot(slots: &[AtomicU32], idx: u32) -> Iocb {
    let base = idx as usize * IOCB_WORDS;
    let mut words = [0u32; IOCB_WORDS];
    for (value, word) in words.iter_mut().zip(&slots[base..base + IOCB_WORDS]) {
        *value = word.load(Ordering::Relaxed);
    }
    Iocb::from_words(&words)
}

/// The memory region shared between host and adapter.
#[derive(Debug)]
pub struct Slim {
    mailbox: Box<[AtomicU32]>,
    rings: Vec<RingMemory>,
}

impl Slim {
    pub fn new(config: &HbaConfig) -> Self {
        Self {
            mailbox: zeroed(MAILBOX_WORDS),
            rings: config
                .rings
                .iter()
                .map(|r| RingMemory::new(r.cmd_entries, r.rsp_entries))
                .collect(),
        }
    }

    pub fn ring_count(&self) -> usize {
        self.rings.len()
    }

    pub fn cmd_entries(&self, ringno: usize) -> u32 {
        self.rings[ringno].cmd_entries
    }

    pub fn rsp_entries(&self, ringno: usize) -> u32 {
        self.rings[ringno].rsp_entries
    }

    /// Zeroes the mailbox, every slot and every index.
    pub fn reset(&self) {
        for word in self.mailbox.iter() {
            word.store(0, Ordering::Relaxed);
        }
        for ring in &self.rings {
            for word in ring.cmd.iter().chain(ring.rsp.iter()) {
                word.store(0, Ordering::Relaxed);
            }
            ring.indices.cmd_put.store(0, Ordering::Relaxed);
            ring.indices.rsp_get.store(0, Ordering::Relaxed);
            ring.indices.cmd_get.store(0, Ordering::Relaxed);
            ring.indices.rsp_put.store(0, Ordering::Relaxed);
        }
        fence(Ordering::SeqCst);
    }

    // Mailbox, used by both sides. Word 0 carries the owner bit and is
    // written last / read first.

    pub fn write_mailbox(&self, words: &[u32; MAILBOX_WORDS]) {
        for (word, value) in self.mailbox.iter().zip(words).skip(1) {
            word.store(*value, Ordering::Relaxed);
        }
        self.mailbox[0].store(words[0], Ordering::Release);
    }

    pub fn read_mailbox(&self) -> [u32; MAILBOX_WORDS] {
        let mut words = [0u32; MAILBOX_WORDS];
        words[0] = self.mailbox[0].load(Ordering::Acquire);
        for (value, word) in words.iter_mut().zip(self.mailbox.iter()).skip(1) {
            *value = word.load(Ordering::Relaxed);
        }
        words
    }

    pub fn mailbox_word0(&self) -> u32 {
        self.mailbox[0].load(Ordering::Acquire)
    }

    // Host side of the rings.

    pub fn write_cmd_slot(&self, ringno: usize, idx: u32, iocb: &Iocb) {
        write_slot(&self.rings[ringno].cmd, idx, iocb);
    }

    pub fn read_rsp_slot(&self, ringno: usize, idx: u32) -> Iocb {
        read_slot(&self.rings[ringno].rsp, idx)
    }

    /// Makes every slot written so far visible, then moves the command put
    /// index.
    pub fn publish_cmd_put(&self, ringno: usize, idx: u32) {
        fence(Ordering::Release);
        self.rings[ringno]
            .indices
            .cmd_put
            .store(idx, Ordering::Release);
    }

    pub fn publish_rsp_get(&self, ringno: usize, idx: u32) {
        self.rings[ringno]
            .indices
            .rsp_get
            .store(idx, Ordering::Release);
    }

    /// Fresh snapshot of the adapter's command get index.
    pub fn device_cmd_get(&self, ringno: usize) -> u32 {
        self.rings[ringno].indices.cmd_get.load(Ordering::Acquire)
    }

    /// Fresh snapshot of the adapter's response put index.
    pub fn device_rsp_put(&self, ringno: usize) -> u32 {
        self.rings[ringno].indices.rsp_put.load(Ordering::Acquire)
    }

    // Adapter side of the rings.

    pub fn host_cmd_put(&self, ringno: usize) -> u32 {
        self.rings[ringno].indices.cmd_put.load(Ordering::Acquire)
    }

    pub fn host_rsp_get(&self, ringno: usize) -> u32 {
        self.rings[ringno].indices.rsp_get.load(Ordering::Acquire)
    }

    /// Little endian image of a command slot, the way the adapter fetches
    /// it. Decode with [`Iocb::from_bytes`].
    pub fn read_cmd_bytes(&self, ringno: usize, idx: u32) -> [u8; IOCB_SIZE] {
        let base = idx as usize * IOCB_WORDS;
        let slots = &self.rings[ringno].cmd[base..base + IOCB_WORDS];
        let mut out = [0u8; IOCB_SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(slots) {
            chunk.copy_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        out
    }

    pub fn write_rsp_slot(&self, ringno: usize, idx: u32, iocb: &Iocb) {
        write_slot(&self.rings[ringno].rsp, idx, iocb);
    }

    pub fn set_device_cmd_get(&self, ringno: usize, idx: u32) {
        self.rings[ringno]
            .indices
            .cmd_get
            .store(idx, Ordering::Release);
    }

    pub fn set_device_rsp_put(&self, ringno: usize, idx: u32) {
        fence(Ordering::Release);
        self.rings[ringno]
            .indices
            .rsp_put
            .store(idx, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sli::iocb::IocbCommand;

    #[test]
    fn slot_written_by_host_is_read_by_device() {
        let slim = Slim::new(&HbaConfig::default());
        let mut iocb = Iocb::command(IocbCommand::FcpIwriteCr);
        iocb.context = 5;
        iocb.iotag = 77;
        slim.write_cmd_slot(1, 3, &iocb);
        slim.publish_cmd_put(1, 4);

        assert_eq!(slim.host_cmd_put(1), 4);
        assert_eq!(Iocb::from_bytes(&slim.read_cmd_bytes(1, 3)).unwrap(), iocb);
        assert_eq!(slim.read_cmd_bytes(1, 2), [0u8; IOCB_SIZE]);
    }

    #[test]
    fn command_image_decodes_or_reports_reserved_bits() {
        let slim = Slim::new(&HbaConfig::default());
        let mut iocb = Iocb::command(IocbCommand::ElsRequestCr);
        iocb.iotag = 9;
        slim.write_cmd_slot(0, 1, &iocb);
        assert_eq!(Iocb::from_bytes(&slim.read_cmd_bytes(0, 1)).unwrap(), iocb);

        // word 7 of slot 1, bit 4
        slim.rings[0].cmd[IOCB_WORDS + 7].fetch_or(0x10, Ordering::Relaxed);
        Iocb::from_bytes(&slim.read_cmd_bytes(0, 1)).expect_err("reserved bit is set");
    }

    #[test]
    fn reset_clears_indices() {
        let slim = Slim::new(&HbaConfig::default());
        slim.publish_cmd_put(0, 3);
        slim.set_device_rsp_put(0, 2);
        slim.reset();
        assert_eq!(slim.host_cmd_put(0), 0);
        assert_eq!(slim.device_rsp_put(0), 0);
    }
}
