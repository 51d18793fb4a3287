//! Hand assembly of `.eh_frame` sections for tests.

use alloc::vec::Vec;

/// Lays out CIEs and FDEs as they would appear at `base`. FDE addresses are
/// written as `pcrel | sdata4` if the CIE augmentation data starts with
/// `0x1b`, as absolute pointers otherwise.
pub(crate) struct EhFrameBuilder {
    base: usize,
    bytes: Vec<u8>,
    cies: Vec<(usize, bool)>,
}

impl EhFrameBuilder {
    pub(crate) fn new(base: usize) -> Self {
        Self {
            base,
            bytes: Vec::new(),
            cies: Vec::new(),
        }
    }

    fn here(&self) -> usize {
        self.base + self.bytes.len()
    }

    fn uleb(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    fn sleb(&mut self, mut value: i64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
            if done {
                self.bytes.push(byte);
                return;
            }
            self.bytes.push(byte | 0x80);
        }
    }

    /// Pads with `DW_CFA_nop` and patches the length field at `start`.
    fn close(&mut self, start: usize) {
        while (self.bytes.len() - start) % core::mem::size_of::<usize>() != 0 {
            self.bytes.push(0);
        }
        let length = (self.bytes.len() - start - 4) as u32;
        self.bytes[start..start + 4].copy_from_slice(&length.to_ne_bytes());
    }

    /// Appends a version 1 CIE. `augmentation` must start with `z`.
    pub(crate) fn cie(
        &mut self,
        augmentation: &str,
        augmentation_data: &[u8],
        code_alignment_factor: u64,
        data_alignment_factor: i64,
        return_address_register: u8,
        instructions: &[u8],
    ) -> usize {
        let address = self.here();
        let start = self.bytes.len();
        self.bytes.extend_from_slice(&[0; 4]);
        self.bytes.extend_from_slice(&0u32.to_ne_bytes());
        self.bytes.push(1);
        self.bytes.extend_from_slice(augmentation.as_bytes());
        self.bytes.push(0);
        self.uleb(code_alignment_factor);
        self.sleb(data_alignment_factor);
        self.bytes.push(return_address_register);
        self.uleb(augmentation_data.len() as u64);
        self.bytes.extend_from_slice(augmentation_data);
        self.bytes.extend_from_slice(instructions);
        self.close(start);

        let pcrel = augmentation.contains('R') && augmentation_data.first() == Some(&0x1b);
        self.cies.push((address, pcrel));
        address
    }

    pub(crate) fn fde(
        &mut self,
        cie: usize,
        pc_begin: usize,
        pc_range: usize,
        augmentation_data: &[u8],
        instructions: &[u8],
    ) -> usize {
        let pcrel = self
            .cies
            .iter()
            .find(|(address, _)| *address == cie)
            .map(|(_, pcrel)| *pcrel)
            .unwrap_or(false);

        let address = self.here();
        let start = self.bytes.len();
        self.bytes.extend_from_slice(&[0; 4]);
        let cie_pointer = (self.here() - cie) as u32;
        self.bytes.extend_from_slice(&cie_pointer.to_ne_bytes());
        if pcrel {
            let field = self.here() as i64;
            self.bytes
                .extend_from_slice(&((pc_begin as i64 - field) as i32).to_ne_bytes());
            self.bytes.extend_from_slice(&(pc_range as u32).to_ne_bytes());
        } else {
            self.bytes.extend_from_slice(&pc_begin.to_ne_bytes());
            self.bytes.extend_from_slice(&pc_range.to_ne_bytes());
        }
        self.uleb(augmentation_data.len() as u64);
        self.bytes.extend_from_slice(augmentation_data);
        self.bytes.extend_from_slice(instructions);
        self.close(start);
        address
    }

    /// The section bytes, with the zero terminator.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.bytes.extend_from_slice(&0u32.to_ne_bytes());
        self.bytes
    }
}
