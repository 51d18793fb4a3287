//! DWARF call frame information: finding it, decoding it and running it
//!
//! # how it works
//! first, we find the `.eh_frame_hdr` of the object containing a pc (see
//! [`divination`]) and search it for the FDE covering that pc. then, we parse
//! that as beautiful DWARF call frame information, as god (or rather, the
//! x86-64 psABI) intended.
//!
//! for this we need a DWARF parser ([`parse`]), a DWARF call frame information
//! interpreter ([`prolog`], yes, that shit is basically a programming language)
//! and an evaluator for the DWARF expressions embedded in it ([`expr`]).
//! See <https://dwarfstd.org/doc/DWARF5.pdf> if more information is desired.

pub mod divination;
pub mod expr;
pub mod parse;
pub mod prolog;

#[cfg(test)]
pub(crate) mod testutil;
