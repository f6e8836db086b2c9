// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Best-effort stack walk over the frame-pointer chain.
//!
//! On x86_64 and aarch64 every function built with frame pointers saves the caller's frame
//! pointer at `[fp]` and the return address at `[fp + word]`.  Following that chain needs no
//! unwind tables and no allocation, so it can run inside a signal handler.  Every step is
//! validated: the next frame must be word aligned, strictly above the current one, and within
//! [`MAX_FRAME_STRIDE`] of it.  Reads go through [`read_word`], so a corrupted chain ends the
//! walk instead of faulting.

use super::platform::{read_word, Registers};

const WORD: usize = std::mem::size_of::<usize>();

/// Largest distance accepted between two consecutive frame pointers.
pub(crate) const MAX_FRAME_STRIDE: usize = 8 << 20;

/// A raw stack frame containing register values.
///
/// - `ip`: Instruction pointer (RIP on x86_64, PC on aarch64)
/// - `sp`: Stack pointer (RSP on x86_64, SP on aarch64)
/// - `bp`: Base/frame pointer (RBP on x86_64, FP/X29 on aarch64)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RawFrame {
    /// Instruction pointer (return address for this frame)
    pub ip: usize,
    /// Stack pointer at this frame
    pub sp: usize,
    /// Base/frame pointer at this frame
    pub bp: usize,
}

/// Fills `frames` starting from the interrupted frame and returns how many were written.
///
/// SIGNAL SAFETY:
///     No allocation, no locks.  Memory is only read through [`read_word`].
pub(crate) fn walk_frame_pointers(regs: &Registers, frames: &mut [RawFrame]) -> usize {
    let Some(first) = frames.first_mut() else {
        return 0;
    };
    *first = RawFrame {
        ip: regs.ip,
        sp: regs.sp,
        bp: regs.fp,
    };
    let mut count = 1;

    let mut lower_bound = regs.sp;
    let mut fp = regs.fp;
    while count < frames.len() {
        if fp % WORD != 0 || fp < lower_bound || fp - lower_bound > MAX_FRAME_STRIDE {
            break;
        }
        let Some(next_fp) = read_word(fp) else {
            break;
        };
        let Some(return_address) = read_word(fp + WORD) else {
            break;
        };
        if return_address == 0 {
            break;
        }
        frames[count] = RawFrame {
            ip: return_address,
            sp: fp + 2 * WORD,
            bp: next_fp,
        };
        count += 1;

        // The chain has to move towards the stack base, anything else is a loop or garbage.
        if next_fp <= fp {
            break;
        }
        lower_bound = fp + 2 * WORD;
        fp = next_fp;
    }
    count
}
