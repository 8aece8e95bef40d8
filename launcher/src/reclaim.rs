// Deciding which handles the launcher may release once the child is running.
//
// Only the planning lives here; the Win32 side calls these and performs the
// closes. Handles are compared as raw `usize` values.

use std::mem::size_of;

const INVALID: usize = usize::MAX; // -1
const PSEUDO: usize = usize::MAX - 1; // -2

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Input,
    Output,
    Error,
}

impl StdStream {
    pub fn name(self) -> &'static str {
        match self {
            StdStream::Input => "stdin",
            StdStream::Output => "stdout",
            StdStream::Error => "stderr",
        }
    }
}

/// Raw values of the process's current standard handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StdHandles {
    pub input: usize,
    pub output: usize,
    pub error: usize,
}

fn is_valid(handle: usize) -> bool {
    handle != 0 && handle != INVALID && handle != PSEUDO
}

impl StdHandles {
    fn contains(&self, handle: usize) -> bool {
        handle == self.input || handle == self.output || handle == self.error
    }

    /// Standard handles the launcher should close after the spawn.
    ///
    /// stderr stays open for diagnostics. When any two valid handles share a
    /// value nothing is closed, so one object is never closed twice.
    pub fn to_close(&self) -> Vec<(StdStream, usize)> {
        let valid: Vec<usize> = [self.input, self.output, self.error]
            .into_iter()
            .filter(|&h| is_valid(h))
            .collect();
        let shared = valid
            .iter()
            .enumerate()
            .any(|(i, h)| valid[i + 1..].contains(h));
        if shared {
            return Vec::new();
        }

        [(StdStream::Input, self.input), (StdStream::Output, self.output)]
            .into_iter()
            .filter(|&(_, h)| is_valid(h))
            .collect()
    }
}

/// Handles listed in an inherited C-runtime descriptor block that the
/// launcher may close.
///
/// The block is `<i32 count><count flag bytes><count handle values>`, handle
/// values being pointer-sized. Descriptors 0-2 belong to the standard
/// streams and are skipped, as are sentinel values and anything that is
/// currently a standard handle. A block too short for its declared count
/// yields nothing.
pub fn inherited_descriptor_handles(block: &[u8], std: &StdHandles) -> Vec<usize> {
    let Some(count) = block.get(..4).map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]])) else {
        return Vec::new();
    };
    let Ok(count) = usize::try_from(count) else {
        return Vec::new();
    };

    let handles_at = 4usize.saturating_add(count);
    let table_len = count.saturating_mul(size_of::<usize>());
    let Some(table) = block.get(handles_at..handles_at.saturating_add(table_len)) else {
        return Vec::new();
    };

    table
        .chunks_exact(size_of::<usize>())
        .take(count)
        .skip(3)
        .filter_map(|raw| raw.try_into().ok().map(usize::from_le_bytes))
        .filter(|&h| is_valid(h) && !std.contains(h))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_handles_close_input_and_output_only() {
        let std = StdHandles { input: 0x10, output: 0x14, error: 0x18 };
        assert_eq!(
            std.to_close(),
            vec![(StdStream::Input, 0x10), (StdStream::Output, 0x14)]
        );
    }

    #[test]
    fn shared_input_and_output_close_nothing() {
        let std = StdHandles { input: 0x10, output: 0x10, error: 0x18 };
        assert!(std.to_close().is_empty());
    }

    #[test]
    fn shared_output_and_error_close_nothing() {
        let std = StdHandles { input: 0x10, output: 0x14, error: 0x14 };
        assert!(std.to_close().is_empty());
    }

    #[test]
    fn missing_handles_are_not_counted_as_shared() {
        let std = StdHandles { input: 0, output: 0, error: 0x18 };
        assert!(std.to_close().is_empty());

        let std = StdHandles { input: INVALID, output: 0x14, error: INVALID };
        assert_eq!(std.to_close(), vec![(StdStream::Output, 0x14)]);
    }

    fn block(handles: &[usize]) -> Vec<u8> {
        let mut out = (handles.len() as i32).to_le_bytes().to_vec();
        out.extend(std::iter::repeat(0x01u8).take(handles.len()));
        for h in handles {
            out.extend_from_slice(&h.to_le_bytes());
        }
        out
    }

    #[test]
    fn descriptor_block_skips_standard_slots_and_sentinels() {
        let std = StdHandles { input: 0x10, output: 0x14, error: 0x18 };
        let data = block(&[0x10, 0x14, 0x18, 0x40, 0, INVALID, PSEUDO, 0x44, 0x14]);
        assert_eq!(inherited_descriptor_handles(&data, &std), vec![0x40, 0x44]);
    }

    #[test]
    fn malformed_blocks_yield_nothing() {
        let std = StdHandles::default();
        assert!(inherited_descriptor_handles(&[], &std).is_empty());
        assert!(inherited_descriptor_handles(&(-3i32).to_le_bytes(), &std).is_empty());

        let mut data = block(&[1, 2, 3, 0x40, 0x44]);
        data.truncate(data.len() - 1);
        assert!(inherited_descriptor_handles(&data, &std).is_empty());
    }
}
