// Locating a script archive appended to the launcher image.
//
// The scanning functions work on byte slices. `find_shebang` is the thin
// adapter that performs the bounded reads from the launcher file.

use crate::error::LaunchError;
use std::io::{self, Read, Seek, SeekFrom};

/// Bytes read when looking for the shebang line, and for the first tail scan.
pub const SHEBANG_WINDOW: usize = 1024;

/// Second, larger tail scan. An archive comment can be up to 64K, and some
/// tools place more data behind the end record.
pub const LARGE_TAIL_WINDOW: usize = 65 * 1024 * 1024;

// Fixed part of the end-of-central-directory record.
const END_RECORD_LEN: usize = 22;
const DIRECTORY_SIZE_AT: usize = 12;
const DIRECTORY_OFFSET_AT: usize = 16;

// Zip64 archives store this in the 32-bit fields and keep the real values
// in a separate locator record.
const ZIP64_SENTINEL: u32 = u32::MAX;

const SHEBANG_MARKER: &[u8] = b"#!";

// The signature is assembled at run time so the launcher's own image does not
// contain it; otherwise a plain launcher would "find" an archive in itself.
fn end_record_signature() -> [u8; 4] {
    let mut sig = [0x00, 0x4B, 0x05, 0x06];
    sig[0] = std::hint::black_box(0x50);
    sig
}

/// Trailing directory record of an appended archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndRecord {
    /// Absolute file offset of the record's signature.
    pub offset: u64,
    pub directory_size: u32,
    pub directory_offset: u32,
}

impl EndRecord {
    /// Offset where the appended payload begins.
    pub fn archive_start(&self) -> Result<u64, LaunchError> {
        if self.directory_size == ZIP64_SENTINEL || self.directory_offset == ZIP64_SENTINEL {
            return Err(LaunchError::UnsupportedArchive(
                "Zip64 end records are not handled".to_string(),
            ));
        }

        let span = u64::from(self.directory_size) + u64::from(self.directory_offset);
        self.offset.checked_sub(span).ok_or_else(|| {
            LaunchError::AppendedArchiveNotFound(format!(
                "directory record at {} declares {} bytes before it",
                self.offset, span
            ))
        })
    }
}

/// Offset of the last occurrence of `needle` in `haystack`.
pub fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|window| window == needle)
}

/// Scan `window` (which starts at absolute offset `window_offset`) for the
/// right-most complete end record.
pub fn find_end_record(window: &[u8], window_offset: u64) -> Option<EndRecord> {
    let sig = end_record_signature();
    let mut limit = window.len();

    while let Some(pos) = rfind(&window[..limit], &sig) {
        if let Some(record) = window.get(pos..pos + END_RECORD_LEN) {
            return Some(EndRecord {
                offset: window_offset + pos as u64,
                directory_size: read_u32_le(record, DIRECTORY_SIZE_AT),
                directory_offset: read_u32_le(record, DIRECTORY_OFFSET_AT),
            });
        }
        // Truncated by the end of the file, so it cannot be the real record.
        limit = pos + sig.len() - 1;
    }
    None
}

fn read_u32_le(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Bytes starting at the shebang marker, if the window opens with one.
pub fn shebang_at_start(window: &[u8]) -> Option<&[u8]> {
    window.starts_with(SHEBANG_MARKER).then_some(window)
}

/// Bytes starting at the last shebang marker in `window`.
pub fn last_shebang(window: &[u8]) -> Option<&[u8]> {
    rfind(window, SHEBANG_MARKER).map(|pos| &window[pos..])
}

fn read_window<R: Read + Seek>(reader: &mut R, start: u64, len: usize) -> io::Result<Vec<u8>> {
    // Reserve only what the source can actually supply.
    let end = reader.seek(SeekFrom::End(0))?;
    let available = end.saturating_sub(start).min(len as u64) as usize;
    reader.seek(SeekFrom::Start(start))?;
    let mut buf = Vec::with_capacity(available);
    reader.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

fn scan_tail<R: Read + Seek>(
    reader: &mut R,
    file_size: u64,
    window: usize,
) -> io::Result<Option<EndRecord>> {
    let start = file_size.saturating_sub(window as u64);
    let tail = read_window(reader, start, window)?;
    Ok(find_end_record(&tail, start))
}

/// Locate the appended archive's end record: a small tail window first, then
/// the large one.
pub fn locate_end_record<R: Read + Seek>(
    reader: &mut R,
    small_window: usize,
    large_window: usize,
) -> io::Result<Option<EndRecord>> {
    let file_size = reader.seek(SeekFrom::End(0))?;

    if let Some(record) = scan_tail(reader, file_size, small_window)? {
        return Ok(Some(record));
    }
    log::debug!("End record not in the last {small_window} bytes, retrying with {large_window}");
    scan_tail(reader, file_size, large_window)
}

/// Find the shebang line of the archive appended to `reader`.
///
/// Archive writers disagree on whether the directory offset accounts for
/// data prepended to the archive, so the computed start can be either the
/// beginning of the shebang line (zipapp style) or just past it (plain
/// concatenation). The forward case is tried first.
///
/// Returns the bytes from the `#!` marker onwards, and whether they run to
/// the end of the file.
pub fn find_shebang<R: Read + Seek>(reader: &mut R) -> Result<(Vec<u8>, bool), LaunchError> {
    let io_err = |e: io::Error| LaunchError::AppendedArchiveNotFound(e.to_string());

    let record = locate_end_record(reader, SHEBANG_WINDOW, LARGE_TAIL_WINDOW)
        .map_err(io_err)?
        .ok_or_else(|| {
            LaunchError::AppendedArchiveNotFound("no end-of-directory record".to_string())
        })?;
    let start = record.archive_start()?;
    log::debug!("End record at {}, archive starts at {}", record.offset, start);

    let forward = read_window(reader, start, SHEBANG_WINDOW).map_err(io_err)?;
    if forward.is_empty() {
        return Err(LaunchError::AppendedArchiveNotFound(format!(
            "nothing to read at offset {start}"
        )));
    }
    if shebang_at_start(&forward).is_some() {
        let complete = forward.len() < SHEBANG_WINDOW;
        return Ok((forward, complete));
    }

    let back_start = start.saturating_sub(SHEBANG_WINDOW as u64);
    // start - back_start is at most SHEBANG_WINDOW
    let backward = read_window(reader, back_start, (start - back_start) as usize).map_err(io_err)?;
    last_shebang(&backward)
        .map(|line| (line.to_vec(), false))
        .ok_or(LaunchError::ShebangNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn window_is_sized_to_what_the_source_holds() {
        let mut cursor = Cursor::new(vec![7u8; 100]);
        let buf = read_window(&mut cursor, 10, LARGE_TAIL_WINDOW).unwrap();
        assert_eq!(buf.len(), 90);
        assert!(buf.capacity() < SHEBANG_WINDOW);

        assert!(read_window(&mut cursor, 200, LARGE_TAIL_WINDOW).unwrap().is_empty());
    }

    fn end_record(directory_size: u32, directory_offset: u32) -> Vec<u8> {
        let mut record = Vec::with_capacity(END_RECORD_LEN);
        record.extend_from_slice(&end_record_signature());
        record.extend_from_slice(&[0u8; 8]);
        record.extend_from_slice(&directory_size.to_le_bytes());
        record.extend_from_slice(&directory_offset.to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes());
        record
    }

    // An empty archive: nothing but the end record. `prefix_in_offset` makes
    // the directory offset count the shebang, the way zipapp writes it.
    fn launcher_image(stub: &[u8], shebang: &[u8], prefix_in_offset: bool) -> Vec<u8> {
        let mut image = stub.to_vec();
        image.extend_from_slice(shebang);
        let offset = if prefix_in_offset { shebang.len() as u32 } else { 0 };
        image.extend_from_slice(&end_record(0, offset));
        image
    }

    #[test]
    fn signature_is_the_zip_end_record_marker() {
        assert_eq!(&end_record_signature(), b"PK\x05\x06");
    }

    #[test]
    fn rightmost_record_wins() {
        let mut data = b"stub".to_vec();
        data.extend_from_slice(&end_record(1, 2));
        data.extend_from_slice(b"payload");
        let second = data.len();
        data.extend_from_slice(&end_record(3, 4));

        let record = find_end_record(&data, 100).unwrap();
        assert_eq!(record.offset, 100 + second as u64);
        assert_eq!(record.directory_size, 3);
        assert_eq!(record.directory_offset, 4);
    }

    #[test]
    fn truncated_trailing_signature_is_skipped() {
        let mut data = end_record(5, 6);
        data.extend_from_slice(&end_record_signature());
        data.extend_from_slice(&[0u8; 4]);

        let record = find_end_record(&data, 0).unwrap();
        assert_eq!(record.offset, 0);
        assert_eq!(record.directory_size, 5);
    }

    #[test]
    fn no_signature_means_no_record() {
        assert_eq!(find_end_record(b"just a plain executable", 0), None);
    }

    #[test]
    fn large_window_finds_record_beyond_small_window() {
        let mut data = end_record(0, 0);
        data.extend_from_slice(&vec![b'x'; 4096]);

        let mut reader = Cursor::new(data);
        let record = locate_end_record(&mut reader, 512, 64 * 1024).unwrap().unwrap();
        assert_eq!(record.offset, 0);

        let mut reader = Cursor::new(reader.into_inner());
        assert_eq!(locate_end_record(&mut reader, 512, 1024).unwrap(), None);
    }

    #[test]
    fn archive_start_subtracts_directory_span() {
        let record = EndRecord { offset: 1000, directory_size: 100, directory_offset: 400 };
        assert_eq!(record.archive_start().unwrap(), 500);

        let bogus = EndRecord { offset: 10, directory_size: 100, directory_offset: 0 };
        assert!(matches!(
            bogus.archive_start(),
            Err(LaunchError::AppendedArchiveNotFound(_))
        ));
    }

    #[test]
    fn zip64_sentinels_are_reported() {
        let record = EndRecord { offset: 1000, directory_size: 0, directory_offset: u32::MAX };
        assert!(matches!(record.archive_start(), Err(LaunchError::UnsupportedArchive(_))));
    }

    #[test]
    fn shebang_found_at_computed_offset() {
        let image = launcher_image(b"MZ stub", b"#!\"C:\\py\\py.exe\"\r\n", true);
        let (bytes, _) = find_shebang(&mut Cursor::new(image)).unwrap();
        assert!(bytes.starts_with(b"#!\"C:\\py\\py.exe\"\r\n"));
    }

    #[test]
    fn shebang_found_by_scanning_backward() {
        let image = launcher_image(b"MZ #! stub", b"#!C:\\py\\py.exe -u\n", false);
        let (bytes, complete) = find_shebang(&mut Cursor::new(image)).unwrap();
        assert_eq!(bytes, b"#!C:\\py\\py.exe -u\n");
        assert!(!complete);
    }

    #[test]
    fn missing_archive_is_reported() {
        let err = find_shebang(&mut Cursor::new(b"MZ plain stub".to_vec())).unwrap_err();
        assert!(matches!(err, LaunchError::AppendedArchiveNotFound(_)));
    }

    #[test]
    fn archive_without_shebang_is_reported() {
        let image = launcher_image(b"MZ stub", b"no marker here\n", false);
        let err = find_shebang(&mut Cursor::new(image)).unwrap_err();
        assert!(matches!(err, LaunchError::ShebangNotFound));
    }
}
