//! Minimal EXIF handling for orientation correction.
//!
//! Three operations on a raw EXIF block (a TIFF structure, optionally
//! preceded by the `Exif\0\0` APP1 header):
//! - read the Orientation tag (`0x0112`) from IFD0
//! - rewrite it to 1 ("upright") once the pixels have been rotated
//! - embed the block into an encoded JPEG as an APP1 segment
//!
//! Anything malformed is an [`ExifError`]. The render worker treats that as a
//! metadata-handling failure and retries the save without metadata.

use thiserror::Error;

const EXIF_HEADER: &[u8] = b"Exif\0\0";
const ORIENTATION_TAG: u16 = 0x0112;
const TYPE_SHORT: u16 = 3;
const UPRIGHT: u16 = 1;

/// Largest payload an APP1 segment can carry (length field includes itself).
const MAX_APP1_PAYLOAD: usize = u16::MAX as usize - 2;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExifError {
    #[error("EXIF block truncated at offset {0}")]
    Truncated(usize),
    #[error("unknown TIFF byte order")]
    ByteOrder,
    #[error("bad TIFF magic number {0}")]
    Magic(u16),
    #[error("orientation tag has type {0}, expected SHORT")]
    OrientationType(u16),
    #[error("EXIF block of {0} bytes does not fit in an APP1 segment")]
    TooLarge(usize),
    #[error("encoded output is not a JPEG stream")]
    NotJpeg,
}

/// Byte offset of the TIFF header inside an EXIF block.
fn tiff_start(exif: &[u8]) -> usize {
    if exif.starts_with(EXIF_HEADER) {
        EXIF_HEADER.len()
    } else {
        0
    }
}

/// Find the orientation value inside `exif`.
///
/// Returns the absolute offset of the SHORT value and the byte order, or
/// `None` when IFD0 has no orientation entry.
fn locate_orientation(exif: &[u8]) -> Result<Option<(usize, bool)>, ExifError> {
    let base = tiff_start(exif);
    let data = &exif[base..];
    if data.len() < 8 {
        return Err(ExifError::Truncated(data.len()));
    }

    let big_endian = match &data[0..2] {
        b"MM" => true,
        b"II" => false,
        _ => return Err(ExifError::ByteOrder),
    };

    let read_u16 = |offset: usize| -> Result<u16, ExifError> {
        let bytes = data
            .get(offset..offset + 2)
            .ok_or(ExifError::Truncated(offset))?;
        Ok(if big_endian {
            u16::from_be_bytes([bytes[0], bytes[1]])
        } else {
            u16::from_le_bytes([bytes[0], bytes[1]])
        })
    };

    let read_u32 = |offset: usize| -> Result<u32, ExifError> {
        let bytes = data
            .get(offset..offset + 4)
            .ok_or(ExifError::Truncated(offset))?;
        let arr = [bytes[0], bytes[1], bytes[2], bytes[3]];
        Ok(if big_endian {
            u32::from_be_bytes(arr)
        } else {
            u32::from_le_bytes(arr)
        })
    };

    let magic = read_u16(2)?;
    if magic != 42 {
        return Err(ExifError::Magic(magic));
    }

    let ifd = read_u32(4)? as usize;
    let entry_count = read_u16(ifd)? as usize;
    for i in 0..entry_count {
        let entry = ifd + 2 + i * 12;
        if entry + 12 > data.len() {
            return Err(ExifError::Truncated(entry));
        }
        if read_u16(entry)? != ORIENTATION_TAG {
            continue;
        }
        let typ = read_u16(entry + 2)?;
        if typ != TYPE_SHORT {
            return Err(ExifError::OrientationType(typ));
        }
        // A single SHORT is stored left-justified in the value field
        return Ok(Some((base + entry + 8, big_endian)));
    }
    Ok(None)
}

/// Orientation tag value, if present.
pub fn orientation(exif: &[u8]) -> Result<Option<u16>, ExifError> {
    Ok(locate_orientation(exif)?.map(|(offset, big_endian)| {
        let bytes = [exif[offset], exif[offset + 1]];
        if big_endian {
            u16::from_be_bytes(bytes)
        } else {
            u16::from_le_bytes(bytes)
        }
    }))
}

/// Rewrite the orientation tag to "upright" in place.
///
/// Returns whether a tag was found.
pub fn reset_orientation(exif: &mut [u8]) -> Result<bool, ExifError> {
    let Some((offset, big_endian)) = locate_orientation(exif)? else {
        return Ok(false);
    };
    let bytes = if big_endian {
        UPRIGHT.to_be_bytes()
    } else {
        UPRIGHT.to_le_bytes()
    };
    exif[offset..offset + 2].copy_from_slice(&bytes);
    Ok(true)
}

/// Insert `exif` as an APP1 segment right after the SOI marker of `jpeg`.
pub fn embed_in_jpeg(jpeg: &[u8], exif: &[u8]) -> Result<Vec<u8>, ExifError> {
    if !jpeg.starts_with(&[0xFF, 0xD8]) {
        return Err(ExifError::NotJpeg);
    }
    // Validate before writing so a broken block never reaches the output
    locate_orientation(exif)?;

    let header: &[u8] = if exif.starts_with(EXIF_HEADER) {
        &[]
    } else {
        EXIF_HEADER
    };
    let payload_len = header.len() + exif.len();
    if payload_len > MAX_APP1_PAYLOAD {
        return Err(ExifError::TooLarge(payload_len));
    }
    let segment_len = (payload_len + 2) as u16;

    let mut out = Vec::with_capacity(jpeg.len() + payload_len + 4);
    out.extend_from_slice(&jpeg[..2]);
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&segment_len.to_be_bytes());
    out.extend_from_slice(header);
    out.extend_from_slice(exif);
    out.extend_from_slice(&jpeg[2..]);
    Ok(out)
}
