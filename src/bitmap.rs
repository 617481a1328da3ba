//! Bitmap validation and dispatch
//!
//! Print jobs arrive as already-packed 1-bit monochrome bitmaps: MSB-first,
//! row-major top-to-bottom, `1` = print. Frames are only forwarded to live
//! printer sessions; there is no offline cache for bitmaps.

use base64::Engine;
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::PrintBitmapRequest;
use crate::state::AppState;
use crate::wire::ServerFrame;

/// Maximum decoded bitmap payload
pub const MAX_BITMAP_SIZE_BYTES: usize = 50 * 1024;
/// Pixel width of 58mm thermal paper
pub const STANDARD_WIDTH_58MM: u32 = 384;
/// Pixel width of 80mm thermal paper
pub const STANDARD_WIDTH_80MM: u32 = 576;

/// Validate bitmap dimensions against printer constraints
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), CoreError> {
    if width == 0 || height == 0 {
        return Err(CoreError::InvalidBitmap(format!(
            "dimensions must be positive, got {width}x{height}"
        )));
    }
    if width % 8 != 0 {
        return Err(CoreError::InvalidBitmap(format!(
            "width must be a multiple of 8, got {width}"
        )));
    }
    if width > STANDARD_WIDTH_80MM {
        return Err(CoreError::InvalidBitmap(format!(
            "width {width} exceeds maximum printer width {STANDARD_WIDTH_80MM}"
        )));
    }
    Ok(())
}

/// Expected packed size in bytes for a bitmap of the given dimensions
pub fn packed_size(width: u32, height: u32) -> usize {
    (width as usize * height as usize) / 8
}

/// Validate a print request and return the decoded payload length
fn validate_request(request: &PrintBitmapRequest) -> Result<usize, CoreError> {
    validate_dimensions(request.width, request.height)?;

    let data = base64::engine::general_purpose::STANDARD
        .decode(&request.data)
        .map_err(|e| CoreError::InvalidBitmap(format!("invalid base64 data: {e}")))?;

    if data.len() > MAX_BITMAP_SIZE_BYTES {
        return Err(CoreError::InvalidBitmap(format!(
            "bitmap payload {} bytes exceeds maximum {MAX_BITMAP_SIZE_BYTES}",
            data.len()
        )));
    }

    let expected = packed_size(request.width, request.height);
    if data.len() != expected {
        return Err(CoreError::InvalidBitmap(format!(
            "payload is {} bytes, expected {expected} for {}x{}",
            data.len(),
            request.width,
            request.height
        )));
    }

    Ok(data.len())
}

/// Dispatch a bitmap to a printer's live sessions
///
/// Returns the number of sessions reached. Validation failures and offline
/// printers are errors to the caller; nothing is cached.
pub async fn dispatch_bitmap(
    state: &AppState,
    printer_id: Uuid,
    request: &PrintBitmapRequest,
) -> Result<usize, CoreError> {
    validate_request(request)?;

    state
        .db
        .get_printer(printer_id)
        .await?
        .ok_or(CoreError::RecipientNotFound(printer_id))?;

    if !state.registry.is_connected(printer_id).await {
        return Err(CoreError::RecipientNotConnected(printer_id));
    }

    let frame = ServerFrame::PrintBitmap {
        width: request.width,
        height: request.height,
        data: request.data.clone(),
        caption: request.caption.clone(),
    };

    let delivered = state.registry.broadcast(printer_id, &frame).await;
    if delivered == 0 {
        return Err(CoreError::SendFailed(format!(
            "no session accepted bitmap for printer {printer_id}"
        )));
    }
    Ok(delivered)
}
