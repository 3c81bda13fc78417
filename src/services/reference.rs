//! Ссылки бронирования и производные от них ключи идемпотентности.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::BookingError;
use crate::models::{AdjustmentKind, BookingRequest};

const MAX_REFERENCE_LEN: usize = 64;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceGenerator;

impl ReferenceGenerator {
    /// Клиентская ссылка берётся как есть (после trim), иначе выпускается новая
    /// вида `BK<epoch millis><8 hex>`.
    pub fn generate(&self, client_reference: Option<&str>) -> Result<String, BookingError> {
        match client_reference.map(str::trim) {
            Some(reference) => {
                validate_reference(reference)?;
                Ok(reference.to_string())
            }
            None => Ok(self.mint()),
        }
    }

    fn mint(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string().to_uppercase();
        format!("BK{}{}", Utc::now().timestamp_millis(), &suffix[..8])
    }
}

fn validate_reference(reference: &str) -> Result<(), BookingError> {
    if reference.is_empty() || reference.len() > MAX_REFERENCE_LEN {
        return Err(BookingError::Validation(format!(
            "booking reference must be 1-{} characters",
            MAX_REFERENCE_LEN
        )));
    }
    if !reference
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BookingError::Validation(format!(
            "booking reference '{}' contains invalid characters",
            reference
        )));
    }
    Ok(())
}

/// Ключ идемпотентности для изменения ёмкости: повтор того же изменения
/// по той же брони всегда даёт тот же ключ.
pub fn idempotency_key(reference: &str, kind: AdjustmentKind) -> String {
    sha256_hex(format!("{}:{}", reference, kind.as_str().to_lowercase()).as_bytes())
}

/// Отпечаток запроса без самой ссылки. Повтор с той же ссылкой, но другим
/// содержимым, отличается по нему.
pub fn request_hash(request: &BookingRequest) -> Result<String, BookingError> {
    let mut canonical = request.clone();
    canonical.booking_reference = None;
    // валюта в черновике хранится в верхнем регистре
    canonical.currency = canonical.currency.map(|c| c.to_uppercase());
    let bytes = serde_json::to_vec(&canonical)
        .map_err(|e| BookingError::Internal(format!("failed to serialize request: {}", e)))?;
    Ok(sha256_hex(&bytes))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
