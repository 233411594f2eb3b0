//! Promotion of a complete staging file to its permanent name.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{error, info};

use super::session::UploadSession;
use crate::errors::UploadError;
use crate::metrics::{FINALIZATIONS_TOTAL, FINALIZE_DURATION_SECONDS};
use crate::storage::backend::StorageBackend;

/// Performs the one-time rename of a staging file.
///
/// Callers must hold the session's exclusive guard and must only call this
/// once every chunk is present; the registry enforces both.
pub struct Finalizer {
    storage: Arc<dyn StorageBackend>,
}

impl Finalizer {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// Promote the staging file of `session` to `<owner>/<filename>`.
    ///
    /// A failure leaves the staging file in place so finalization can be
    /// attempted again.
    pub async fn finalize(&self, session: &UploadSession) -> Result<(), UploadError> {
        let start = Instant::now();
        let result = self
            .storage
            .promote(
                &session.owner,
                &session.filename,
                &session.filename,
                session.layout.total_size,
            )
            .await;
        histogram!(FINALIZE_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                counter!(FINALIZATIONS_TOTAL, "result" => "ok").increment(1);
                info!(
                    session_id = %session.id,
                    owner = %session.owner,
                    filename = %session.filename,
                    size = session.layout.total_size,
                    "upload finalized"
                );
                Ok(())
            }
            Err(e) => {
                counter!(FINALIZATIONS_TOTAL, "result" => "error").increment(1);
                error!(
                    session_id = %session.id,
                    filename = %session.filename,
                    error = %e,
                    "promotion failed; session kept for retry"
                );
                Err(UploadError::IoFailure(e))
            }
        }
    }
}
