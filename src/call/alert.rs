//! Hook für eingehende Anrufe (Klingelton, Benachrichtigung)

use crate::signaling::CallRecord;

/// Wird beim Klingeln und beim Ende des Klingelns aufgerufen
pub trait IncomingCallAlert: Send + Sync {
    fn incoming(&self, record: &CallRecord);
    fn stop(&self);
}

/// Standard: nur Logging
#[derive(Debug, Default)]
pub struct LogAlert;

impl IncomingCallAlert for LogAlert {
    fn incoming(&self, record: &CallRecord) {
        tracing::info!(
            "📞 Incoming {} call from {} ({})",
            if record.is_video { "video" } else { "audio" },
            record.caller_id,
            record.call_id
        );
    }

    fn stop(&self) {
        tracing::debug!("Incoming call alert stopped");
    }
}
