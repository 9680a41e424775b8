use tracing::error;

/// Operator notification on a hard trip. Presentation is up to the
/// implementation.
pub trait Alert: Send {
    fn raise_alert(&mut self, cause: &str);
}

pub fn alert_text(cause: &str) -> String {
    format!("{cause} above expected level, ramping down voltages and terminating any scans")
}

/// Writes the alert to the log at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlert;

impl Alert for LogAlert {
    fn raise_alert(&mut self, cause: &str) {
        error!("{}", alert_text(cause));
    }
}
