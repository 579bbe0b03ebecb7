//! Forced configuration reload signal

use tokio::signal::unix::SignalKind;

use crate::error::ResmgrError;

/// Resolve a reload signal name. An empty name or one starting with
/// `disable` turns reloading off.
pub fn parse_reload_signal(name: &str) -> Result<Option<SignalKind>, ResmgrError> {
    let trimmed = name.trim();
    if trimmed.is_empty() || trimmed.to_ascii_lowercase().starts_with("disable") {
        return Ok(None);
    }

    let upper = trimmed.to_ascii_uppercase();
    let short = upper.strip_prefix("SIG").unwrap_or(&upper);
    let kind = match short {
        "HUP" => SignalKind::hangup(),
        "USR1" => SignalKind::user_defined1(),
        "USR2" => SignalKind::user_defined2(),
        "INT" => SignalKind::interrupt(),
        "TERM" => SignalKind::terminate(),
        "QUIT" => SignalKind::quit(),
        "ALRM" => SignalKind::alarm(),
        "WINCH" => SignalKind::window_change(),
        _ => return Err(ResmgrError::InvalidSignal(name.to_string())),
    };

    Ok(Some(kind))
}
