//! Zusammenfassung eines Anrufs als Textzeile

use crate::signaling::CallStatus;

/// `m:ss` unter einer Stunde, sonst `h:mm:ss`
pub fn format_call_duration(duration_ms: u64) -> String {
    let total = duration_ms / 1000;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Zeile für den Chat-Verlauf, z.B. "📹 Video call • 1:05"
pub fn summary_line(is_video: bool, status: CallStatus, duration_ms: Option<u64>) -> String {
    let icon = if is_video { "📹" } else { "📞" };
    let kind = if is_video { "video" } else { "audio" };

    match status {
        CallStatus::Completed | CallStatus::InProgress => {
            let label = if is_video { "Video call" } else { "Audio call" };
            match duration_ms {
                Some(ms) if ms > 0 => format!("{} {} • {}", icon, label, format_call_duration(ms)),
                _ => format!("{} {}", icon, label),
            }
        }
        CallStatus::Missed => format!("{} Missed {} call", icon, kind),
        CallStatus::Declined => format!("{} Declined {} call", icon, kind),
        CallStatus::Error => format!("{} Failed {} call", icon, kind),
        CallStatus::Ringing | CallStatus::Answered => {
            format!("{} Ongoing {} call", icon, kind)
        }
    }
}
