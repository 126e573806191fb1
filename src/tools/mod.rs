pub mod error;

use std::time::{Duration, SystemTime};

/// Offset between the NTP epoch (1900-01-01) and the Unix epoch (1970-01-01).
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// Convert an NTP seconds counter (FDT `Expires` attribute) to a `SystemTime`.
///
/// Returns `None` for timestamps before the Unix epoch.
pub fn ntp_to_system_time(ntp_seconds: u64) -> Option<SystemTime> {
    let unix = ntp_seconds.checked_sub(NTP_UNIX_OFFSET)?;
    Some(SystemTime::UNIX_EPOCH + Duration::from_secs(unix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ntp_conversion() {
        // 2208988800 is the Unix epoch expressed in NTP seconds
        assert_eq!(ntp_to_system_time(2_208_988_800), Some(SystemTime::UNIX_EPOCH));
        assert_eq!(
            ntp_to_system_time(2_208_988_800 + 3600),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(3600))
        );
        assert_eq!(ntp_to_system_time(0), None);
    }
}
